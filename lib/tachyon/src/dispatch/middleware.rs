//! Canonical middleware shipped with the runtime: rate limiting, payload
//! unwrap/wrap, authentication and the handler timeout budget.

use crate::catalog::{PacketCatalog, TransformContext};
use crate::connection::HandshakeState;
use crate::dispatch::{Completion, Continuation, DispatchContext, Middleware, Stage, Verdict};
use crate::packet::control::{ControlPacket, ReasonCode};
use crate::packet::PacketFlags;
use crate::throttle::{Decision, RequestLimiter};
use quark::crypto::EncryptionMode;
use quark::logging;
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// Responses below this size are not worth compressing.
const COMPRESS_THRESHOLD: usize = 512;

/// Inbound stage, first in line: one token per frame, keyed by the remote
/// address. Denials answer with `THROTTLE/RATE_LIMITED` carrying the retry
/// delay in 100 ms steps.
pub struct RateLimitMiddleware {
    limiter: Arc<RequestLimiter>,
}

impl RateLimitMiddleware {
    pub fn new(limiter: Arc<RequestLimiter>) -> RateLimitMiddleware {
        RateLimitMiddleware { limiter }
    }
}

impl Middleware for RateLimitMiddleware {
    fn stage(&self) -> Stage {
        Stage::Inbound
    }

    fn order(&self) -> i32 {
        0
    }

    fn name(&self) -> &'static str {
        "rate_limit"
    }

    fn invoke(&self, ctx: DispatchContext, next: Continuation) -> Completion {
        match self.limiter.check(ctx.view.remote.ip()) {
            Decision::Allowed { .. } => next(ctx),
            Decision::Denied { retry_after_ms } => {
                logging::debug!(ctx.log, "request rate limited";
                                "context" => "rate_limit",
                                "connection_id" => ctx.view.id,
                                "remote" => %ctx.view.remote,
                                "opcode" => ctx.packet.header.opcode,
                                "retry_after_ms" => retry_after_ms);

                Completion::control(
                    ctx.route(),
                    ControlPacket::throttle(retry_after_ms, &ctx.packet.header),
                )
            }
        }
    }
}

/// Inbound stage: reverses the sender's wrap. Encrypted payloads are
/// decrypted with the connection key and mode, compressed payloads are
/// expanded. A flag demanding a transformer the type never registered is a
/// typed failure, not a crash.
pub struct UnwrapMiddleware {
    catalog: Arc<PacketCatalog>,
}

impl UnwrapMiddleware {
    pub fn new(catalog: Arc<PacketCatalog>) -> UnwrapMiddleware {
        UnwrapMiddleware { catalog }
    }
}

impl Middleware for UnwrapMiddleware {
    fn stage(&self) -> Stage {
        Stage::Inbound
    }

    fn order(&self) -> i32 {
        10
    }

    fn name(&self) -> &'static str {
        "unwrap"
    }

    fn invoke(&self, mut ctx: DispatchContext, next: Continuation) -> Completion {
        let magic = ctx.packet.header.magic;

        if ctx.packet.has_flag(PacketFlags::ENCRYPTED) {
            let decrypt = self
                .catalog
                .transformers(magic)
                .and_then(|set| set.decrypt);

            let decrypt = match decrypt {
                Some(decrypt) => decrypt,
                None => {
                    return reject(&ctx, ReasonCode::CryptoUnsupported);
                }
            };

            if ctx.view.handshake != HandshakeState::Handshaked
                || ctx.view.mode == EncryptionMode::None
            {
                return reject(&ctx, ReasonCode::HandshakeRequired);
            }

            let transform_ctx = TransformContext {
                key: &ctx.view.key,
                mode: ctx.view.mode,
            };

            if decrypt(&mut ctx.packet, &transform_ctx).is_err() {
                logging::debug!(ctx.log, "payload decryption failed";
                                "context" => "unwrap",
                                "connection_id" => ctx.view.id,
                                "remote" => %ctx.view.remote,
                                "opcode" => ctx.packet.header.opcode);

                return reject(&ctx, ReasonCode::DecryptFailed);
            }
        }

        if ctx.packet.has_flag(PacketFlags::COMPRESSED) {
            let decompress = self
                .catalog
                .transformers(magic)
                .and_then(|set| set.decompress);

            let decompress = match decompress {
                Some(decompress) => decompress,
                None => {
                    return reject(&ctx, ReasonCode::CompressionUnsupported);
                }
            };

            let transform_ctx = TransformContext {
                key: &ctx.view.key,
                mode: ctx.view.mode,
            };

            if decompress(&mut ctx.packet, &transform_ctx).is_err() {
                return reject(&ctx, ReasonCode::TransformFailed);
            }
        }

        next(ctx)
    }
}

fn reject(ctx: &DispatchContext, reason: ReasonCode) -> Completion {
    Completion::control(ctx.route(), ControlPacket::fail(reason, &ctx.packet.header))
}

/// Inbound stage, after unwrap: compares connection authority against the
/// handler's requirement. Unknown opcodes pass through for the router to
/// answer.
pub struct AuthMiddleware;

impl Middleware for AuthMiddleware {
    fn stage(&self) -> Stage {
        Stage::Inbound
    }

    fn order(&self) -> i32 {
        20
    }

    fn name(&self) -> &'static str {
        "authentication"
    }

    fn invoke(&self, ctx: DispatchContext, next: Continuation) -> Completion {
        if let Some(required) = ctx.required_authority {
            if ctx.view.authority < required {
                logging::debug!(ctx.log, "insufficient authority";
                                "context" => "authentication",
                                "connection_id" => ctx.view.id,
                                "remote" => %ctx.view.remote,
                                "opcode" => ctx.packet.header.opcode,
                                "have" => ?ctx.view.authority,
                                "need" => ?required);

                return reject(&ctx, ReasonCode::Unauthorized);
            }
        }

        next(ctx)
    }
}

/// PreDispatch stage: runs the remaining pipeline under the handler's time
/// budget on a dedicated pool. On expiry the context is latched cancelled,
/// a `FAIL/TIMEOUT` goes out immediately and the late result is discarded
/// when it eventually lands.
pub struct TimeoutMiddleware {
    timed_pool: threadpool::ThreadPool,
}

impl TimeoutMiddleware {
    pub fn new(timed_pool: threadpool::ThreadPool) -> TimeoutMiddleware {
        TimeoutMiddleware { timed_pool }
    }
}

impl Middleware for TimeoutMiddleware {
    fn stage(&self) -> Stage {
        Stage::PreDispatch
    }

    fn order(&self) -> i32 {
        0
    }

    fn name(&self) -> &'static str {
        "timeout"
    }

    fn invoke(&self, ctx: DispatchContext, next: Continuation) -> Completion {
        let budget = match ctx.timeout {
            Some(budget) => budget,
            None => return next(ctx),
        };

        let route = ctx.route();
        let header = ctx.packet.header.clone();
        let cancelled = ctx.cancelled.clone();
        let log = ctx.log.clone();

        let (tx, rx) = crossbeam_channel::bounded(1);
        let worker_cancelled = cancelled.clone();
        let worker_log = log.clone();

        self.timed_pool.execute(move || {
            let completion = next(ctx);

            if worker_cancelled.load(Ordering::Acquire) {
                logging::debug!(worker_log, "late handler result discarded";
                                "context" => "timeout",
                                "connection_id" => route.connection_id,
                                "opcode" => header_opcode_of(&completion));
                return;
            }

            drop(tx.send(completion));
        });

        match rx.recv_timeout(budget) {
            Ok(completion) => completion,
            Err(_) => {
                cancelled.store(true, Ordering::Release);

                logging::warn!(log, "handler budget expired";
                               "context" => "timeout",
                               "connection_id" => route.connection_id,
                               "opcode" => header.opcode,
                               "budget_ms" => budget.as_millis() as u64);

                Completion::control(route, ControlPacket::fail(ReasonCode::Timeout, &header))
            }
        }
    }
}

fn header_opcode_of(completion: &Completion) -> u16 {
    match &completion.verdict {
        Verdict::Respond(packet) => packet.header.opcode,
        _ => 0,
    }
}

/// PostDispatch stage: timing trace for every dispatched frame.
pub struct TimingMiddleware;

impl Middleware for TimingMiddleware {
    fn stage(&self) -> Stage {
        Stage::PostDispatch
    }

    fn order(&self) -> i32 {
        0
    }

    fn name(&self) -> &'static str {
        "timing"
    }

    fn invoke(&self, ctx: DispatchContext, next: Continuation) -> Completion {
        let started = ctx.started;
        let log = ctx.log.clone();
        let opcode = ctx.packet.header.opcode;
        let connection_id = ctx.view.id;

        let completion = next(ctx);

        let elapsed_us = started.elapsed().as_micros() as u64;

        logging::trace!(log, "frame dispatched";
                        "context" => "timing",
                        "connection_id" => connection_id,
                        "opcode" => opcode,
                        "elapsed_us" => elapsed_us);

        completion
    }
}

/// Outbound stage: wraps the application response on its way out, the
/// mirror of unwrap: compress when worthwhile, then encrypt when the
/// connection has an active cipher. Control packets travel plain; their
/// flags tell the client how to read them.
pub struct WrapMiddleware {
    catalog: Arc<PacketCatalog>,
}

impl WrapMiddleware {
    pub fn new(catalog: Arc<PacketCatalog>) -> WrapMiddleware {
        WrapMiddleware { catalog }
    }
}

impl Middleware for WrapMiddleware {
    fn stage(&self) -> Stage {
        Stage::Outbound
    }

    fn order(&self) -> i32 {
        0
    }

    fn name(&self) -> &'static str {
        "wrap"
    }

    fn invoke(&self, ctx: DispatchContext, next: Continuation) -> Completion {
        let key = ctx.view.key;
        let mode = ctx.view.mode;
        let handshaked = ctx.view.handshake == HandshakeState::Handshaked;
        let log = ctx.log.clone();
        let route = ctx.route();
        let request_header = ctx.packet.header.clone();

        let mut completion = next(ctx);

        if let Verdict::Respond(response) = &mut completion.verdict {
            let transformers = self.catalog.transformers(response.header.magic);

            let transform_ctx = TransformContext { key: &key, mode };

            if response.payload.len() >= COMPRESS_THRESHOLD {
                if let Some(compress) = transformers.and_then(|set| set.compress) {
                    if let Err(err) = compress(response, &transform_ctx) {
                        logging::warn!(log, "response compression failed";
                                       "context" => "wrap",
                                       "connection_id" => route.connection_id,
                                       "error" => ?err);

                        return Completion::control(
                            route,
                            ControlPacket::fail(ReasonCode::TransformFailed, &request_header),
                        );
                    }
                }
            }

            if handshaked && mode != EncryptionMode::None {
                if let Some(encrypt) = transformers.and_then(|set| set.encrypt) {
                    if let Err(err) = encrypt(response, &transform_ctx) {
                        logging::warn!(log, "response encryption failed";
                                       "context" => "wrap",
                                       "connection_id" => route.connection_id,
                                       "error" => ?err);

                        return Completion::control(
                            route,
                            ControlPacket::fail(ReasonCode::TransformFailed, &request_header),
                        );
                    }
                }
            }
        }

        completion
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::CatalogBuilder;
    use crate::connection::Authority;
    use crate::dispatch::router::HandlerTable;
    use crate::dispatch::testing::context;
    use crate::dispatch::Pipeline;
    use crate::packet::{PacketError, RawPacket};
    use crate::throttle::LimiterConfig;
    use std::time::Duration;

    const TEST_MAGIC: u32 = 0x7e57_0001;

    fn opaque_deserializer(
        _packet: &RawPacket,
    ) -> Result<crate::catalog::BoxedBody, PacketError> {
        Ok(Box::new(crate::packet::control::ControlPacket::heartbeat()))
    }

    fn catalog() -> Arc<PacketCatalog> {
        let mut builder = CatalogBuilder::new();
        builder.register(TEST_MAGIC, opaque_deserializer).unwrap();
        builder.with_standard_transformers(TEST_MAGIC).unwrap();
        Arc::new(builder.build())
    }

    fn echo_router() -> Arc<HandlerTable> {
        let mut table = HandlerTable::new();
        table
            .register(0x0001, "echo", Authority::None, None, |ctx| {
                Ok(Some(RawPacket::new(
                    TEST_MAGIC,
                    0x0001,
                    ctx.packet.payload.clone(),
                )))
            })
            .unwrap();
        Arc::new(table)
    }

    #[test]
    fn test_rate_limit_denies_over_budget() {
        let limiter = Arc::new(RequestLimiter::new(LimiterConfig {
            max_tokens: 1,
            refill_interval: Duration::from_secs(60),
            tokens_per_refill: 1,
            lockout: None,
            lockout_threshold: 0,
            lockout_window: Duration::from_secs(10),
        }));

        let pipeline = Pipeline::new(
            vec![Arc::new(RateLimitMiddleware::new(limiter))],
            echo_router(),
            catalog(),
        );

        let first = pipeline.execute(context(RawPacket::new(TEST_MAGIC, 0x0001, Vec::new())));
        assert!(matches!(first.verdict, Verdict::Respond(_)));

        let second = pipeline.execute(context(RawPacket::new(TEST_MAGIC, 0x0001, Vec::new())));
        match second.verdict {
            Verdict::Control(control) => {
                assert_eq!(control.reason, ReasonCode::RateLimited);
                assert!(control.args[0] >= 1);
            }
            other => panic!("Unexpected verdict {:?}", other),
        }
    }

    #[test]
    fn test_auth_rejects_insufficient_authority() {
        let mut table = HandlerTable::new();
        table
            .register(0x0002, "admin_op", Authority::Admin, None, |_| Ok(None))
            .unwrap();

        let pipeline = Pipeline::new(
            vec![Arc::new(AuthMiddleware)],
            Arc::new(table),
            catalog(),
        );

        let mut ctx = context(RawPacket::new(TEST_MAGIC, 0x0002, Vec::new()));
        ctx.required_authority = Some(Authority::Admin);

        let completion = pipeline.execute(ctx);

        match completion.verdict {
            Verdict::Control(control) => assert_eq!(control.reason, ReasonCode::Unauthorized),
            other => panic!("Unexpected verdict {:?}", other),
        }
    }

    #[test]
    fn test_auth_passes_sufficient_authority() {
        let mut table = HandlerTable::new();
        table
            .register(0x0002, "user_op", Authority::User, None, |_| Ok(None))
            .unwrap();

        let pipeline = Pipeline::new(
            vec![Arc::new(AuthMiddleware)],
            Arc::new(table),
            catalog(),
        );

        let mut ctx = context(RawPacket::new(TEST_MAGIC, 0x0002, Vec::new()));
        ctx.required_authority = Some(Authority::User);
        ctx.view.authority = Authority::Admin;

        let completion = pipeline.execute(ctx);

        assert!(matches!(completion.verdict, Verdict::None));
    }

    #[test]
    fn test_unwrap_decrypts_and_decompresses() {
        use crate::catalog::{aes_encrypt, lz4_compress, TransformContext};
        use crate::connection::HandshakeState;

        let pipeline = Pipeline::new(
            vec![Arc::new(UnwrapMiddleware::new(catalog()))],
            echo_router(),
            catalog(),
        );

        let key = [7u8; 32];
        let payload = vec![42u8; 2048];

        // Wrap the request the way a client would: compress, then encrypt
        let mut packet = RawPacket::new(TEST_MAGIC, 0x0001, payload.clone());
        let transform_ctx = TransformContext {
            key: &key,
            mode: EncryptionMode::Gcm,
        };
        lz4_compress(&mut packet, &transform_ctx).unwrap();
        aes_encrypt(&mut packet, &transform_ctx).unwrap();

        let mut ctx = context(packet);
        ctx.view.mode = EncryptionMode::Gcm;
        ctx.view.handshake = HandshakeState::Handshaked;

        let completion = pipeline.execute(ctx);

        match completion.verdict {
            Verdict::Respond(response) => assert_eq!(response.payload, payload),
            other => panic!("Unexpected verdict {:?}", other),
        }
    }

    #[test]
    fn test_unwrap_requires_handshake() {
        let pipeline = Pipeline::new(
            vec![Arc::new(UnwrapMiddleware::new(catalog()))],
            echo_router(),
            catalog(),
        );

        let mut packet = RawPacket::new(TEST_MAGIC, 0x0001, b"x".to_vec());
        packet.header.flags.insert(PacketFlags::ENCRYPTED);

        let completion = pipeline.execute(context(packet));

        match completion.verdict {
            Verdict::Control(control) => {
                assert_eq!(control.reason, ReasonCode::HandshakeRequired)
            }
            other => panic!("Unexpected verdict {:?}", other),
        }
    }

    #[test]
    fn test_unwrap_missing_transformer() {
        use crate::connection::HandshakeState;

        // Catalog without transformers for the magic
        let mut builder = CatalogBuilder::new();
        builder.register(TEST_MAGIC, opaque_deserializer).unwrap();
        let bare_catalog = Arc::new(builder.build());

        let pipeline = Pipeline::new(
            vec![Arc::new(UnwrapMiddleware::new(bare_catalog))],
            echo_router(),
            catalog(),
        );

        let mut packet = RawPacket::new(TEST_MAGIC, 0x0001, b"x".to_vec());
        packet.header.flags.insert(PacketFlags::ENCRYPTED);

        let mut ctx = context(packet);
        ctx.view.mode = EncryptionMode::Gcm;
        ctx.view.handshake = HandshakeState::Handshaked;

        let completion = pipeline.execute(ctx);

        match completion.verdict {
            Verdict::Control(control) => {
                assert_eq!(control.reason, ReasonCode::CryptoUnsupported)
            }
            other => panic!("Unexpected verdict {:?}", other),
        }
    }

    #[test]
    fn test_timeout_budget_expiry() {
        let mut table = HandlerTable::new();
        table
            .register(0x0001, "sleeper", Authority::None, None, |_| {
                std::thread::sleep(Duration::from_millis(400));
                Ok(Some(RawPacket::new(TEST_MAGIC, 0x0001, b"late".to_vec())))
            })
            .unwrap();

        let pipeline = Pipeline::new(
            vec![Arc::new(TimeoutMiddleware::new(threadpool::ThreadPool::new(2)))],
            Arc::new(table),
            catalog(),
        );

        let mut ctx = context(RawPacket::new(TEST_MAGIC, 0x0001, Vec::new()).with_sequence(11));
        ctx.timeout = Some(Duration::from_millis(50));

        let started = std::time::Instant::now();
        let completion = pipeline.execute(ctx);
        let elapsed = started.elapsed();

        // The timeout fires at the budget, not at handler completion
        assert!(elapsed < Duration::from_millis(300));

        match completion.verdict {
            Verdict::Control(control) => {
                assert_eq!(control.reason, ReasonCode::Timeout);
                assert_eq!(control.sequence_id, 11);
            }
            other => panic!("Unexpected verdict {:?}", other),
        }
    }

    #[test]
    fn test_timeout_fast_handler_unaffected() {
        let pipeline = Pipeline::new(
            vec![Arc::new(TimeoutMiddleware::new(threadpool::ThreadPool::new(2)))],
            echo_router(),
            catalog(),
        );

        let mut ctx = context(RawPacket::new(TEST_MAGIC, 0x0001, b"quick".to_vec()));
        ctx.timeout = Some(Duration::from_millis(500));

        let completion = pipeline.execute(ctx);

        match completion.verdict {
            Verdict::Respond(response) => assert_eq!(response.payload, b"quick"),
            other => panic!("Unexpected verdict {:?}", other),
        }
    }

    #[test]
    fn test_wrap_encrypts_response_after_handshake() {
        use crate::connection::HandshakeState;
        use quark::crypto;

        let pipeline = Pipeline::new(
            vec![Arc::new(WrapMiddleware::new(catalog()))],
            echo_router(),
            catalog(),
        );

        let key = [7u8; 32];

        let mut ctx = context(RawPacket::new(TEST_MAGIC, 0x0001, b"secret".to_vec()));
        ctx.view.mode = EncryptionMode::Gcm;
        ctx.view.handshake = HandshakeState::Handshaked;
        ctx.view.key = key;

        let completion = pipeline.execute(ctx);

        match completion.verdict {
            Verdict::Respond(response) => {
                assert!(response.has_flag(PacketFlags::ENCRYPTED));
                assert_ne!(response.payload, b"secret");

                let plain = crypto::open(EncryptionMode::Gcm, &key, &response.payload).unwrap();
                assert_eq!(plain, b"secret");
            }
            other => panic!("Unexpected verdict {:?}", other),
        }
    }

    #[test]
    fn test_wrap_compresses_large_response() {
        let pipeline = Pipeline::new(
            vec![Arc::new(WrapMiddleware::new(catalog()))],
            echo_router(),
            catalog(),
        );

        let payload = vec![3u8; 8192];
        let completion = pipeline.execute(context(RawPacket::new(TEST_MAGIC, 0x0001, payload)));

        match completion.verdict {
            Verdict::Respond(response) => {
                assert!(response.has_flag(PacketFlags::COMPRESSED));
                assert!(response.payload.len() < 8192);

                let plain = crate::compress::decompress(&response.payload).unwrap();
                assert_eq!(plain, vec![3u8; 8192]);
            }
            other => panic!("Unexpected verdict {:?}", other),
        }
    }

    #[test]
    fn test_wrap_leaves_small_plain_response_alone() {
        let pipeline = Pipeline::new(
            vec![Arc::new(WrapMiddleware::new(catalog()))],
            echo_router(),
            catalog(),
        );

        let completion = pipeline.execute(context(RawPacket::new(TEST_MAGIC, 0x0001, b"tiny".to_vec())));

        match completion.verdict {
            Verdict::Respond(response) => {
                assert!(!response.has_flag(PacketFlags::COMPRESSED));
                assert!(!response.has_flag(PacketFlags::ENCRYPTED));
                assert_eq!(response.payload, b"tiny");
            }
            other => panic!("Unexpected verdict {:?}", other),
        }
    }
}
