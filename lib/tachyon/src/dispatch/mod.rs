//! The dispatch pipeline. Every application frame travels Inbound →
//! PreDispatch → Handler → PostDispatch → Outbound; middleware at each
//! stage may halt the chain with a control verdict. The pipeline runs on
//! worker threads and owns its context outright, so stages are free to
//! move the continuation across threads.

pub mod middleware;
pub mod router;

use crate::catalog::{BoxedBody, PacketCatalog};
use crate::connection::{Authority, ConnectionView};
use crate::packet::control::{ControlPacket, ReasonCode};
use crate::packet::RawPacket;
use quark::logging::{self, Logger};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use router::HandlerTable;

/// Pipeline stages, in execution order. The handler itself sits between
/// PreDispatch and PostDispatch and is provided by the router, not by
/// middleware.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub enum Stage {
    Inbound,
    PreDispatch,
    PostDispatch,
    Outbound,
}

/// Connection mutations requested during dispatch, applied by the network
/// thread when the completion drains. Keeps connection state single-writer.
#[derive(Default, Clone, Debug)]
pub struct Effects {
    pub upgrade_authority: Option<Authority>,
    pub close: bool,
}

/// Addressing for a completion on its way back to the network thread. The
/// generation guards against the slot having been recycled for a newer
/// connection while the handler ran.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Route {
    pub slot: usize,
    pub generation: u32,
    pub connection_id: u64,
}

/// Everything a frame needs while it moves through the pipeline. Owned, so
/// middleware can ship the continuation to another thread.
pub struct DispatchContext {
    pub view: ConnectionView,
    pub packet: RawPacket,
    /// Typed body, decoded by the catalog deserializer at handler entry
    /// (after unwrap, so transformers see the raw payload).
    pub body: Option<BoxedBody>,
    /// Authority demanded by the resolved handler; `None` when the opcode
    /// has no registration.
    pub required_authority: Option<Authority>,
    /// Budget for the remainder of the pipeline.
    pub timeout: Option<Duration>,
    pub cancelled: Arc<AtomicBool>,
    pub effects: Effects,
    pub started: Instant,
    pub log: Logger,
}

impl DispatchContext {
    /// Replaces the in-flight packet, e.g. after a transformer rewrite.
    #[inline]
    pub fn assign_packet(&mut self, packet: RawPacket) {
        self.packet = packet;
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    #[inline]
    pub fn route(&self) -> Route {
        Route {
            slot: self.view.slot,
            generation: self.view.generation,
            connection_id: self.view.id,
        }
    }
}

/// The pipeline's product for one frame.
#[derive(Debug)]
pub enum Verdict {
    /// An application response packet.
    Respond(RawPacket),
    /// A control packet (rejection or status signal).
    Control(ControlPacket),
    /// No response.
    None,
}

pub struct Completion {
    pub route: Route,
    pub verdict: Verdict,
    pub effects: Effects,
}

impl Completion {
    pub fn of(ctx: &DispatchContext, verdict: Verdict) -> Completion {
        Completion {
            route: ctx.route(),
            verdict,
            effects: ctx.effects.clone(),
        }
    }

    /// A control completion addressed without a live context, for stages
    /// that already gave the context away.
    pub fn control(route: Route, control: ControlPacket) -> Completion {
        Completion {
            route,
            verdict: Verdict::Control(control),
            effects: Effects::default(),
        }
    }
}

/// The rest of the chain, handed to each middleware.
pub type Continuation = Box<dyn FnOnce(DispatchContext) -> Completion + Send + 'static>;

/// One pipeline stage participant. `invoke` either calls `next` (possibly
/// on another thread) or halts the chain by producing its own completion.
pub trait Middleware: Send + Sync + 'static {
    fn stage(&self) -> Stage;
    fn order(&self) -> i32;
    fn name(&self) -> &'static str;
    fn invoke(&self, ctx: DispatchContext, next: Continuation) -> Completion;
}

/// An ordered middleware chain terminating in typed-body decode and the
/// opcode router. A cheap-to-clone handle; continuations moving across
/// threads keep the shared chain alive.
#[derive(Clone)]
pub struct Pipeline {
    inner: Arc<PipelineInner>,
}

struct PipelineInner {
    chain: Vec<Arc<dyn Middleware>>,
    router: Arc<HandlerTable>,
    catalog: Arc<PacketCatalog>,
}

impl Pipeline {
    /// Builds a pipeline. Middleware are sorted by stage, then by their
    /// declared order within the stage.
    pub fn new(
        mut chain: Vec<Arc<dyn Middleware>>,
        router: Arc<HandlerTable>,
        catalog: Arc<PacketCatalog>,
    ) -> Pipeline {
        chain.sort_by_key(|mw| (mw.stage(), mw.order()));

        Pipeline {
            inner: Arc::new(PipelineInner {
                chain,
                router,
                catalog,
            }),
        }
    }

    /// Runs the full chain for one frame.
    pub fn execute(&self, ctx: DispatchContext) -> Completion {
        run_from(self.inner.clone(), 0, ctx)
    }

    /// Attributes of the handler registered for an opcode, used to seed
    /// the context before the chain runs.
    pub fn handler_attrs(&self, opcode: u16) -> Option<(Authority, Option<Duration>)> {
        self.inner
            .router
            .resolve(opcode)
            .map(|entry| (entry.required_authority, entry.timeout))
    }

    /// Stage/order/name listing, for startup logging.
    pub fn describe(&self) -> Vec<(Stage, i32, &'static str)> {
        self.inner
            .chain
            .iter()
            .map(|mw| (mw.stage(), mw.order(), mw.name()))
            .collect()
    }
}

fn run_from(pipeline: Arc<PipelineInner>, index: usize, mut ctx: DispatchContext) -> Completion {
    if index == pipeline.chain.len() {
        // Typed decode at handler entry, against the unwrapped payload
        if let Some(deserializer) = pipeline.catalog.deserializer(ctx.packet.header.magic) {
            match deserializer(&ctx.packet) {
                Ok(body) => ctx.body = Some(body),
                Err(err) => {
                    logging::debug!(ctx.log, "typed decode failed";
                                    "context" => "dispatch",
                                    "connection_id" => ctx.view.id,
                                    "magic" => ctx.packet.header.magic,
                                    "error" => %err);

                    return Completion::of(
                        &ctx,
                        Verdict::Control(ControlPacket::fail(
                            ReasonCode::MalformedPacket,
                            &ctx.packet.header,
                        )),
                    );
                }
            }
        }

        return pipeline.router.dispatch(ctx);
    }

    let current = pipeline.chain[index].clone();
    let rest = pipeline.clone();

    current.invoke(ctx, Box::new(move |ctx| run_from(rest, index + 1, ctx)))
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::connection::HandshakeState;
    use quark::crypto::EncryptionMode;
    use quark::logging;

    /// A context over a synthetic connection, for middleware tests.
    pub fn context(packet: RawPacket) -> DispatchContext {
        DispatchContext {
            view: ConnectionView {
                id: 1,
                slot: 0,
                generation: 0,
                remote: "127.0.0.1:50000".parse().unwrap(),
                authority: Authority::None,
                key: [7u8; 32],
                mode: EncryptionMode::None,
                handshake: HandshakeState::NotStarted,
            },
            packet,
            body: None,
            required_authority: None,
            timeout: None,
            cancelled: Arc::new(AtomicBool::new(false)),
            effects: Effects::default(),
            started: Instant::now(),
            log: logging::discard(),
        }
    }

    /// A catalog with only the reserved packet types, for pipeline tests
    /// over synthetic magics.
    pub fn reserved_catalog() -> Arc<PacketCatalog> {
        Arc::new(crate::catalog::CatalogBuilder::new().build())
    }
}
