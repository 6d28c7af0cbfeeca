//! End-to-end scenarios driving a live runtime over loopback sockets with
//! a plain std TCP client.

use byteorder::{ByteOrder, LittleEndian};
use std::any::Any;
use std::io::{ErrorKind, Read, Write};
use std::net::TcpStream;
use std::time::{Duration, Instant};

use quark::crypto::{self, EncryptionMode, KeyExchange};
use tachyon::catalog::BoxedBody;
use tachyon::connection::Authority;
use tachyon::packet::control::{ControlPacket, ControlType, ReasonCode, CONTROL_MAGIC};
use tachyon::packet::handshake::{HandshakePacket, HANDSHAKE_MAGIC};
use tachyon::packet::{PacketError, PacketFlags, RawPacket};
use tachyon::runtime::{RuntimeBuilder, RuntimeConfig, ServerHandle};
use tachyon::throttle::LimiterConfig;

const TEXT_MAGIC: u32 = 0x5454_5800;
const OP_ECHO: u16 = 0x0001;
const OP_SLEEPY: u16 = 0x0002;
const OP_ADMIN: u16 = 0x0003;

#[derive(Debug)]
struct Text256(Vec<u8>);

impl tachyon::catalog::PacketBody for Text256 {
    fn magic(&self) -> u32 {
        TEXT_MAGIC
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

fn text_deserializer(packet: &RawPacket) -> Result<BoxedBody, PacketError> {
    if packet.payload.len() > 256 {
        return Err(PacketError::Malformed("text over 256 bytes"));
    }

    Ok(Box::new(Text256(packet.payload.clone())))
}

fn base_config() -> RuntimeConfig {
    let mut config = RuntimeConfig::default();
    config.port = 0;
    config.worker_threads = 2;
    // Keep periodic traffic out of the scenario frames
    config.heartbeat_interval = Duration::from_secs(120);
    config.ingress_timeout = Duration::from_secs(120);
    config
}

fn start_server(config: RuntimeConfig) -> ServerHandle {
    let mut builder = RuntimeBuilder::new(config);

    builder.register_packet(TEXT_MAGIC, text_deserializer).unwrap();

    builder
        .register_handler(OP_ECHO, "echo", Authority::None, None, |ctx| {
            let text = ctx
                .body
                .and_then(|body| body.as_any().downcast_ref::<Text256>())
                .ok_or_else(|| {
                    tachyon::dispatch::router::HandlerError::new(
                        ReasonCode::MalformedPacket,
                        "echo expects a text packet",
                    )
                })?;

            let reply = match &text.0[..] {
                b"ping" => b"pong".to_vec(),
                // Large-response probe used by the compression scenario
                b"big" => vec![7u8; 4096],
                other => other.to_vec(),
            };

            Ok(Some(RawPacket::new(TEXT_MAGIC, OP_ECHO, reply)))
        })
        .unwrap();

    builder
        .register_handler(
            OP_SLEEPY,
            "sleepy",
            Authority::None,
            Some(Duration::from_millis(150)),
            |_| {
                std::thread::sleep(Duration::from_millis(600));
                Ok(Some(RawPacket::new(TEXT_MAGIC, OP_SLEEPY, b"too late".to_vec())))
            },
        )
        .unwrap();

    builder
        .register_handler(OP_ADMIN, "admin_only", Authority::Admin, None, |_| Ok(None))
        .unwrap();

    builder.build().bind().unwrap().spawn()
}

fn connect(handle: &ServerHandle) -> TcpStream {
    let stream = TcpStream::connect(handle.local_addr()).unwrap();
    stream.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    stream.set_nodelay(true).unwrap();
    stream
}

fn send_packet(stream: &mut TcpStream, packet: &RawPacket) {
    let body = packet.encode().unwrap();

    let mut frame = vec![0u8; 2];
    LittleEndian::write_u16(&mut frame, (body.len() + 2) as u16);
    frame.extend_from_slice(&body);

    stream.write_all(&frame).unwrap();
}

fn read_frame(stream: &mut TcpStream) -> Option<Vec<u8>> {
    let mut header = [0u8; 2];

    match stream.read_exact(&mut header) {
        Ok(()) => (),
        Err(err)
            if err.kind() == ErrorKind::UnexpectedEof
                || err.kind() == ErrorKind::ConnectionReset =>
        {
            return None;
        }
        Err(err) => panic!("Frame read failed: {}", err),
    }

    let frame_len = LittleEndian::read_u16(&header) as usize;
    assert!(frame_len >= 2);

    let mut body = vec![0u8; frame_len - 2];
    stream.read_exact(&mut body).unwrap();
    Some(body)
}

fn read_packet(stream: &mut TcpStream) -> RawPacket {
    let body = read_frame(stream).expect("Connection closed while expecting a packet");
    RawPacket::decode(&body).unwrap()
}

fn read_control(stream: &mut TcpStream) -> ControlPacket {
    let packet = read_packet(stream);
    assert_eq!(packet.header.magic, CONTROL_MAGIC);
    ControlPacket::decode(&packet.payload).unwrap()
}

fn text_packet(opcode: u16, payload: &[u8], sequence: u32) -> RawPacket {
    RawPacket::new(TEXT_MAGIC, opcode, payload.to_vec()).with_sequence(sequence)
}

#[test]
fn test_happy_path_echo() {
    let handle = start_server(base_config());
    let mut stream = connect(&handle);

    let started = Instant::now();
    send_packet(&mut stream, &text_packet(OP_ECHO, b"ping", 1));

    let response = read_packet(&mut stream);
    let elapsed = started.elapsed();

    assert_eq!(response.header.opcode, OP_ECHO);
    assert_eq!(response.header.sequence_id, 1);
    assert_eq!(response.payload, b"pong");
    assert!(elapsed < Duration::from_millis(1000), "echo took {:?}", elapsed);

    handle.shutdown();
}

#[test]
fn test_echo_non_ping_payload() {
    let handle = start_server(base_config());
    let mut stream = connect(&handle);

    send_packet(&mut stream, &text_packet(OP_ECHO, b"hello there", 7));

    let response = read_packet(&mut stream);
    assert_eq!(response.payload, b"hello there");
    assert_eq!(response.header.sequence_id, 7);

    handle.shutdown();
}

#[test]
fn test_rate_limited_fourth_request() {
    let mut config = base_config();
    config.limiter = LimiterConfig {
        max_tokens: 3,
        refill_interval: Duration::from_millis(1000),
        tokens_per_refill: 3,
        lockout: None,
        lockout_threshold: 0,
        lockout_window: Duration::from_secs(10),
    };

    let handle = start_server(config);
    let mut stream = connect(&handle);

    for sequence in 1..=4u32 {
        send_packet(&mut stream, &text_packet(OP_ECHO, b"ping", sequence));
    }

    for _ in 0..3 {
        let response = read_packet(&mut stream);
        assert_eq!(response.header.magic, TEXT_MAGIC);
        assert_eq!(response.payload, b"pong");
    }

    let control = read_control(&mut stream);
    assert_eq!(control.control_type, ControlType::Throttle);
    assert_eq!(control.reason, ReasonCode::RateLimited);
    assert_eq!(control.sequence_id, 4);
    assert!(control.args[0] >= 1 && control.args[0] <= 10);

    handle.shutdown();
}

#[test]
fn test_bad_checksum_rejected_connection_survives() {
    let handle = start_server(base_config());
    let mut stream = connect(&handle);

    // Zero out the checksum field of an otherwise valid packet
    let mut body = text_packet(OP_ECHO, b"ping", 9).encode().unwrap();
    for byte in &mut body[20..24] {
        *byte = 0;
    }

    let mut frame = vec![0u8; 2];
    LittleEndian::write_u16(&mut frame, (body.len() + 2) as u16);
    frame.extend_from_slice(&body);
    stream.write_all(&frame).unwrap();

    let control = read_control(&mut stream);
    assert_eq!(control.control_type, ControlType::Fail);
    assert_eq!(control.reason, ReasonCode::ChecksumMismatch);
    assert_eq!(control.sequence_id, 9);
    assert_eq!(control.args[1], u32::from(OP_ECHO));

    // The connection is still serving
    send_packet(&mut stream, &text_packet(OP_ECHO, b"ping", 10));
    assert_eq!(read_packet(&mut stream).payload, b"pong");

    handle.shutdown();
}

#[test]
fn test_admission_cap_third_connection_rejected() {
    let mut config = base_config();
    config.admission.max_connections_per_ip = 2;

    let handle = start_server(config);

    // Prove the first two connections are fully admitted before opening
    // the third
    let mut first = connect(&handle);
    send_packet(&mut first, &text_packet(OP_ECHO, b"ping", 1));
    assert_eq!(read_packet(&mut first).payload, b"pong");

    let mut second = connect(&handle);
    send_packet(&mut second, &text_packet(OP_ECHO, b"ping", 1));
    assert_eq!(read_packet(&mut second).payload, b"pong");

    // The third connects at the TCP level, but its first frame draws the
    // limit rejection and a server-side close
    let mut third = connect(&handle);
    send_packet(&mut third, &text_packet(OP_ECHO, b"ping", 1));

    let control = read_control(&mut third);
    assert_eq!(control.control_type, ControlType::Fail);
    assert_eq!(control.reason, ReasonCode::ConnectionLimit);

    assert!(read_frame(&mut third).is_none(), "server must close the connection");

    // Closing one admitted connection frees a slot
    drop(first);
    std::thread::sleep(Duration::from_millis(200));

    let mut fourth = connect(&handle);
    send_packet(&mut fourth, &text_packet(OP_ECHO, b"ping", 1));
    assert_eq!(read_packet(&mut fourth).payload, b"pong");

    handle.shutdown();
}

#[test]
fn test_encrypted_round_trip() {
    let mut config = base_config();
    config.encryption_mode = EncryptionMode::Gcm;

    let handle = start_server(config);
    let mut stream = connect(&handle);

    // Key exchange
    let exchange = KeyExchange::generate();
    send_packet(
        &mut stream,
        &HandshakePacket::plain(exchange.public_bytes()).into_raw(1),
    );

    let reply = read_packet(&mut stream);
    assert_eq!(reply.header.magic, HANDSHAKE_MAGIC);

    let server_hello =
        HandshakePacket::decode(&reply.payload, reply.has_flag(PacketFlags::SIGNED)).unwrap();
    let key = exchange.derive(&server_hello.exchange_key);

    // Encrypted request
    let sealed = crypto::seal(EncryptionMode::Gcm, &key, b"ping").unwrap();
    let mut request = RawPacket::new(TEXT_MAGIC, OP_ECHO, sealed).with_sequence(2);
    request.header.flags.insert(PacketFlags::ENCRYPTED);
    send_packet(&mut stream, &request);

    // Encrypted response
    let response = read_packet(&mut stream);
    assert_eq!(response.header.magic, TEXT_MAGIC);
    assert!(response.has_flag(PacketFlags::ENCRYPTED));
    assert_ne!(response.payload, b"pong");

    let plain = crypto::open(EncryptionMode::Gcm, &key, &response.payload).unwrap();
    assert_eq!(plain, b"pong");

    handle.shutdown();
}

#[test]
fn test_encrypted_flag_without_handshake_rejected() {
    let mut config = base_config();
    config.encryption_mode = EncryptionMode::Gcm;
    // Generous handshake window so the rejection comes from the pipeline,
    // not the timeout
    config.handshake_timeout = Duration::from_secs(60);

    let handle = start_server(config);
    let mut stream = connect(&handle);

    let key = [3u8; 32];
    let sealed = crypto::seal(EncryptionMode::Gcm, &key, b"ping").unwrap();
    let mut request = RawPacket::new(TEXT_MAGIC, OP_ECHO, sealed).with_sequence(1);
    request.header.flags.insert(PacketFlags::ENCRYPTED);
    send_packet(&mut stream, &request);

    let control = read_control(&mut stream);
    assert_eq!(control.reason, ReasonCode::HandshakeRequired);

    handle.shutdown();
}

#[test]
fn test_handler_timeout_and_recovery() {
    let handle = start_server(base_config());
    let mut stream = connect(&handle);

    let started = Instant::now();
    send_packet(&mut stream, &text_packet(OP_SLEEPY, b"", 5));

    let control = read_control(&mut stream);
    let elapsed = started.elapsed();

    assert_eq!(control.control_type, ControlType::Fail);
    assert_eq!(control.reason, ReasonCode::Timeout);
    assert_eq!(control.sequence_id, 5);

    // The budget is 150 ms and the handler sleeps 600 ms: the rejection
    // must arrive while the handler is still sleeping
    assert!(elapsed < Duration::from_millis(500), "timeout took {:?}", elapsed);

    // The late result is discarded and the connection keeps serving
    send_packet(&mut stream, &text_packet(OP_ECHO, b"ping", 6));
    let response = read_packet(&mut stream);
    assert_eq!(response.payload, b"pong");
    assert_eq!(response.header.sequence_id, 6);

    handle.shutdown();
}

#[test]
fn test_unauthorized_opcode_rejected() {
    let handle = start_server(base_config());
    let mut stream = connect(&handle);

    send_packet(&mut stream, &text_packet(OP_ADMIN, b"", 3));

    let control = read_control(&mut stream);
    assert_eq!(control.control_type, ControlType::Fail);
    assert_eq!(control.reason, ReasonCode::Unauthorized);
    assert_eq!(control.args[1], u32::from(OP_ADMIN));

    handle.shutdown();
}

#[test]
fn test_unknown_opcode_rejected() {
    let handle = start_server(base_config());
    let mut stream = connect(&handle);

    send_packet(&mut stream, &text_packet(0x0077, b"", 2));

    let control = read_control(&mut stream);
    assert_eq!(control.reason, ReasonCode::UnsupportedOpcode);
    assert_eq!(control.args[1], 0x0077);

    handle.shutdown();
}

#[test]
fn test_unknown_magic_rejected() {
    let handle = start_server(base_config());
    let mut stream = connect(&handle);

    send_packet(
        &mut stream,
        &RawPacket::new(0x0bad_0bad, OP_ECHO, b"ping".to_vec()).with_sequence(8),
    );

    let control = read_control(&mut stream);
    assert_eq!(control.reason, ReasonCode::UnknownMagic);
    assert_eq!(control.sequence_id, 8);

    handle.shutdown();
}

#[test]
fn test_ping_control_answered_with_pong() {
    let handle = start_server(base_config());
    let mut stream = connect(&handle);

    let mut ping = ControlPacket::new(
        ControlType::Ping,
        ReasonCode::None,
        tachyon::packet::control::SuggestedAction::None,
    );
    ping.sequence_id = 42;

    send_packet(&mut stream, &ping.into_raw());

    let pong = read_control(&mut stream);
    assert_eq!(pong.control_type, ControlType::Pong);
    assert_eq!(pong.sequence_id, 42);

    handle.shutdown();
}

#[test]
fn test_per_connection_response_order() {
    let handle = start_server(base_config());
    let mut stream = connect(&handle);

    for sequence in 1..=20u32 {
        let payload = format!("msg-{}", sequence);
        send_packet(&mut stream, &text_packet(OP_ECHO, payload.as_bytes(), sequence));
    }

    for sequence in 1..=20u32 {
        let response = read_packet(&mut stream);
        assert_eq!(response.header.sequence_id, sequence);
        assert_eq!(response.payload, format!("msg-{}", sequence).as_bytes());
    }

    handle.shutdown();
}

#[test]
fn test_graceful_shutdown_notifies_clients() {
    let handle = start_server(base_config());
    let mut stream = connect(&handle);

    // Make sure the connection is fully accepted first
    send_packet(&mut stream, &text_packet(OP_ECHO, b"ping", 1));
    assert_eq!(read_packet(&mut stream).payload, b"pong");

    handle.shutdown();

    let control = read_control(&mut stream);
    assert_eq!(control.control_type, ControlType::Shutdown);
    assert_eq!(control.reason, ReasonCode::ShuttingDown);

    assert!(read_frame(&mut stream).is_none());
}

#[test]
fn test_large_compressible_response_is_compressed() {
    let handle = start_server(base_config());
    let mut stream = connect(&handle);

    // Ask for a large, highly compressible response; the wrap stage should
    // shrink it on the wire
    send_packet(&mut stream, &text_packet(OP_ECHO, b"big", 1));

    let response = read_packet(&mut stream);
    assert!(response.has_flag(PacketFlags::COMPRESSED));
    assert!(response.payload.len() < 4096);

    let plain = tachyon::compress::decompress(&response.payload).unwrap();
    assert_eq!(plain, vec![7u8; 4096]);

    handle.shutdown();
}
