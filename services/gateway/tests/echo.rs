//! End-to-end check of the gateway surface: the Text256 ping handler
//! answered over a real socket.

use byteorder::{ByteOrder, LittleEndian};
use gateway::config::GatewayConfig;
use gateway::handlers::{self, OP_PING, OP_TIME, TEXT_MAGIC};
use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::{Duration, Instant};
use tachyon::packet::RawPacket;
use tachyon::runtime::RuntimeBuilder;

fn send_packet(stream: &mut TcpStream, packet: &RawPacket) {
    let body = packet.encode().unwrap();

    let mut frame = vec![0u8; 2];
    LittleEndian::write_u16(&mut frame, (body.len() + 2) as u16);
    frame.extend_from_slice(&body);

    stream.write_all(&frame).unwrap();
}

fn read_packet(stream: &mut TcpStream) -> RawPacket {
    let mut header = [0u8; 2];
    stream.read_exact(&mut header).unwrap();

    let frame_len = LittleEndian::read_u16(&header) as usize;
    let mut body = vec![0u8; frame_len - 2];
    stream.read_exact(&mut body).unwrap();

    RawPacket::decode(&body).unwrap()
}

#[test]
fn test_text256_ping_pong() {
    let mut config = GatewayConfig::default();
    config.server.port = 0;
    config.server.worker_threads = 2;
    config.server.heartbeat_interval_ms = 60_000;

    let mut builder = RuntimeBuilder::new(config.runtime_config().unwrap());
    handlers::install(&mut builder).unwrap();

    let handle = builder.build().bind().unwrap().spawn();

    let mut stream = TcpStream::connect(handle.local_addr()).unwrap();
    stream.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    stream.set_nodelay(true).unwrap();

    let started = Instant::now();

    send_packet(
        &mut stream,
        &RawPacket::new(TEXT_MAGIC, OP_PING, b"ping".to_vec()).with_sequence(1),
    );

    let response = read_packet(&mut stream);
    let elapsed = started.elapsed();

    assert_eq!(response.header.magic, TEXT_MAGIC);
    assert_eq!(response.header.opcode, OP_PING);
    assert_eq!(response.header.sequence_id, 1);
    assert_eq!(response.payload, b"pong");
    assert!(elapsed < Duration::from_millis(1000), "echo took {:?}", elapsed);

    // The time handler reports a plausible application-epoch reading
    send_packet(
        &mut stream,
        &RawPacket::new(TEXT_MAGIC, OP_TIME, Vec::new()).with_sequence(2),
    );

    let response = read_packet(&mut stream);
    assert_eq!(response.header.opcode, OP_TIME);

    let micros: u64 = String::from_utf8(response.payload).unwrap().parse().unwrap();
    assert!(micros > 0);

    handle.shutdown();
}
