//! End-to-end pipeline test: segments in, artifacts out.
//!
//! Drives a small reordered FTP session through the public API and checks
//! the persisted conversation, per-direction streams, and the harvested
//! credential record.

use seine_core::config::RuntimeConfig;
use seine_core::conntrack::segment::{ACK, FIN, SYN};
use seine_core::{Assembler, BidiFactory, ConnPool, FlowId, Segment, Stats};

use std::fs;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

fn scratch(tag: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("seine-e2e-{}-{}", tag, std::process::id()));
    let _ = fs::remove_dir_all(&dir);
    dir
}

fn seg(seq: u32, flags: u8, payload: &'static [u8]) -> Segment<'static> {
    Segment::new(seq, 0, flags, payload, Instant::now())
}

#[test]
fn reordered_ftp_session_end_to_end() {
    let root = scratch("ftp");
    let config = RuntimeConfig {
        out: root.clone(),
        ..RuntimeConfig::default()
    };

    let stats = Arc::new(Stats::new());
    let pool = Arc::new(ConnPool::new(config.max_connections));
    let factory = Arc::new(BidiFactory::new(&config, stats.clone()));
    let mut asm = Assembler::new(pool.clone(), factory.clone(), &config, stats.clone());

    let client: SocketAddr = "192.0.2.10:49152".parse().unwrap();
    let server: SocketAddr = "192.0.2.20:21".parse().unwrap();
    let c2s = FlowId::new(client, server);
    let s2c = c2s.reverse();

    asm.assemble(c2s, seg(1000, SYN, b""));
    asm.assemble(s2c, seg(7000, SYN | ACK, b""));

    asm.assemble(s2c, seg(7001, ACK, b"220 FTP ready\r\n"));
    // the PASS line arrives before the USER line; reassembly reorders
    asm.assemble(c2s, seg(1013, ACK, b"PASS hunter2\r\n"));
    asm.assemble(c2s, seg(1001, ACK, b"USER alice\r\n"));
    asm.assemble(s2c, seg(7016, ACK, b"331 Please specify the password.\r\n"));
    asm.assemble(s2c, seg(7050, ACK, b"230 Login successful.\r\n"));

    asm.assemble(c2s, seg(1027, FIN | ACK, b""));
    asm.assemble(s2c, seg(7073, FIN | ACK, b""));

    // both halves closed: the connection left the pool and the readers
    // were handed end-of-stream
    assert!(pool.is_empty());
    factory.wait();
    assert_eq!(factory.active_readers(), 0);

    let conv = fs::read(
        root.join("tcpConnections")
            .join("ftp")
            .join("192.0.2.10:49152-192.0.2.20:21.bin"),
    )
    .unwrap();
    let conv_text = String::from_utf8_lossy(&conv);
    assert!(conv_text.contains("220 FTP ready"));
    assert!(conv_text.contains("USER alice\r\nPASS hunter2"));
    assert!(conv_text.contains("230 Login successful"));

    let c2s_stream = fs::read(
        root.join("tcpStreams")
            .join("ftp")
            .join("192.0.2.10:49152-192.0.2.20:21.bin"),
    )
    .unwrap();
    assert_eq!(c2s_stream, b"USER alice\r\nPASS hunter2\r\n");

    let s2c_stream = fs::read(
        root.join("tcpStreams")
            .join("ftp")
            .join("192.0.2.20:21-192.0.2.10:49152.bin"),
    )
    .unwrap();
    assert_eq!(
        s2c_stream,
        b"220 FTP ready\r\n331 Please specify the password.\r\n230 Login successful.\r\n"
            .as_slice()
    );

    let creds = fs::read_to_string(root.join("credentials.jsonl")).unwrap();
    assert!(creds.contains("\"user\":\"alice\""));
    assert!(creds.contains("\"password\":\"hunter2\""));
    assert!(creds.contains("\"service\":\"ftp\""));

    let snap = stats.snapshot();
    assert_eq!(snap.connections, 1);
    assert_eq!(snap.connections_closed, 1);
    assert_eq!(snap.saved_connections, 1);
    assert_eq!(snap.saved_streams, 2);
    assert_eq!(snap.credentials, 1);

    let _ = fs::remove_dir_all(&root);
}

#[test]
fn flush_all_drains_unterminated_connections() {
    let root = scratch("drain");
    let config = RuntimeConfig {
        out: root.clone(),
        ..RuntimeConfig::default()
    };

    let stats = Arc::new(Stats::new());
    let pool = Arc::new(ConnPool::new(config.max_connections));
    let factory = Arc::new(BidiFactory::new(&config, stats.clone()));
    let mut asm = Assembler::new(pool.clone(), factory.clone(), &config, stats.clone());

    let client: SocketAddr = "198.51.100.1:50000".parse().unwrap();
    let server: SocketAddr = "198.51.100.2:59999".parse().unwrap();
    let c2s = FlowId::new(client, server);

    asm.assemble(c2s, seg(1000, SYN, b""));
    asm.assemble(c2s, seg(1001, ACK, b"partial upload"));
    // no FIN: the capture just stops

    asm.flush_all();
    assert!(pool.is_empty());
    factory.wait();

    // unknown port, printable payload: classed as utf8
    let stream = fs::read(
        root.join("tcpStreams")
            .join("utf8")
            .join("198.51.100.1:50000-198.51.100.2:59999.bin"),
    )
    .unwrap();
    assert_eq!(stream, b"partial upload");

    let _ = fs::remove_dir_all(&root);
}
