//! Synthetic Ethernet/IPv4/TCP framing
//!
//! None of these headers were observed on the wire. Addresses come from the
//! connection key so every (pid, fd) maps to a stable 4-tuple:
//!
//! - local host: `10.<pid bits 16..24>.<pid bits 8..16>.<pid bits 0..8>`,
//!   port `1024 + fd % 64512`
//! - remote host: `192.0.2.1:443` (TEST-NET-1, never routable)
//! - MAC addresses carry the locally administered bit.

use std::net::Ipv4Addr;

use etherparse::PacketBuilder;

use crate::errors::{Result, TlsTraceError};
use crate::event_processing::ConnectionKey;

pub const ETHERNET_HEADER_LEN: usize = 14;
pub const IPV4_HEADER_LEN: usize = 20;
pub const TCP_HEADER_LEN: usize = 20;
pub const FRAME_OVERHEAD: usize = ETHERNET_HEADER_LEN + IPV4_HEADER_LEN + TCP_HEADER_LEN;

pub const REMOTE_ADDR: Ipv4Addr = Ipv4Addr::new(192, 0, 2, 1);
pub const REMOTE_PORT: u16 = 443;

const TTL: u8 = 64;
const WINDOW: u16 = 65_535;

pub mod tcp_flags {
    pub const FIN: u8 = 0x01;
    pub const SYN: u8 = 0x02;
    pub const PSH: u8 = 0x08;
    pub const ACK: u8 = 0x10;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Endpoint {
    pub mac: [u8; 6],
    pub addr: Ipv4Addr,
    pub port: u16,
}

impl Endpoint {
    /// The instrumented process's side of the connection.
    pub fn local(key: ConnectionKey) -> Self {
        let [_, a, b, c] = key.pid.to_be_bytes();
        Self {
            mac: [0x02, 0x00, 0x0a, a, b, c],
            addr: Ipv4Addr::new(10, a, b, c),
            port: 1024 + (key.fd % 64_512) as u16,
        }
    }

    pub fn remote() -> Self {
        let [a, b, c, d] = REMOTE_ADDR.octets();
        Self {
            mac: [0x02, 0x00, a, b, c, d],
            addr: REMOTE_ADDR,
            port: REMOTE_PORT,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Segment<'a> {
    pub src: &'a Endpoint,
    pub dst: &'a Endpoint,
    pub seq: u32,
    pub ack: u32,
    pub flags: u8,
    pub payload: &'a [u8],
}

/// Serialize one segment as a complete Ethernet frame with valid IPv4 and
/// TCP checksums.
pub fn build_frame(segment: &Segment<'_>) -> Result<Vec<u8>> {
    let mut builder = PacketBuilder::ethernet2(segment.src.mac, segment.dst.mac)
        .ipv4(segment.src.addr.octets(), segment.dst.addr.octets(), TTL)
        .tcp(segment.src.port, segment.dst.port, segment.seq, WINDOW);
    if segment.flags & tcp_flags::SYN != 0 {
        builder = builder.syn();
    }
    if segment.flags & tcp_flags::ACK != 0 {
        builder = builder.ack(segment.ack);
    }
    if segment.flags & tcp_flags::PSH != 0 {
        builder = builder.psh();
    }
    if segment.flags & tcp_flags::FIN != 0 {
        builder = builder.fin();
    }

    let mut frame = Vec::with_capacity(builder.size(segment.payload.len()));
    builder
        .write(&mut frame, segment.payload)
        .map_err(|e| TlsTraceError::CaptureFormat {
            message: format!("building frame: {}", e),
        })?;
    Ok(frame)
}

/// Deterministic initial sequence number for one side of a generation.
pub fn initial_sequence(key: ConnectionKey, generation: u64, remote: bool) -> u32 {
    // FNV-1a over the identity; stable across runs so captures diff cleanly.
    let mut hash: u32 = 0x811c_9dc5;
    let bytes = key
        .pid
        .to_be_bytes()
        .into_iter()
        .chain(key.fd.to_be_bytes())
        .chain(generation.to_be_bytes())
        .chain([remote as u8]);
    for byte in bytes {
        hash ^= u32::from(byte);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}
