//! Test utilities shared by the integration tests
//!
//! Event builders and capture readers that keep the tests focused on
//! behaviour rather than on event layout details.

#![allow(dead_code)]

use std::fs::File;
use std::path::Path;

use pcap_file::pcap::PcapReader;
use tls_trace_common::{EventKind, SslDataEvent, MAX_DATA_SIZE};

/// Builder for test SslDataEvent instances with a fluent API
pub struct SslEventBuilder {
    event: SslDataEvent,
}

impl SslEventBuilder {
    pub fn new(kind: EventKind) -> Self {
        Self {
            event: SslDataEvent::new().with_kind(kind).with_command(b"curl"),
        }
    }

    pub fn connection(mut self, pid: u32, fd: u32) -> Self {
        self.event = self.event.with_pid(pid).with_tid(pid).with_fd(fd);
        self
    }

    pub fn timestamp(mut self, ts: u64) -> Self {
        self.event = self.event.with_timestamp(ts);
        self
    }

    pub fn command(mut self, cmd: &str) -> Self {
        self.event = self.event.with_command(cmd.as_bytes());
        self
    }

    pub fn payload(mut self, payload: &[u8]) -> Self {
        self.event = self.event.with_payload(payload);
        self
    }

    pub fn declared_len(mut self, len: u32) -> Self {
        self.event = self.event.with_data_len(len);
        self
    }

    pub fn build(self) -> SslDataEvent {
        self.event
    }
}

/// Common test event factories with descriptive names
pub mod events {
    use super::*;

    pub fn read(pid: u32, fd: u32, ts: u64, payload: &[u8]) -> SslDataEvent {
        SslEventBuilder::new(EventKind::DataRead)
            .connection(pid, fd)
            .timestamp(ts)
            .payload(payload)
            .build()
    }

    pub fn write(pid: u32, fd: u32, ts: u64, payload: &[u8]) -> SslDataEvent {
        SslEventBuilder::new(EventKind::DataWrite)
            .connection(pid, fd)
            .timestamp(ts)
            .payload(payload)
            .build()
    }

    pub fn full_read(pid: u32, fd: u32, ts: u64, fill: u8) -> SslDataEvent {
        read(pid, fd, ts, &[fill; MAX_DATA_SIZE])
    }

    pub fn open(pid: u32, fd: u32, ts: u64) -> SslDataEvent {
        SslEventBuilder::new(EventKind::ConnectionOpen)
            .connection(pid, fd)
            .timestamp(ts)
            .build()
    }

    pub fn close(pid: u32, fd: u32, ts: u64) -> SslDataEvent {
        SslEventBuilder::new(EventKind::ConnectionClose)
            .connection(pid, fd)
            .timestamp(ts)
            .build()
    }

    pub fn oversized_read(pid: u32, fd: u32, ts: u64) -> SslDataEvent {
        SslEventBuilder::new(EventKind::DataRead)
            .connection(pid, fd)
            .timestamp(ts)
            .payload(b"garbage")
            .declared_len(MAX_DATA_SIZE as u32 + 1)
            .build()
    }
}

/// TCP view of one synthesized packet
pub struct CapturedSegment {
    pub src_port: u16,
    pub dst_port: u16,
    pub flags: u8,
    pub seq: u32,
    pub payload: Vec<u8>,
}

pub const SYN: u8 = 0x02;
pub const PSH: u8 = 0x08;
pub const FIN: u8 = 0x01;

/// Read every packet back from a capture written by the capture sink.
pub fn read_capture(path: &Path) -> Vec<CapturedSegment> {
    let file = File::open(path).expect("capture file should exist");
    let mut reader = PcapReader::new(file).expect("capture should have a valid header");
    let mut segments = Vec::new();

    while let Some(packet) = reader.next_packet() {
        let packet = packet.expect("packet should decode");
        let data: &[u8] = &packet.data;
        let tcp = &data[14 + 20..];
        segments.push(CapturedSegment {
            src_port: u16::from_be_bytes([tcp[0], tcp[1]]),
            dst_port: u16::from_be_bytes([tcp[2], tcp[3]]),
            seq: u32::from_be_bytes([tcp[4], tcp[5], tcp[6], tcp[7]]),
            flags: tcp[13],
            payload: tcp[20..].to_vec(),
        });
    }
    segments
}

/// Concatenated payload travelling towards `dst_port`.
pub fn stream_towards(segments: &[CapturedSegment], dst_port: u16) -> Vec<u8> {
    segments
        .iter()
        .filter(|segment| segment.dst_port == dst_port)
        .flat_map(|segment| segment.payload.iter().copied())
        .collect()
}
