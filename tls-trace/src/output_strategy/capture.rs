//! Synthesized packet capture
//!
//! Reassembled plaintext is wrapped in fabricated Ethernet/IPv4/TCP framing
//! and appended to one classic pcap file (nanosecond timestamps). Every
//! connection generation becomes its own TCP flow with a handshake, data
//! segments and a FIN exchange. Addresses, ports, sequence numbers and MACs
//! are derived from the connection key and do not describe the real network
//! path.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use log::{debug, info, trace, warn};
use pcap_file::pcap::{PcapHeader, PcapPacket, PcapWriter};
use pcap_file::{DataLink, Endianness, PcapError, TsResolution};

use crate::errors::{Result, TlsTraceError};
use crate::event_processing::{
    ConnectionInfo, ConnectionKey, ConnectionMeta, Direction, StreamRecord,
};
use crate::output_strategy::frame::{
    build_frame, initial_sequence, tcp_flags, Endpoint, Segment,
};
use crate::output_strategy::{retry_io, RetryingWriter, Sink};

pub const SNAPLEN: u32 = 262_144;

type CaptureWriter = PcapWriter<BufWriter<RetryingWriter<File>>>;

fn frame(
    src: &Endpoint,
    dst: &Endpoint,
    seq: u32,
    ack: u32,
    flags: u8,
    payload: &[u8],
) -> Result<Vec<u8>> {
    build_frame(&Segment {
        src,
        dst,
        seq,
        ack,
        flags,
        payload,
    })
}

fn capture_header() -> PcapHeader {
    PcapHeader {
        version_major: 2,
        version_minor: 4,
        ts_correction: 0,
        ts_accuracy: 0,
        snaplen: SNAPLEN,
        datalink: DataLink::ETHERNET,
        ts_resolution: TsResolution::NanoSecond,
        endianness: Endianness::native(),
    }
}

fn capture_error(context: &str, error: PcapError) -> TlsTraceError {
    match error {
        PcapError::IoError(source) => TlsTraceError::sink_io(context, source),
        other => TlsTraceError::CaptureFormat {
            message: format!("{}: {}", context, other),
        },
    }
}

/// One connection generation rendered as a TCP flow.
#[derive(Debug)]
struct TcpFlow {
    local: Endpoint,
    remote: Endpoint,
    local_isn: u32,
    remote_isn: u32,
    /// Payload bytes written so far, indexed by direction.
    sent: [u64; 2],
    handshake_done: bool,
}

impl TcpFlow {
    fn new(meta: &ConnectionMeta) -> Self {
        Self {
            local: Endpoint::local(meta.key),
            remote: Endpoint::remote(),
            local_isn: initial_sequence(meta.key, meta.generation, false),
            remote_isn: initial_sequence(meta.key, meta.generation, true),
            sent: [0; 2],
            handshake_done: false,
        }
    }

    fn next_seq(&self, direction: Direction) -> u32 {
        self.isn(direction)
            .wrapping_add(1)
            .wrapping_add(self.sent[direction.index()] as u32)
    }

    fn isn(&self, direction: Direction) -> u32 {
        match direction {
            Direction::Write => self.local_isn,
            Direction::Read => self.remote_isn,
        }
    }

    /// Source and destination for bytes travelling in `direction`.
    fn endpoints(&self, direction: Direction) -> (&Endpoint, &Endpoint) {
        match direction {
            Direction::Write => (&self.local, &self.remote),
            Direction::Read => (&self.remote, &self.local),
        }
    }
}

struct PendingPacket {
    timestamp_ns: u64,
    frame: Vec<u8>,
}

pub struct CaptureSink {
    path: PathBuf,
    max_segment_size: usize,
    retry_limit: u32,
    writer: Option<CaptureWriter>,
    flows: HashMap<(ConnectionKey, u64), TcpFlow>,
    wall_clock_base: Duration,
    monotonic_base: Option<u64>,
    packets_written: u64,
    poisoned: Option<TlsTraceError>,
    closed: bool,
}

impl CaptureSink {
    pub fn new<P: Into<PathBuf>>(path: P, max_segment_size: usize, retry_limit: u32) -> Self {
        let wall_clock_base = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self {
            path: path.into(),
            max_segment_size: max_segment_size.max(1),
            retry_limit,
            writer: None,
            flows: HashMap::new(),
            wall_clock_base,
            monotonic_base: None,
            packets_written: 0,
            poisoned: None,
            closed: false,
        }
    }

    pub fn packets_written(&self) -> u64 {
        self.packets_written
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned.is_some()
    }

    fn open_writer(&mut self) -> Result<&mut CaptureWriter> {
        if self.writer.is_none() {
            if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
                retry_io(self.retry_limit, "creating capture directory", || {
                    fs::create_dir_all(parent)
                })?;
            }
            let path = self.path.clone();
            let file = retry_io(self.retry_limit, "creating capture file", || File::create(&path))?;
            // Retries happen below the encoder so a record is never re-emitted.
            let sink = BufWriter::new(RetryingWriter::new(file, self.retry_limit));
            let writer = PcapWriter::with_header(sink, capture_header())
                .map_err(|e| capture_error("writing capture header", e))?;
            info!("writing synthesized capture to {}", self.path.display());
            self.writer = Some(writer);
        }

        self.writer.as_mut().ok_or(TlsTraceError::Closed)
    }

    /// Map a monotonic event timestamp onto wall-clock time.
    fn packet_time(&mut self, timestamp_ns: u64) -> Duration {
        let base = *self.monotonic_base.get_or_insert(timestamp_ns);
        self.wall_clock_base + Duration::from_nanos(timestamp_ns.saturating_sub(base))
    }

    fn handshake(flow: &TcpFlow, timestamp_ns: u64) -> Result<Vec<PendingPacket>> {
        let (local, remote) = (&flow.local, &flow.remote);
        let client_isn = flow.local_isn;
        let server_isn = flow.remote_isn;

        [
            frame(local, remote, client_isn, 0, tcp_flags::SYN, &[]),
            frame(
                remote,
                local,
                server_isn,
                client_isn.wrapping_add(1),
                tcp_flags::SYN | tcp_flags::ACK,
                &[],
            ),
            frame(
                local,
                remote,
                client_isn.wrapping_add(1),
                server_isn.wrapping_add(1),
                tcp_flags::ACK,
                &[],
            ),
        ]
        .into_iter()
        .map(|frame| {
            Ok(PendingPacket {
                timestamp_ns,
                frame: frame?,
            })
        })
        .collect()
    }

    fn write_packets(&mut self, packets: Vec<PendingPacket>) -> Result<()> {
        for packet in packets {
            let timestamp = self.packet_time(packet.timestamp_ns);
            let writer = self.open_writer()?;
            let pcap_packet = PcapPacket::new(timestamp, packet.frame.len() as u32, &packet.frame);
            writer
                .write_packet(&pcap_packet)
                .map_err(|e| capture_error("writing capture packet", e))?;
            self.packets_written += 1;
        }
        Ok(())
    }

    /// Stop writing after the first persistent failure; the error is kept
    /// for `close`.
    fn guard(&mut self, result: Result<()>) -> Result<()> {
        if let Err(error) = &result {
            warn!("capture output failed, skipping further packets: {}", error);
            self.poisoned = Some(error.clone());
        }
        result
    }
}

impl Sink for CaptureSink {
    fn emit(&mut self, record: &StreamRecord) -> Result<()> {
        if self.closed {
            return Err(TlsTraceError::Closed);
        }
        if self.poisoned.is_some() {
            trace!("capture poisoned, skipping record for {}", record.meta.key);
            return Ok(());
        }

        let unit = &record.unit;
        let flow_key = (record.meta.key, record.meta.generation);
        let mut flow = self
            .flows
            .remove(&flow_key)
            .unwrap_or_else(|| TcpFlow::new(&record.meta));

        let mut packets = Vec::new();
        if !flow.handshake_done {
            match Self::handshake(&flow, unit.first_timestamp_ns) {
                Ok(handshake) => packets.extend(handshake),
                Err(error) => return self.guard(Err(error)),
            }
            flow.handshake_done = true;
        }

        let direction = unit.direction;
        flow.sent[direction.index()] = unit.offset;
        let segments = unit.data.chunks(self.max_segment_size).count();
        for (index, chunk) in unit.data.chunks(self.max_segment_size).enumerate() {
            let mut flags = tcp_flags::ACK;
            if index + 1 == segments && unit.end.is_complete() {
                flags |= tcp_flags::PSH;
            }
            let seq = flow.next_seq(direction);
            let ack = flow.next_seq(direction.opposite());
            let (src, dst) = flow.endpoints(direction);
            let frame = match frame(src, dst, seq, ack, flags, chunk) {
                Ok(frame) => frame,
                Err(error) => return self.guard(Err(error)),
            };
            flow.sent[direction.index()] += chunk.len() as u64;
            packets.push(PendingPacket {
                timestamp_ns: unit.last_timestamp_ns,
                frame,
            });
        }

        self.flows.insert(flow_key, flow);
        let result = self.write_packets(packets);
        self.guard(result)
    }

    fn connection_closed(&mut self, info: &ConnectionInfo) -> Result<()> {
        let Some(flow) = self.flows.remove(&(info.meta.key, info.meta.generation)) else {
            return Ok(());
        };
        if self.closed || self.poisoned.is_some() || !flow.handshake_done {
            return Ok(());
        }

        debug!(
            "closing synthesized flow for {} generation {}",
            info.meta.key, info.meta.generation
        );
        let client_seq = flow.next_seq(Direction::Write);
        let server_seq = flow.next_seq(Direction::Read);
        let (local, remote) = (&flow.local, &flow.remote);
        let fin_ack = tcp_flags::FIN | tcp_flags::ACK;

        let frames = [
            frame(local, remote, client_seq, server_seq, fin_ack, &[]),
            frame(
                remote,
                local,
                server_seq,
                client_seq.wrapping_add(1),
                fin_ack,
                &[],
            ),
            frame(
                local,
                remote,
                client_seq.wrapping_add(1),
                server_seq.wrapping_add(1),
                tcp_flags::ACK,
                &[],
            ),
        ];
        let packets = frames
            .into_iter()
            .map(|frame| {
                Ok(PendingPacket {
                    timestamp_ns: info.last_timestamp_ns,
                    frame: frame?,
                })
            })
            .collect::<Result<Vec<_>>>();

        let result = packets.and_then(|packets| self.write_packets(packets));
        self.guard(result)
    }

    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.flows.clear();

        if let Some(error) = self.poisoned.take() {
            self.writer = None;
            return Err(error);
        }

        // An empty run still leaves a readable capture behind.
        self.open_writer()?;
        if let Some(writer) = self.writer.take() {
            let mut buffered = writer.into_writer();
            buffered
                .flush()
                .map_err(|e| TlsTraceError::sink_io("flushing capture", e))?;
        }
        info!(
            "capture {} closed after {} packets",
            self.path.display(),
            self.packets_written
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_processing::{CloseReason, ReassembledUnit, UnitEnd};
    use crate::output_strategy::frame::{ETHERNET_HEADER_LEN, FRAME_OVERHEAD, IPV4_HEADER_LEN};
    use bytes::Bytes;
    use pcap_file::pcap::PcapReader;
    use tempfile::tempdir;

    struct Decoded {
        flags: u8,
        seq: u32,
        ack: u32,
        src_port: u16,
        payload: Vec<u8>,
    }

    fn read_capture(path: &std::path::Path) -> Vec<Decoded> {
        let mut reader = PcapReader::new(File::open(path).unwrap()).unwrap();
        assert_eq!(reader.header().datalink, DataLink::ETHERNET);
        let mut packets = Vec::new();
        while let Some(packet) = reader.next_packet() {
            let packet = packet.unwrap();
            let data: &[u8] = &packet.data;
            let tcp = ETHERNET_HEADER_LEN + IPV4_HEADER_LEN;
            packets.push(Decoded {
                flags: data[tcp + 13],
                seq: u32::from_be_bytes([data[tcp + 4], data[tcp + 5], data[tcp + 6], data[tcp + 7]]),
                ack: u32::from_be_bytes([data[tcp + 8], data[tcp + 9], data[tcp + 10], data[tcp + 11]]),
                src_port: u16::from_be_bytes([data[tcp], data[tcp + 1]]),
                payload: data[FRAME_OVERHEAD..].to_vec(),
            });
        }
        packets
    }

    fn meta(generation: u64) -> ConnectionMeta {
        ConnectionMeta {
            key: ConnectionKey::new(100, 7),
            generation,
            comm: "curl".to_string(),
            tid: 100,
        }
    }

    fn record(direction: Direction, offset: u64, data: &[u8], end: UnitEnd) -> StreamRecord {
        StreamRecord {
            meta: meta(0),
            unit: ReassembledUnit {
                direction,
                first_timestamp_ns: 1_000,
                last_timestamp_ns: 2_000,
                offset,
                fragments: 1,
                end,
                data: Bytes::copy_from_slice(data),
            },
        }
    }

    fn closed() -> ConnectionInfo {
        ConnectionInfo {
            meta: meta(0),
            reason: CloseReason::Explicit,
            bytes_read: 0,
            bytes_written: 0,
            last_timestamp_ns: 3_000,
        }
    }

    mod flows {
        use super::*;

        #[test]
        fn should_open_flow_with_handshake_before_data() {
            let dir = tempdir().unwrap();
            let path = dir.path().join("out.pcap");
            let mut sink = CaptureSink::new(&path, 1460, 3);

            sink.emit(&record(Direction::Write, 0, b"GET /", UnitEnd::Complete))
                .unwrap();
            sink.close().unwrap();

            let packets = read_capture(&path);
            assert_eq!(packets.len(), 4);
            assert_eq!(packets[0].flags, tcp_flags::SYN);
            assert_eq!(packets[1].flags, tcp_flags::SYN | tcp_flags::ACK);
            assert_eq!(packets[1].ack, packets[0].seq.wrapping_add(1));
            assert_eq!(packets[2].flags, tcp_flags::ACK);
            assert_eq!(packets[3].flags, tcp_flags::ACK | tcp_flags::PSH);
            assert_eq!(packets[3].seq, packets[0].seq.wrapping_add(1));
            assert_eq!(packets[3].payload, b"GET /");
        }

        #[test]
        fn should_segment_by_mss_and_mirror_acks() {
            let dir = tempdir().unwrap();
            let path = dir.path().join("out.pcap");
            let mut sink = CaptureSink::new(&path, 4, 3);

            sink.emit(&record(Direction::Write, 0, b"abc", UnitEnd::Complete))
                .unwrap();
            sink.emit(&record(Direction::Read, 0, b"0123456789", UnitEnd::Complete))
                .unwrap();
            sink.close().unwrap();

            let packets = read_capture(&path);
            let request = &packets[3];
            let responses = &packets[4..];
            assert_eq!(responses.len(), 3);
            let payload: Vec<u8> = responses.iter().flat_map(|p| p.payload.clone()).collect();
            assert_eq!(payload, b"0123456789");
            assert_eq!(responses[0].src_port, 443);
            assert_eq!(responses[1].seq, responses[0].seq.wrapping_add(4));
            assert!(responses.iter().all(|p| p.ack == request.seq.wrapping_add(3)));
            assert_eq!(responses[0].flags & tcp_flags::PSH, 0);
            assert_ne!(responses[2].flags & tcp_flags::PSH, 0);
        }

        #[test]
        fn should_not_push_incomplete_units() {
            let dir = tempdir().unwrap();
            let path = dir.path().join("out.pcap");
            let mut sink = CaptureSink::new(&path, 1460, 3);

            sink.emit(&record(Direction::Read, 0, b"partial", UnitEnd::Flushed))
                .unwrap();
            sink.close().unwrap();

            let packets = read_capture(&path);
            assert_eq!(packets.last().unwrap().flags, tcp_flags::ACK);
        }

        #[test]
        fn should_finish_flow_with_fin_exchange() {
            let dir = tempdir().unwrap();
            let path = dir.path().join("out.pcap");
            let mut sink = CaptureSink::new(&path, 1460, 3);

            sink.emit(&record(Direction::Write, 0, b"bye", UnitEnd::Complete))
                .unwrap();
            sink.connection_closed(&closed()).unwrap();
            sink.close().unwrap();

            let packets = read_capture(&path);
            assert_eq!(packets.len(), 7);
            let fin = tcp_flags::FIN | tcp_flags::ACK;
            assert_eq!(packets[4].flags, fin);
            assert_eq!(packets[4].seq, packets[3].seq.wrapping_add(3));
            assert_eq!(packets[5].flags, fin);
            assert_eq!(packets[6].flags, tcp_flags::ACK);
        }

        #[test]
        fn should_skip_fin_for_flow_without_data() {
            let dir = tempdir().unwrap();
            let path = dir.path().join("out.pcap");
            let mut sink = CaptureSink::new(&path, 1460, 3);

            sink.connection_closed(&closed()).unwrap();
            sink.close().unwrap();

            assert!(read_capture(&path).is_empty());
            assert_eq!(sink.packets_written(), 0);
        }
    }

    mod lifecycle {
        use super::*;

        #[test]
        fn should_write_header_only_for_empty_run() {
            let dir = tempdir().unwrap();
            let path = dir.path().join("nested").join("empty.pcap");
            let mut sink = CaptureSink::new(&path, 1460, 3);

            sink.close().unwrap();
            sink.close().unwrap();

            assert!(read_capture(&path).is_empty());
        }

        #[test]
        fn should_poison_after_persistent_failure() {
            let dir = tempdir().unwrap();
            let mut sink = CaptureSink::new(dir.path(), 1460, 1);

            let first = sink.emit(&record(Direction::Write, 0, b"x", UnitEnd::Complete));
            let second = sink.emit(&record(Direction::Write, 1, b"y", UnitEnd::Complete));

            assert!(matches!(first, Err(TlsTraceError::SinkIo { .. })));
            assert!(second.is_ok());
            assert!(sink.is_poisoned());
            assert!(matches!(sink.close(), Err(TlsTraceError::SinkIo { .. })));
        }

        #[test]
        fn should_reject_emit_after_close() {
            let dir = tempdir().unwrap();
            let mut sink = CaptureSink::new(dir.path().join("out.pcap"), 1460, 3);
            sink.close().unwrap();

            let result = sink.emit(&record(Direction::Write, 0, b"late", UnitEnd::Complete));

            assert!(matches!(result, Err(TlsTraceError::Closed)));
        }
    }
}
