#![no_std]

#[cfg(test)]
extern crate std;
#[cfg(test)]
use std::vec;

/// Capacity of the captured plaintext buffer in one event.
pub const MAX_DATA_SIZE: usize = 4096;
pub const TASK_COMM_LEN: usize = 16;

/// Layout revision of [`SslDataEvent`] emitted by the current capture hooks.
pub const EVENT_SCHEMA_VERSION: u32 = 1;

/// Raw event discriminants written by the kernel side.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    DataRead = 0,
    DataWrite = 1,
    ConnectionOpen = 2,
    ConnectionClose = 3,
    Control = 4,
}

impl EventKind {
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::DataRead),
            1 => Some(Self::DataWrite),
            2 => Some(Self::ConnectionOpen),
            3 => Some(Self::ConnectionClose),
            4 => Some(Self::Control),
            _ => None,
        }
    }

    pub fn as_raw(self) -> u32 {
        self as u32
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::DataRead => "data_read",
            EventKind::DataWrite => "data_write",
            EventKind::ConnectionOpen => "connection_open",
            EventKind::ConnectionClose => "connection_close",
            EventKind::Control => "control",
        }
    }
}

/// One SSL_read/SSL_write capture as laid out in the perf/ring buffer.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct SslDataEvent {
    pub timestamp_ns: u64,
    pub kind: u32,
    pub pid: u32,
    pub tid: u32,
    pub fd: u32,
    pub schema_version: u32,
    pub data_len: u32,
    pub comm: [u8; TASK_COMM_LEN],
    pub data: [u8; MAX_DATA_SIZE],
}

impl SslDataEvent {
    pub fn new() -> Self {
        Self {
            timestamp_ns: 0,
            kind: EventKind::Control.as_raw(),
            pid: 0,
            tid: 0,
            fd: 0,
            schema_version: EVENT_SCHEMA_VERSION,
            data_len: 0,
            comm: [0u8; TASK_COMM_LEN],
            data: [0u8; MAX_DATA_SIZE],
        }
    }

    pub fn with_kind(mut self, kind: EventKind) -> Self {
        self.kind = kind.as_raw();
        self
    }

    pub fn with_timestamp(mut self, timestamp_ns: u64) -> Self {
        self.timestamp_ns = timestamp_ns;
        self
    }

    pub fn with_pid(mut self, pid: u32) -> Self {
        self.pid = pid;
        self
    }

    pub fn with_tid(mut self, tid: u32) -> Self {
        self.tid = tid;
        self
    }

    pub fn with_fd(mut self, fd: u32) -> Self {
        self.fd = fd;
        self
    }

    pub fn with_schema_version(mut self, version: u32) -> Self {
        self.schema_version = version;
        self
    }

    pub fn with_command(mut self, command: &[u8]) -> Self {
        let copy_len = command.len().min(self.comm.len());
        self.comm = [0u8; TASK_COMM_LEN];
        self.comm[..copy_len].copy_from_slice(&command[..copy_len]);
        self
    }

    /// Copies up to [`MAX_DATA_SIZE`] bytes and sets `data_len` accordingly.
    pub fn with_payload(mut self, payload: &[u8]) -> Self {
        let copy_len = payload.len().min(self.data.len());
        self.data[..copy_len].copy_from_slice(&payload[..copy_len]);
        self.data_len = copy_len as u32;
        self
    }

    /// Overrides the declared length without touching the buffer.
    pub fn with_data_len(mut self, data_len: u32) -> Self {
        self.data_len = data_len;
        self
    }

    pub fn kind(&self) -> Option<EventKind> {
        EventKind::from_raw(self.kind)
    }

    /// Valid bytes of the capture. Never extends past the buffer even when
    /// `data_len` is out of range.
    pub fn payload(&self) -> &[u8] {
        let end = (self.data_len as usize).min(self.data.len());
        &self.data[..end]
    }

    /// The capture filled the whole buffer, so the call may have moved more
    /// bytes than were recorded.
    pub fn fills_buffer(&self) -> bool {
        self.data_len as usize == MAX_DATA_SIZE
    }

    pub fn command_as_str(&self) -> &str {
        let end = self
            .comm
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(self.comm.len());
        core::str::from_utf8(&self.comm[..end]).unwrap_or("<invalid>")
    }
}

impl Default for SslDataEvent {
    fn default() -> Self {
        Self::new()
    }
}
