//! Per-connection text transcripts
//!
//! Every connection key gets `conn_<pid>_<fd>.log` under the destination
//! directory. Generations of the same key share the file and are separated by
//! header lines.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt::Write as FmtWrite;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use log::{debug, warn};

use crate::configuration::TranscriptFormat;
use crate::errors::{Result, TlsTraceError};
use crate::event_processing::{
    ConnectionInfo, ConnectionKey, ConnectionMeta, StreamRecord, UnitEnd,
};
use crate::output_strategy::{retry_io, RetryingWriter, Sink};

const HEX_LINE_WIDTH: usize = 16;

struct TranscriptFile {
    writer: BufWriter<RetryingWriter<File>>,
    generation: Option<u64>,
}

pub struct TranscriptSink {
    directory: PathBuf,
    format: TranscriptFormat,
    retry_limit: u32,
    files: HashMap<ConnectionKey, TranscriptFile>,
    failed: HashMap<ConnectionKey, TlsTraceError>,
    directory_ready: bool,
    closed: bool,
}

impl TranscriptSink {
    pub fn new<P: Into<PathBuf>>(directory: P, format: TranscriptFormat, retry_limit: u32) -> Self {
        Self {
            directory: directory.into(),
            format,
            retry_limit,
            files: HashMap::new(),
            failed: HashMap::new(),
            directory_ready: false,
            closed: false,
        }
    }

    pub fn path_for(directory: &Path, key: ConnectionKey) -> PathBuf {
        directory.join(format!("conn_{}_{}.log", key.pid, key.fd))
    }

    /// Connections whose transcript hit a persistent write failure.
    pub fn failed_connections(&self) -> Vec<ConnectionKey> {
        let mut keys: Vec<ConnectionKey> = self.failed.keys().copied().collect();
        keys.sort();
        keys
    }

    fn file_for(&mut self, key: ConnectionKey) -> Result<&mut TranscriptFile> {
        if !self.directory_ready {
            let directory = self.directory.clone();
            retry_io(self.retry_limit, "creating transcript directory", || {
                fs::create_dir_all(&directory)
            })?;
            self.directory_ready = true;
        }

        match self.files.entry(key) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => {
                let path = Self::path_for(&self.directory, key);
                let file = retry_io(self.retry_limit, "opening transcript", || {
                    OpenOptions::new().create(true).append(true).open(&path)
                })?;
                debug!("opened transcript {}", path.display());
                Ok(entry.insert(TranscriptFile {
                    writer: BufWriter::new(RetryingWriter::new(file, self.retry_limit)),
                    generation: None,
                }))
            }
        }
    }

    fn append(&mut self, key: ConnectionKey, meta: Option<&ConnectionMeta>, text: &str) -> Result<()> {
        if let Some(error) = self.failed.get(&key) {
            return Err(error.clone());
        }

        let result = self.file_for(key).and_then(|file| {
            let mut buffer = String::new();
            if let Some(meta) = meta {
                if file.generation != Some(meta.generation) {
                    buffer.push_str(&generation_header(meta));
                    file.generation = Some(meta.generation);
                }
            }
            buffer.push_str(text);
            file.writer
                .write_all(buffer.as_bytes())
                .map_err(|e| TlsTraceError::sink_io("writing transcript", e))
        });

        if let Err(error) = &result {
            warn!("transcript for {} failed, dropping its output: {}", key, error);
            self.files.remove(&key);
            self.failed.insert(key, error.clone());
        }
        result
    }

    fn format_record(&self, record: &StreamRecord) -> String {
        let unit = &record.unit;
        let marker = match unit.end {
            UnitEnd::Complete => "",
            UnitEnd::ContinuationLimit => " [truncated]",
            UnitEnd::Flushed => " [incomplete]",
        };

        let mut text = String::new();
        let _ = writeln!(
            text,
            "[{}] {} pid={} fd={} comm={} offset={} len={} fragments={}{}",
            unit.first_timestamp_ns,
            unit.direction,
            record.meta.key.pid,
            record.meta.key.fd,
            record.meta.comm,
            unit.offset,
            unit.len(),
            unit.fragments,
            marker
        );

        match self.format {
            TranscriptFormat::Text => {
                text.push_str(&String::from_utf8_lossy(&unit.data));
                if !text.ends_with('\n') {
                    text.push('\n');
                }
            }
            TranscriptFormat::Hex => text.push_str(&hex_dump(&unit.data)),
        }
        text
    }
}

impl Sink for TranscriptSink {
    fn emit(&mut self, record: &StreamRecord) -> Result<()> {
        if self.closed {
            return Err(TlsTraceError::Closed);
        }
        let text = self.format_record(record);
        self.append(record.meta.key, Some(&record.meta), &text)
    }

    fn connection_closed(&mut self, info: &ConnectionInfo) -> Result<()> {
        let key = info.meta.key;
        if self.closed || self.failed.remove(&key).is_some() {
            return Ok(());
        }
        // Nothing was ever written for this generation.
        let Some(file) = self.files.get(&key) else {
            return Ok(());
        };
        if file.generation != Some(info.meta.generation) {
            return Ok(());
        }

        let line = format!(
            "=== generation {} {} at {}: read={} written={} ===\n",
            info.meta.generation,
            info.reason.as_str(),
            info.last_timestamp_ns,
            info.bytes_read,
            info.bytes_written
        );
        self.append(key, None, &line)?;

        if let Some(mut file) = self.files.remove(&key) {
            file.writer
                .flush()
                .map_err(|e| TlsTraceError::sink_io("flushing transcript", e))?;
        }
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let mut first_error = None;
        let mut files: Vec<(ConnectionKey, TranscriptFile)> = self.files.drain().collect();
        files.sort_by_key(|(key, _)| *key);
        for (key, mut file) in files {
            if let Err(e) = file.writer.flush() {
                let error = TlsTraceError::sink_io("flushing transcript", e);
                warn!("failed to flush transcript for {}: {}", key, error);
                first_error.get_or_insert(error);
            }
        }

        match first_error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

fn generation_header(meta: &ConnectionMeta) -> String {
    format!(
        "=== {} generation {} comm={} tid={} opened {} ===\n",
        meta.key,
        meta.generation,
        meta.comm,
        meta.tid,
        chrono::Utc::now().to_rfc3339()
    )
}

/// Offset, hex bytes and printable ASCII, sixteen bytes per line.
pub fn hex_dump(data: &[u8]) -> String {
    let mut out = String::new();
    for (line, chunk) in data.chunks(HEX_LINE_WIDTH).enumerate() {
        let encoded = hex::encode(chunk);
        let spaced: Vec<&str> = (0..encoded.len())
            .step_by(2)
            .map(|i| &encoded[i..i + 2])
            .collect();
        let ascii: String = chunk
            .iter()
            .map(|&b| if b.is_ascii_graphic() || b == b' ' { b as char } else { '.' })
            .collect();
        let _ = writeln!(
            out,
            "{:08x}  {:<width$}  |{}|",
            line * HEX_LINE_WIDTH,
            spaced.join(" "),
            ascii,
            width = HEX_LINE_WIDTH * 3 - 1
        );
    }
    out
}
