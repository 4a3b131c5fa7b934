use chrono::{DateTime, Utc};
use std::collections::HashMap;

use crate::runtime::{LogChunk, StreamKind};

/// Longest partial line kept while waiting for its newline.
pub const MAX_PARTIAL_LINE: usize = 1024 * 1024;

/// A complete line of container output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
    pub stream: StreamKind,
    /// Daemon timestamp prefixed to the line, if it could be parsed.
    pub timestamp: Option<DateTime<Utc>>,
    pub message: String,
}

impl LogLine {
    /// Timestamp in nanoseconds since the epoch.
    pub fn nanos(&self) -> Option<i64> {
        self.timestamp.and_then(|ts| ts.timestamp_nanos_opt())
    }
}

#[derive(Debug, Default)]
struct Partial {
    bytes: Vec<u8>,
    /// Stamp of the last fragment appended to `bytes`.
    latest: Option<DateTime<Utc>>,
}

impl Partial {
    fn line(&mut self, stream: StreamKind, raw: &[u8]) -> LogLine {
        let mut line = parse_line(stream, raw);
        if let Some(latest) = self.latest.take() {
            line.timestamp = Some(latest);
        }
        line
    }
}

/// Reassembles lines from raw output frames. Every stream keeps its own
/// partial line since stdout and stderr frames interleave.
///
/// Docker splits long lines into several frames, each carrying its own
/// timestamp. The timestamps of the follow-up frames are dropped from the
/// message and the joined line takes the stamp of its last fragment.
#[derive(Debug, Default)]
pub struct LineSplitter {
    partial: HashMap<StreamKind, Partial>,
}

impl LineSplitter {
    pub fn push(&mut self, chunk: &LogChunk) -> Vec<LogLine> {
        let partial = self.partial.entry(chunk.stream).or_default();

        let mut data: &[u8] = &chunk.bytes;
        if !partial.bytes.is_empty() {
            if let Some((ts, rest)) = split_timestamp(data) {
                partial.latest = Some(ts);
                data = rest;
            }
        }
        partial.bytes.extend_from_slice(data);

        let mut lines = Vec::new();
        while let Some(newline) = partial.bytes.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = partial.bytes.drain(..=newline).collect();
            lines.push(partial.line(chunk.stream, &raw[..newline]));
        }

        if partial.bytes.len() > MAX_PARTIAL_LINE {
            log::warn!(
                "Line on {:?} exceeds {} bytes without a newline, forwarding it as is",
                chunk.stream,
                MAX_PARTIAL_LINE
            );
            let raw = std::mem::take(&mut partial.bytes);
            lines.push(partial.line(chunk.stream, &raw));
        }
        lines
    }

    /// Lines still missing their terminating newline.
    pub fn finish(&mut self) -> Vec<LogLine> {
        self.partial
            .drain()
            .filter(|(_, partial)| !partial.bytes.is_empty())
            .map(|(stream, mut partial)| {
                let raw = std::mem::take(&mut partial.bytes);
                partial.line(stream, &raw)
            })
            .collect()
    }
}

/// Split a leading `<RFC 3339 timestamp> ` off a frame.
fn split_timestamp(data: &[u8]) -> Option<(DateTime<Utc>, &[u8])> {
    let space = data.iter().position(|b| *b == b' ')?;
    let ts = std::str::from_utf8(&data[..space]).ok()?;
    Some((parse_timestamp(ts)?, &data[space + 1..]))
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
}

/// Split `<RFC 3339 timestamp> <message>` as produced by docker with
/// `timestamps=true`.
pub fn parse_line(stream: StreamKind, raw: &[u8]) -> LogLine {
    let text = String::from_utf8_lossy(raw);
    let text = text.strip_suffix('\r').unwrap_or(&text);

    let (timestamp, message) = match text.split_once(' ') {
        Some((ts, message)) => match parse_timestamp(ts) {
            Some(ts) => (Some(ts), message),
            None => (None, text),
        },
        None => match parse_timestamp(text) {
            Some(ts) => (Some(ts), ""),
            None => (None, text),
        },
    };

    LogLine {
        stream,
        timestamp,
        message: message.to_string(),
    }
}
