//! Server-sent-event codec: a bounded parser over byte streams and the
//! serializer used on the egress side. Comment lines (`:ping` heartbeats)
//! are transparent to parsing; `[DONE]` marks clean end of stream.

use bytes::Bytes;
use futures_util::stream::{self, BoxStream};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio_util::io::StreamReader;

use crate::error::{RelayError, Result};

pub const DONE_SENTINEL: &str = "[DONE]";

#[derive(Clone, Copy, Debug)]
pub struct SseLimits {
    pub max_line_bytes: usize,
    pub max_event_bytes: usize,
}

impl Default for SseLimits {
    fn default() -> Self {
        Self {
            max_line_bytes: 256 * 1024,
            max_event_bytes: 4 * 1024 * 1024,
        }
    }
}

/// One parsed SSE event. Multi-line `data:` fields are joined with `\n`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
}

impl SseEvent {
    pub fn data(data: impl Into<String>) -> Self {
        Self {
            event: None,
            data: data.into(),
        }
    }

    pub fn named(event: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            event: Some(event.into()),
            data: data.into(),
        }
    }

    /// Wire form: `event:` line when named, `data:` lines, blank terminator.
    pub fn serialize(&self) -> String {
        let mut out = String::new();
        if let Some(event) = &self.event {
            out.push_str("event: ");
            out.push_str(event);
            out.push('\n');
        }
        for line in self.data.split('\n') {
            out.push_str("data: ");
            out.push_str(line);
            out.push('\n');
        }
        out.push('\n');
        out
    }
}

/// A heartbeat comment frame. Not an event; parsers drop it.
pub fn heartbeat_frame() -> Bytes {
    Bytes::from_static(b":ping\n\n")
}

pub fn done_frame() -> Bytes {
    Bytes::from_static(b"data: [DONE]\n\n")
}

async fn read_line_limited<R>(reader: &mut R, out: &mut Vec<u8>, max_bytes: usize) -> Result<bool>
where
    R: AsyncBufRead + Unpin,
{
    out.clear();
    loop {
        let buf = reader.fill_buf().await?;
        if buf.is_empty() {
            return Ok(!out.is_empty());
        }
        let newline_pos = buf.iter().position(|b| *b == b'\n');
        let take_len = newline_pos.map(|pos| pos + 1).unwrap_or(buf.len());
        if out.len().saturating_add(take_len) > max_bytes {
            return Err(RelayError::StreamAborted {
                reason: format!("SSE line exceeds max_line_bytes={max_bytes}"),
            });
        }
        out.extend_from_slice(&buf[..take_len]);
        reader.consume(take_len);
        if newline_pos.is_some() {
            return Ok(true);
        }
    }
}

async fn read_next_event<R>(
    reader: &mut R,
    line_bytes: &mut Vec<u8>,
    limits: SseLimits,
) -> Result<Option<SseEvent>>
where
    R: AsyncBufRead + Unpin,
{
    let mut event: Option<String> = None;
    let mut data = String::new();
    let mut saw_data = false;

    loop {
        let has_line = read_line_limited(reader, line_bytes, limits.max_line_bytes).await?;
        if !has_line {
            if !saw_data {
                return Ok(None);
            }
            return Ok(Some(SseEvent { event, data }));
        }

        let line = std::str::from_utf8(line_bytes).map_err(|err| RelayError::StreamAborted {
            reason: format!("invalid SSE UTF-8: {err}"),
        })?;
        let line = line.trim_end_matches(['\r', '\n']);

        if line.is_empty() {
            if !saw_data {
                continue;
            }
            if data == DONE_SENTINEL {
                return Ok(None);
            }
            return Ok(Some(SseEvent { event, data }));
        }

        // Comment lines carry heartbeats; they never affect the event.
        if line.starts_with(':') {
            continue;
        }

        if let Some(rest) = line.strip_prefix("event:") {
            event = Some(rest.trim().to_string());
            continue;
        }

        if let Some(rest) = line.strip_prefix("data:") {
            let rest = rest.trim_start();
            let separator = usize::from(saw_data);
            if data
                .len()
                .saturating_add(separator)
                .saturating_add(rest.len())
                > limits.max_event_bytes
            {
                return Err(RelayError::StreamAborted {
                    reason: format!(
                        "SSE event exceeds max_event_bytes={}",
                        limits.max_event_bytes
                    ),
                });
            }
            if separator == 1 {
                data.push('\n');
            }
            data.push_str(rest);
            saw_data = true;
        }
    }
}

pub fn sse_event_stream_from_reader_with_limits<R>(
    reader: R,
    limits: SseLimits,
) -> BoxStream<'static, Result<SseEvent>>
where
    R: AsyncBufRead + Unpin + Send + 'static,
{
    Box::pin(stream::try_unfold(
        (reader, Vec::<u8>::new(), limits),
        |(mut reader, mut line_bytes, limits)| async move {
            match read_next_event(&mut reader, &mut line_bytes, limits).await? {
                Some(event) => Ok(Some((event, (reader, line_bytes, limits)))),
                None => Ok(None),
            }
        },
    ))
}

pub fn sse_event_stream_from_reader<R>(reader: R) -> BoxStream<'static, Result<SseEvent>>
where
    R: AsyncBufRead + Unpin + Send + 'static,
{
    sse_event_stream_from_reader_with_limits(reader, SseLimits::default())
}

pub fn sse_event_stream_from_bytes<S>(byte_stream: S) -> BoxStream<'static, Result<SseEvent>>
where
    S: futures_util::Stream<Item = std::result::Result<Bytes, std::io::Error>>
        + Send
        + Unpin
        + 'static,
{
    let reader = StreamReader::new(byte_stream);
    sse_event_stream_from_reader(tokio::io::BufReader::new(reader))
}

/// Find the earliest event boundary (`\n\n` or `\r\n\r\n`) in a raw buffer.
/// The relay uses this to count whole events without re-parsing fields.
pub fn find_event_boundary(buf: &[u8]) -> Option<(usize, usize)> {
    let mut idx = 0usize;
    while idx + 1 < buf.len() {
        if buf[idx] == b'\n' && buf[idx + 1] == b'\n' {
            return Some((idx, 2));
        }
        if idx + 3 < buf.len()
            && buf[idx] == b'\r'
            && buf[idx + 1] == b'\n'
            && buf[idx + 2] == b'\r'
            && buf[idx + 3] == b'\n'
        {
            return Some((idx, 4));
        }
        idx += 1;
    }
    None
}
