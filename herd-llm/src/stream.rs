//! Normalization of vendor wire formats into `StreamChunk`s.
//!
//! Three families are understood: SSE (`data: ` lines with a `[DONE]`
//! sentinel), newline-delimited JSON, and pre-split text fragments. JSON
//! events are handed to a per-vendor [`DeltaExtractor`] that knows where the
//! text lives in that vendor's payload.

use crate::error::Result;
use crate::transport::ByteStream;
use crate::types::StreamChunk;
use futures_util::Stream;
use futures_util::StreamExt;
use std::pin::Pin;

pub type ChunkStream = Pin<Box<dyn Stream<Item = StreamChunk> + Send>>;
pub type FragmentStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// Interprets one decoded JSON event.
pub type DeltaExtractor = fn(&serde_json::Value) -> Delta;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireFormat {
    Sse,
    Ndjson,
    Fragments,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delta {
    Text(String),
    Skip,
    Done,
    Error(String),
}

/// A provider response body that has not been normalized yet.
pub enum RawStream {
    Sse(ByteStream, DeltaExtractor),
    Ndjson(ByteStream, DeltaExtractor),
    Fragments(FragmentStream),
}

pub fn normalize(raw: RawStream) -> ChunkStream {
    match raw {
        RawStream::Sse(bytes, extract) => normalize_lines(bytes, extract, WireFormat::Sse),
        RawStream::Ndjson(bytes, extract) => normalize_lines(bytes, extract, WireFormat::Ndjson),
        RawStream::Fragments(fragments) => normalize_fragments(fragments),
    }
}

fn normalize_lines(
    bytes: ByteStream,
    extract: DeltaExtractor,
    format: WireFormat,
) -> ChunkStream {
    Box::pin(async_stream::stream! {
        let mut lines = Box::pin(decode_lines(bytes));
        while let Some(line) = lines.next().await {
            let line = match line {
                Ok(line) => line,
                Err(e) => {
                    yield StreamChunk::error(e.to_string());
                    return;
                }
            };
            let Some(payload) = event_payload(&line, format) else {
                continue;
            };
            if payload == "[DONE]" {
                return;
            }
            let event: serde_json::Value = match serde_json::from_str(payload) {
                Ok(v) => v,
                Err(e) => {
                    tracing::debug!(error = %e, line = %payload, "skipping malformed stream event");
                    continue;
                }
            };
            match extract(&event) {
                Delta::Text(text) => {
                    if !text.is_empty() {
                        yield StreamChunk::content(text);
                    }
                }
                Delta::Skip => {}
                Delta::Done => return,
                Delta::Error(error) => {
                    yield StreamChunk::error(error);
                    return;
                }
            }
        }
    })
}

/// The JSON-bearing part of one line, or `None` when the line carries nothing.
fn event_payload(line: &str, format: WireFormat) -> Option<&str> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    if format == WireFormat::Sse {
        if let Some(rest) = line.strip_prefix("data:") {
            let rest = rest.trim_start();
            return if rest.is_empty() { None } else { Some(rest) };
        }
        // event:, id:, retry: and comment lines carry no payload of their own.
        if line.starts_with(':')
            || line.starts_with("event:")
            || line.starts_with("id:")
            || line.starts_with("retry:")
        {
            return None;
        }
    }
    Some(line)
}

fn normalize_fragments(fragments: FragmentStream) -> ChunkStream {
    Box::pin(async_stream::stream! {
        let mut fragments = fragments;
        while let Some(fragment) = fragments.next().await {
            match fragment {
                Ok(text) => {
                    if !text.is_empty() {
                        yield StreamChunk::content(text);
                    }
                }
                Err(e) => {
                    yield StreamChunk::error(e.to_string());
                    return;
                }
            }
        }
    })
}

/// Splits a byte stream on `\n`, tolerating reads that cut lines (or UTF-8
/// sequences) in half. A trailing line without newline is flushed at EOF.
pub fn decode_lines(bytes_stream: ByteStream) -> impl Stream<Item = Result<String>> + Send {
    futures_util::stream::unfold(
        (bytes_stream, Vec::<u8>::new(), false),
        |(mut stream, mut buffer, mut finished)| async move {
            loop {
                if let Some(idx) = buffer.iter().position(|b| *b == b'\n') {
                    let mut line: Vec<u8> = buffer.drain(..=idx).collect();
                    line.pop();
                    if line.last() == Some(&b'\r') {
                        line.pop();
                    }
                    let text = String::from_utf8_lossy(&line).into_owned();
                    return Some((Ok(text), (stream, buffer, finished)));
                }

                if finished {
                    if buffer.is_empty() {
                        return None;
                    }
                    let text = String::from_utf8_lossy(&buffer).into_owned();
                    buffer.clear();
                    return Some((Ok(text), (stream, buffer, finished)));
                }

                match stream.next().await {
                    Some(Ok(chunk)) => buffer.extend_from_slice(&chunk),
                    Some(Err(e)) => {
                        buffer.clear();
                        return Some((Err(e), (stream, buffer, true)));
                    }
                    None => finished = true,
                }
            }
        },
    )
}
