use std::pin::Pin;

use bytes::Bytes;
use futures::{Stream, StreamExt};

use crate::error::ProviderError;

/// Raw response body of one upstream attempt.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, ProviderError>> + Send>>;

/// Complete SSE frames, delimiter excluded.
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<String, ProviderError>> + Send>>;

pub const FRAME_DELIMITER: &str = "\n\n";

/// Longest undelimited text [`frames`] holds before failing the stream.
pub const MAX_FRAME_BYTES: usize = 1024 * 1024;

/// Incremental UTF-8 decoder that carries split multi-byte sequences over to
/// the next chunk. Invalid sequences decode to U+FFFD.
#[derive(Debug, Default)]
struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    fn decode(&mut self, chunk: &[u8]) -> String {
        self.pending.extend_from_slice(chunk);
        let mut out = String::with_capacity(self.pending.len());
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(s) => {
                    out.push_str(s);
                    self.pending.clear();
                    break;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    out.push_str(std::str::from_utf8(&self.pending[..valid]).unwrap_or_default());
                    match e.error_len() {
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + len);
                        }
                        // Incomplete sequence at the end: wait for more bytes.
                        None => {
                            self.pending.drain(..valid);
                            break;
                        }
                    }
                }
            }
        }
        out
    }

    fn finish(&mut self) -> String {
        let rest = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        rest
    }
}

/// Re-delimits an arbitrarily chunked SSE body into complete frames.
///
/// Line endings are normalized to `\n` before splitting (a `\r` ending one
/// chunk and the `\n` opening the next count as a single line break), and
/// text after the last delimiter is kept until more data or [`finish`]
/// arrives.
///
/// [`finish`]: FrameSplitter::finish
#[derive(Debug, Default)]
pub struct FrameSplitter {
    decoder: Utf8Decoder,
    buf: String,
    pending_cr: bool,
    scan_from: usize,
}

impl FrameSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw bytes; returns every frame completed by this chunk.
    pub fn push_bytes(&mut self, chunk: &[u8]) -> Vec<String> {
        let text = self.decoder.decode(chunk);
        self.push_str(&text)
    }

    /// Feed already-decoded text; returns every frame completed by this chunk.
    pub fn push_str(&mut self, chunk: &str) -> Vec<String> {
        self.normalize_into_buf(chunk);
        self.drain_frames()
    }

    /// Flush at end of stream. A non-blank remainder without its closing
    /// delimiter becomes the final frame.
    pub fn finish(&mut self) -> Vec<String> {
        let tail = self.decoder.finish();
        self.normalize_into_buf(&tail);
        let mut frames = self.drain_frames();

        let rest = std::mem::take(&mut self.buf);
        self.scan_from = 0;
        self.pending_cr = false;
        let rest = rest.trim_start_matches('\n').trim_end_matches('\n');
        if !rest.trim().is_empty() {
            frames.push(rest.to_string());
        }
        frames
    }

    /// Bytes currently held back waiting for a delimiter.
    pub fn buffered_len(&self) -> usize {
        self.buf.len()
    }

    fn normalize_into_buf(&mut self, chunk: &str) {
        self.buf.reserve(chunk.len());
        for ch in chunk.chars() {
            match ch {
                '\r' => {
                    self.buf.push('\n');
                    self.pending_cr = true;
                }
                '\n' if self.pending_cr => self.pending_cr = false,
                _ => {
                    self.buf.push(ch);
                    self.pending_cr = false;
                }
            }
        }
    }

    fn drain_frames(&mut self) -> Vec<String> {
        let mut frames = Vec::new();
        let mut consumed = 0;
        while let Some(pos) = self.buf[self.scan_from..]
            .find(FRAME_DELIMITER)
            .map(|p| p + self.scan_from)
        {
            let frame = self.buf[consumed..pos].trim_start_matches('\n');
            // Runs of blank lines between frames carry no event.
            if !frame.is_empty() {
                frames.push(frame.to_string());
            }
            consumed = pos + FRAME_DELIMITER.len();
            self.scan_from = consumed;
        }
        self.buf.drain(..consumed);
        // Only a trailing '\n' can start a delimiter completed by the next chunk.
        self.scan_from = if self.buf.ends_with('\n') {
            self.buf.len() - 1
        } else {
            self.buf.len()
        };
        frames
    }
}

/// Re-segment a byte stream into frames. An upstream error is yielded once
/// and ends the stream; buffered text is flushed only on a clean close.
/// More than [`MAX_FRAME_BYTES`] without a delimiter is a stream error.
pub fn frames(mut bytes: ByteStream) -> FrameStream {
    Box::pin(async_stream::stream! {
        let mut splitter = FrameSplitter::new();
        while let Some(chunk) = bytes.next().await {
            match chunk {
                Ok(chunk) => {
                    for frame in splitter.push_bytes(&chunk) {
                        yield Ok(frame);
                    }
                    if splitter.buffered_len() > MAX_FRAME_BYTES {
                        yield Err(ProviderError::UpstreamStream(format!(
                            "frame exceeds {MAX_FRAME_BYTES} bytes without a delimiter"
                        )));
                        return;
                    }
                }
                Err(e) => {
                    yield Err(e);
                    return;
                }
            }
        }
        for frame in splitter.finish() {
            yield Ok(frame);
        }
    })
}

/// Wire form of a frame, delimiter re-appended.
pub fn to_wire(frame: &str) -> Bytes {
    let mut out = String::with_capacity(frame.len() + FRAME_DELIMITER.len());
    out.push_str(frame);
    out.push_str(FRAME_DELIMITER);
    Bytes::from(out)
}
