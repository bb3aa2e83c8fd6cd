//! Incremental frame decoder.
//!
//! The server emits a stream of header blocks terminated by a blank line,
//! optionally followed by exactly `Content-Length` body bytes. TCP delivers
//! that stream in arbitrary chunks, so the decoder keeps a segment buffer
//! and a record of any frame whose body has not fully arrived yet.

use bytes::BytesMut;
use percent_encoding::percent_decode_str;
use tracing::trace;

use crate::error::{Error, Result};
use crate::event::Event;

/// Upper bound on a declared body size before the stream is considered hostile.
pub const DEFAULT_MAX_CONTENT_LENGTH: usize = 16 * 1024 * 1024;

/// Progress of a partially received frame, exposed for diagnostics and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentState {
    /// Body bytes still missing before the frame completes.
    pub bytes_needed: usize,
    /// Bytes already buffered toward the pending body.
    pub bytes_buffered: usize,
}

/// Streaming decoder from raw socket bytes to [`Event`] frames.
#[derive(Debug)]
pub struct Decoder {
    buf: BytesMut,
    pending: Option<(Event, usize)>,
    max_content_length: usize,
}

impl Default for Decoder {
    fn default() -> Decoder {
        Decoder::new()
    }
}

impl Decoder {
    pub fn new() -> Decoder {
        Decoder {
            buf: BytesMut::new(),
            pending: None,
            max_content_length: DEFAULT_MAX_CONTENT_LENGTH,
        }
    }

    pub fn with_max_content_length(max: usize) -> Decoder {
        Decoder {
            max_content_length: max,
            ..Decoder::new()
        }
    }

    /// Feed a chunk of received bytes, returning every frame completed by it.
    ///
    /// Feeding the same stream split at any byte boundary yields the same
    /// sequence of events as feeding it whole.
    pub fn feed(&mut self, data: &[u8]) -> Result<Vec<Event>> {
        self.buf.extend_from_slice(data);
        let mut events = Vec::new();

        loop {
            // finish any frame whose body is outstanding first
            if let Some((event, content_length)) = self.pending.take() {
                if self.buf.len() < content_length {
                    self.pending = Some((event, content_length));
                    break;
                }
                let contents = self.buf.split_to(content_length);
                let mut event = event;
                attach_contents(&mut event, &contents);
                events.push(event);
            }

            let Some(end) = find_terminator(&self.buf) else {
                break;
            };
            let block = self.buf.split_to(end + 2);
            let text = String::from_utf8_lossy(&block[..end]).into_owned();

            let mut event = Event::new();
            parse_block(&text, &mut event);

            match event.content_length() {
                Some(len) if len > self.max_content_length => {
                    return Err(Error::ContentTooLarge {
                        len,
                        limit: self.max_content_length,
                    });
                }
                Some(len) if len > 0 => {
                    self.pending = Some((event, len));
                }
                _ => {
                    if event.is_empty() {
                        trace!("skipping empty frame");
                    } else {
                        events.push(event);
                    }
                }
            }
        }

        Ok(events)
    }

    /// Report progress of a body still being reassembled, if any.
    pub fn segmented(&self) -> Option<SegmentState> {
        self.pending.as_ref().map(|(_, needed)| SegmentState {
            bytes_needed: needed.saturating_sub(self.buf.len()),
            bytes_buffered: self.buf.len(),
        })
    }

    /// True whenever any bytes of an unfinished frame are buffered.
    pub fn has_partial(&self) -> bool {
        self.pending.is_some() || !self.buf.is_empty()
    }
}

fn find_terminator(buf: &BytesMut) -> Option<usize> {
    buf.windows(2).position(|pair| pair == b"\n\n")
}

fn decode_value(raw: &str) -> String {
    percent_decode_str(raw).decode_utf8_lossy().into_owned()
}

/// Parse a header block into `event`.
///
/// A line holding a `: ` separator is a header (values percent-decoded); a
/// line without one continues the previous header value. After a blank line
/// every remaining line is body content, the same rule the server applies
/// when nesting a framed payload inside `text/event-plain` contents.
fn parse_block(text: &str, event: &mut Event) {
    let mut last_key: Option<String> = None;
    let mut in_body = false;

    for line in text.split('\n') {
        if line.is_empty() {
            in_body = true;
            last_key = None;
            continue;
        }
        let header = if in_body {
            None
        } else {
            line.split_once(": ")
                .filter(|(key, _)| !key.is_empty() && !key.starts_with('+'))
        };
        match header {
            Some((key, value)) => {
                event.insert(key, decode_value(value));
                last_key = Some(key.to_string());
            }
            None => match &last_key {
                Some(key) => event.append_to(key, &decode_value(line)),
                None => event.append_body(&decode_value(line)),
            },
        }
    }
}

/// Fold `Content-Length` framed contents back into their carrier frame.
///
/// `text/event-plain` payloads are themselves header blocks and are merged
/// into the outer event; every other content type is an opaque body.
fn attach_contents(event: &mut Event, contents: &[u8]) {
    let text = String::from_utf8_lossy(contents);
    if event.content_type() == Some("text/event-plain") {
        parse_block(&text, event);
    } else {
        for line in text.trim_end_matches('\n').split('\n') {
            event.append_body(&decode_value(line));
        }
    }
}
