//! Newline-delimited text framing.
//!
//! Wire format: UTF-8 text terminated by `\n`, no header, no length prefix.
//!
//! Two inbound modes are supported:
//! - `Line`: bytes are buffered and one message is produced per `\n`
//!   terminated line, so a line split across reads arrives whole.
//! - `Chunk`: every successful read becomes one message, regardless of
//!   where newlines fall.
//!
//! In both modes trailing `\r`/`\n` are stripped, invalid UTF-8 is decoded
//! lossily and whitespace-only messages are dropped.

use crate::error::ChannelError;
use bytes::{Bytes, BytesMut};
use clap::ValueEnum;
use serde::Deserialize;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Longest line buffered in `Line` mode before it is emitted unterminated.
pub const MAX_LINE_LENGTH: usize = 64 * 1024;

/// How inbound bytes are split into messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Framing {
    /// One message per newline-terminated line.
    #[default]
    Line,
    /// One message per read.
    Chunk,
}

/// Reads from a byte stream and yields batches of decoded messages.
#[derive(Debug)]
pub struct FrameReader<R> {
    reader: R,
    framing: Framing,
    chunk: Vec<u8>,
    pending: BytesMut,
    eof: bool,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    /// `buffer_size` is the fixed size of each read.
    pub fn new(reader: R, framing: Framing, buffer_size: usize) -> Self {
        Self {
            reader,
            framing,
            chunk: vec![0; buffer_size.max(1)],
            pending: BytesMut::new(),
            eof: false,
        }
    }

    /// Perform one read and decode whatever it completed.
    ///
    /// Returns `Ok(None)` once the peer has shut down and any buffered
    /// partial line has been delivered. A batch may be empty when the read
    /// only contained whitespace or an incomplete line.
    ///
    /// Cancel safe: dropping the future before it completes loses no data.
    pub async fn next_batch(&mut self) -> io::Result<Option<Vec<String>>> {
        if self.eof {
            return Ok(None);
        }

        let n = self.reader.read(&mut self.chunk).await?;
        if n == 0 {
            self.eof = true;
            let mut tail = Vec::new();
            if !self.pending.is_empty() {
                let rest = self.pending.split();
                push_message(&mut tail, &rest);
            }
            return Ok((!tail.is_empty()).then_some(tail));
        }

        let mut batch = Vec::new();
        match self.framing {
            Framing::Chunk => push_message(&mut batch, &self.chunk[..n]),
            Framing::Line => {
                self.pending.extend_from_slice(&self.chunk[..n]);
                while let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
                    let line = self.pending.split_to(pos + 1);
                    push_message(&mut batch, &line);
                }
                if self.pending.len() >= MAX_LINE_LENGTH {
                    let line = self.pending.split();
                    push_message(&mut batch, &line);
                }
            }
        }

        Ok(Some(batch))
    }
}

fn push_message(batch: &mut Vec<String>, raw: &[u8]) {
    let text = String::from_utf8_lossy(raw);
    let text = text.trim_end_matches(['\r', '\n']);
    if !text.trim().is_empty() {
        batch.push(text.to_string());
    }
}

/// Encode outbound text as a single newline-terminated frame.
///
/// Returns `None` for empty or whitespace-only text. Text that `Line`
/// framing would deliver as more than one message is rejected: an interior
/// line break, or a line that reaches [`MAX_LINE_LENGTH`].
pub fn encode(text: &str) -> Result<Option<Bytes>, ChannelError> {
    if text.trim().is_empty() {
        return Ok(None);
    }

    let text = text.trim_end_matches(['\r', '\n']);
    if text.contains('\n') {
        return Err(ChannelError::InvalidPayload(
            "text contains a line break".to_string(),
        ));
    }
    if text.len() >= MAX_LINE_LENGTH {
        return Err(ChannelError::InvalidPayload(format!(
            "{} bytes exceeds the {} byte line limit",
            text.len(),
            MAX_LINE_LENGTH - 1
        )));
    }

    let mut frame = BytesMut::with_capacity(text.len() + 1);
    frame.extend_from_slice(text.as_bytes());
    frame.extend_from_slice(b"\n");
    Ok(Some(frame.freeze()))
}
