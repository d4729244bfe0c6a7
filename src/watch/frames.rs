/*
 * Copyright 2021 Actyx AG
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */
//! Framing layer of the event stream.
//!
//! The server speaks server-sent events, one record per change:
//!
//! ```text
//! event: put
//! data: {"path":"/foo","data":{"bar":true}}
//!
//! ```
//!
//! [`FrameReader`] reassembles these trios from the chunked response body.
//! Data lines can be arbitrarily large (a single `put` may carry the whole
//! subtree), so lines are accumulated without any maximum token size. Every
//! chunk pull re-arms the heartbeat watchdog; a stream that stays silent
//! for longer than the heartbeat is torn down with
//! [`FrameError::HeartbeatExpired`].

use std::time::Duration;

use bytes::Bytes;
use derive_more::{Display, Error};
use futures::{Stream, StreamExt};

/// A decoded `event:`/`data:` pair, prefixes stripped and whitespace
/// trimmed.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct RawFrame {
    pub(crate) event: String,
    pub(crate) data: Vec<u8>,
}

#[derive(Debug, Display, Error)]
pub(crate) enum FrameError {
    #[display(fmt = "unexpected end of event stream")]
    UnexpectedEof,
    #[display(fmt = "missing {:?} prefix", _0)]
    MissingPrefix(#[error(not(source))] &'static str),
    #[display(fmt = "expected empty line between events")]
    ExpectedEmptyLine,
    #[display(fmt = "no event received within {:?}", _0)]
    HeartbeatExpired(#[error(not(source))] Duration),
    #[display(fmt = "reading event stream: {}", _0)]
    Transport(reqwest::Error),
    #[display(fmt = "decoding event payload: {}", _0)]
    Decode(serde_json::Error),
}

pub(crate) struct FrameReader<S> {
    stream: S,
    buf: Vec<u8>,
    eof: bool,
    heartbeat: Duration,
}

impl<S> FrameReader<S>
where
    S: Stream<Item = reqwest::Result<Bytes>> + Unpin,
{
    pub(crate) fn new(stream: S, heartbeat: Duration) -> Self {
        FrameReader {
            stream,
            buf: Vec::new(),
            eof: false,
            heartbeat,
        }
    }

    /// Read the next `event:`/`data:`/blank trio.
    pub(crate) async fn next_frame(&mut self) -> Result<RawFrame, FrameError> {
        let event = self.prefixed_line("event: ").await?;
        let data = self.prefixed_line("data: ").await?;
        let blank = self.next_line().await?;
        if !trim_spaces(&blank).is_empty() {
            return Err(FrameError::ExpectedEmptyLine);
        }
        Ok(RawFrame {
            event: String::from_utf8_lossy(&event).into_owned(),
            data,
        })
    }

    async fn prefixed_line(&mut self, prefix: &'static str) -> Result<Vec<u8>, FrameError> {
        let line = self.next_line().await?;
        if !line.starts_with(prefix.as_bytes()) {
            return Err(FrameError::MissingPrefix(prefix));
        }
        Ok(trim_spaces(&line[prefix.len()..]).to_vec())
    }

    async fn next_line(&mut self) -> Result<Vec<u8>, FrameError> {
        loop {
            if let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
                let mut line: Vec<u8> = self.buf.drain(..=pos).collect();
                line.pop();
                if line.ends_with(b"\r") {
                    line.pop();
                }
                return Ok(line);
            }
            if self.eof {
                return Err(FrameError::UnexpectedEof);
            }
            self.fill().await?;
        }
    }

    /// Pull one more chunk into the buffer, bounded by the heartbeat.
    async fn fill(&mut self) -> Result<(), FrameError> {
        match tokio::time::timeout(self.heartbeat, self.stream.next()).await {
            Err(_) => Err(FrameError::HeartbeatExpired(self.heartbeat)),
            Ok(None) => {
                self.eof = true;
                Ok(())
            }
            Ok(Some(Err(err))) => Err(FrameError::Transport(err)),
            Ok(Some(Ok(chunk))) => {
                self.buf.extend_from_slice(chunk.as_ref());
                Ok(())
            }
        }
    }
}

fn trim_spaces(mut bytes: &[u8]) -> &[u8] {
    while let Some((first, rest)) = bytes.split_first() {
        if first.is_ascii_whitespace() {
            bytes = rest;
        } else {
            break;
        }
    }
    while let Some((last, rest)) = bytes.split_last() {
        if last.is_ascii_whitespace() {
            bytes = rest;
        } else {
            break;
        }
    }
    bytes
}
