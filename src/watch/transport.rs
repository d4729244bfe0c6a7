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
//! One generation of the event stream: a single long-lived GET request
//! whose body is parsed into [`Event`]s until it errors, expires or is
//! cancelled.

use std::time::Duration;

use anyhow::Result;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT};
use reqwest::{Client, Method, Response};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::frames::FrameReader;
use super::{Event, EventKind};
use crate::reference::{execute_with_redirects, RequestTimeout, ServerError};

/// Sized to absorb a burst of frames while the consumer is inside a
/// callback; the reader awaits once it is full.
const EVENT_CHANNEL_CAPACITY: usize = 16;

/// Open the event stream at `url` and spawn the reader feeding the
/// returned channel. `redacted_url` is the credential-free form used for
/// error text.
///
/// The channel closes on EOF, framing error (after one final
/// [`EventKind::Error`]), cancellation, or a terminal `cancel`/
/// `auth_revoked` event (after delivering it). Connection establishment
/// and response-header receipt are bounded by `request_timeout`,
/// surfacing [`RequestTimeout`]; a non-2xx response surfaces
/// [`ServerError`] with the response body. Redirects are replayed with
/// the `Accept` header (and any client default headers) intact.
pub(crate) async fn open_event_stream(
    client: &Client,
    url: String,
    redacted_url: String,
    heartbeat: Duration,
    request_timeout: Duration,
    cancel: CancellationToken,
) -> Result<mpsc::Receiver<Event>> {
    let mut headers = HeaderMap::new();
    headers.insert(ACCEPT, HeaderValue::from_static("text/event-stream"));
    let response = match tokio::time::timeout(
        request_timeout,
        execute_with_redirects(client, Method::GET, &url, headers, None),
    )
    .await
    {
        Err(_) => return Err(RequestTimeout.into()),
        Ok(response) => response?,
    };
    if !response.status().is_success() {
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        return Err(ServerError {
            body,
            status,
            context: format!("opening event stream at {}", redacted_url),
        }
        .into());
    }

    let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    tokio::spawn(read_events(response, heartbeat, cancel, tx));
    Ok(rx)
}

async fn read_events(
    response: Response,
    heartbeat: Duration,
    cancel: CancellationToken,
    tx: mpsc::Sender<Event>,
) {
    let mut reader = FrameReader::new(Box::pin(response.bytes_stream()), heartbeat);
    loop {
        let frame = tokio::select! {
            // dropping the in-flight read also closes the response body
            _ = cancel.cancelled() => return,
            frame = reader.next_frame() => frame,
        };
        let frame = match frame {
            Ok(frame) => frame,
            Err(err) => {
                let _ = tx.send(Event::error(&err)).await;
                return;
            }
        };
        let event = match Event::parse(frame) {
            Ok(Some(event)) => event,
            Ok(None) => continue,
            Err(err) => {
                let _ = tx.send(Event::error(&err)).await;
                return;
            }
        };
        match event.kind {
            EventKind::KeepAlive => continue,
            EventKind::RulesDebug => {
                tracing::debug!(data = ?event.data, "rules debug frame");
                continue;
            }
            EventKind::Cancel | EventKind::AuthRevoked => {
                let _ = tx.send(event).await;
                return;
            }
            _ => {
                if tx.send(event).await.is_err() {
                    return;
                }
            }
        }
    }
}
