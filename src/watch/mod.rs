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
//! The streaming side of a reference: raw change events and the child-level
//! subscriptions synthesized from them.

use std::fmt;

use anyhow::Result;
use bytes::Bytes;
use serde::{de::DeserializeOwned, Deserialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::reference::Ember;

mod frames;
mod projector;
mod supervisor;
mod transport;

pub use supervisor::EventRegistration;

use frames::{FrameError, RawFrame};
use transport::open_event_stream;

/// The kind of a change notification received while watching a reference.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum EventKind {
    /// Data was written at the event's path.
    Put,
    /// Data was merged into the event's path.
    Patch,
    /// Periodic server ping; never delivered to consumers.
    KeepAlive,
    /// The server revoked read access to the watched location.
    Cancel,
    /// The supplied auth credential is no longer valid.
    AuthRevoked,
    /// Server-side rules debugging output; logged and discarded.
    RulesDebug,
    /// The stream broke down (framing error, heartbeat expiry, transport
    /// failure). Synthesized locally, never sent by the server.
    Error,
}

impl EventKind {
    pub(crate) fn from_wire(name: &str) -> Option<EventKind> {
        match name {
            "put" => Some(EventKind::Put),
            "patch" => Some(EventKind::Patch),
            "keep-alive" => Some(EventKind::KeepAlive),
            "cancel" => Some(EventKind::Cancel),
            "auth_revoked" => Some(EventKind::AuthRevoked),
            "rules_debug" => Some(EventKind::RulesDebug),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Put => "put",
            EventKind::Patch => "patch",
            EventKind::KeepAlive => "keep-alive",
            EventKind::Cancel => "cancel",
            EventKind::AuthRevoked => "auth_revoked",
            EventKind::RulesDebug => "rules_debug",
            EventKind::Error => "event_error",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A notification received while watching a reference.
#[derive(Clone, Debug)]
pub struct Event {
    /// What happened.
    pub kind: EventKind,
    /// Path of the change, rooted at the watched node (leading slash as
    /// sent by the server). Empty for non-data events.
    pub path: String,
    /// The decoded data of the change; `None` encodes JSON `null`. For
    /// [`EventKind::Error`] this carries the error message.
    pub data: Option<Value>,
    raw: Bytes,
}

#[derive(Deserialize)]
struct WirePayload {
    path: String,
    data: Value,
}

impl Event {
    /// Re-decode the raw payload of a `put`/`patch` event into the desired
    /// type, bypassing the generic [`Value`](serde_json::Value) in
    /// [`data`](Event::data).
    pub fn value<T: DeserializeOwned>(&self) -> Result<T> {
        #[derive(Deserialize)]
        struct Payload<T> {
            data: T,
        }
        let payload: Payload<T> = serde_json::from_slice(self.raw.as_ref())?;
        Ok(payload.data)
    }

    pub(crate) fn error(err: impl fmt::Display) -> Event {
        Event {
            kind: EventKind::Error,
            path: String::new(),
            data: Some(Value::String(err.to_string())),
            raw: Bytes::new(),
        }
    }

    /// Interpret a raw frame. Unknown event types yield `Ok(None)` and are
    /// logged by the caller's loop; undecodable `put`/`patch` payloads are
    /// framing errors.
    pub(crate) fn parse(frame: RawFrame) -> Result<Option<Event>, FrameError> {
        let kind = match EventKind::from_wire(&frame.event) {
            Some(kind) => kind,
            None => {
                tracing::debug!(event = %frame.event, "skipping unknown event type");
                return Ok(None);
            }
        };
        let event = match kind {
            EventKind::Put | EventKind::Patch => {
                let payload: WirePayload =
                    serde_json::from_slice(&frame.data).map_err(FrameError::Decode)?;
                Event {
                    kind,
                    path: payload.path,
                    data: match payload.data {
                        Value::Null => None,
                        data => Some(data),
                    },
                    raw: frame.data.into(),
                }
            }
            EventKind::AuthRevoked | EventKind::RulesDebug => Event {
                kind,
                path: String::new(),
                data: Some(Value::String(
                    String::from_utf8_lossy(&frame.data).into_owned(),
                )),
                raw: frame.data.into(),
            },
            _ => Event {
                kind,
                path: String::new(),
                data: None,
                raw: frame.data.into(),
            },
        };
        Ok(Some(event))
    }
}

impl Ember {
    /// Stream raw change events from this reference into `notifications`.
    ///
    /// Only one raw watch can be active per reference. A second call
    /// without an intervening [`stop_watching`](Ember::stop_watching)
    /// closes the given channel right away and returns `Ok(())`.
    pub async fn watch(&self, notifications: mpsc::Sender<Event>) -> Result<()> {
        let cancel = CancellationToken::new();
        {
            let mut watching = self.watching.lock().unwrap();
            if watching.is_some() {
                // dropping the only sender closes the caller's channel
                return Ok(());
            }
            *watching = Some(cancel.clone());
        }

        let mut events = match open_event_stream(
            &self.client,
            self.to_string(),
            self.redacted_url(),
            self.watch_heartbeat,
            self.request_timeout,
            cancel.clone(),
        )
        .await
        {
            Ok(events) => events,
            Err(err) => {
                *self.watching.lock().unwrap() = None;
                return Err(err);
            }
        };

        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if cancel.is_cancelled() {
                    // the stream was torn down on purpose; anything still
                    // in flight (typically the event_error from the closed
                    // body) must not reach the consumer
                    tracing::debug!(kind = %event.kind, "dropping event after stop");
                    break;
                }
                if notifications.send(event).await.is_err() {
                    break;
                }
            }
        });
        Ok(())
    }

    /// Tear down the raw watch on this reference, if any. The notification
    /// channel is closed once the cancellation has propagated.
    pub fn stop_watching(&self) {
        if let Some(token) = self.watching.lock().unwrap().take() {
            token.cancel();
        }
    }
}
