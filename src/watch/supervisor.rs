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
//! Lifecycle of child-event subscriptions: one background worker per
//! registration, reconnection with doubling backoff, deregistration.

use std::sync::atomic::Ordering;

use anyhow::Result;
use tokio_util::sync::CancellationToken;

use super::projector::{ChildEventFn, Projection, ProjectionState};
use super::transport::open_event_stream;
use crate::reference::Ember;
use crate::snapshot::Snapshot;

/// Handle identifying one registered child-event callback on a reference.
///
/// Returned by [`Ember::child_added`], [`Ember::child_changed`] and
/// [`Ember::child_removed`]; pass it to
/// [`Ember::remove_event_callback`] to end the subscription.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct EventRegistration(pub(crate) u64);

impl Ember {
    /// Invoke `callback` for every child added under this reference.
    ///
    /// The callback receives a snapshot of the added child and the key of
    /// the lexicographically preceding sibling at that point (empty for
    /// the first). The children present when the subscription starts are
    /// reported as additions in lexicographic order; later mutations or
    /// removals of a known child fire nothing.
    pub async fn child_added<F>(&self, callback: F) -> Result<EventRegistration>
    where
        F: FnMut(Snapshot, &str) + Send + 'static,
    {
        self.register(Projection::Added, Box::new(callback)).await
    }

    /// Invoke `callback` for every change to an existing child under this
    /// reference. The payload present when the subscription starts is the
    /// silent baseline; children appearing afterwards are additions and
    /// fire nothing either.
    pub async fn child_changed<F>(&self, callback: F) -> Result<EventRegistration>
    where
        F: FnMut(Snapshot, &str) + Send + 'static,
    {
        self.register(Projection::Changed, Box::new(callback)).await
    }

    /// Invoke `callback` for every child removed under this reference,
    /// with a snapshot of the data that vanished. When the watched node
    /// itself is deleted, one callback fires per remaining child in
    /// lexicographic order.
    pub async fn child_removed<F>(&self, callback: F) -> Result<EventRegistration>
    where
        F: FnMut(Snapshot, &str) + Send + 'static,
    {
        self.register(Projection::Removed, Box::new(callback)).await
    }

    /// End the subscription behind `registration`. Idempotent: removing an
    /// unknown or already-removed registration does nothing.
    pub fn remove_event_callback(&self, registration: EventRegistration) {
        let token = self.event_funcs.lock().unwrap().remove(&registration.0);
        if let Some(token) = token {
            token.cancel();
        }
    }

    async fn register(
        &self,
        projection: Projection,
        mut callback: ChildEventFn,
    ) -> Result<EventRegistration> {
        let key = self.next_registration.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        self.event_funcs
            .lock()
            .unwrap()
            .insert(key, cancel.clone());

        let url = self.to_string();
        let redacted = self.redacted_url();
        let mut events = match open_event_stream(
            &self.client,
            url.clone(),
            redacted.clone(),
            self.watch_heartbeat,
            self.request_timeout,
            cancel.clone(),
        )
        .await
        {
            Ok(events) => events,
            Err(err) => {
                self.event_funcs.lock().unwrap().remove(&key);
                return Err(err);
            }
        };

        let client = self.client.clone();
        let registry = self.event_funcs.clone();
        let heartbeat = self.watch_heartbeat;
        let request_timeout = self.request_timeout;
        tokio::spawn(async move {
            let mut state = ProjectionState::new();
            let mut backoff = heartbeat;
            loop {
                if !registry.lock().unwrap().contains_key(&key) {
                    return;
                }
                match projection
                    .run(&mut state, &mut events, &mut callback)
                    .await
                {
                    Ok(()) => return,
                    Err(err) => {
                        tracing::debug!(%err, url = %redacted, "event stream interrupted")
                    }
                }

                // give the database some time, a bit more on every attempt
                loop {
                    backoff *= 2;
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    if !registry.lock().unwrap().contains_key(&key) {
                        return;
                    }
                    match open_event_stream(
                        &client,
                        url.clone(),
                        redacted.clone(),
                        heartbeat,
                        request_timeout,
                        cancel.clone(),
                    )
                    .await
                    {
                        Ok(reopened) => {
                            tracing::debug!(url = %redacted, backoff = ?backoff, "event stream reconnected");
                            events = reopened;
                            break;
                        }
                        Err(err) => tracing::warn!(%err, url = %redacted, "reconnect failed"),
                    }
                }
            }
        });
        Ok(EventRegistration(key))
    }
}
