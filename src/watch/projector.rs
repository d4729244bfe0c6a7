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
//! Projection of the raw path-level change stream onto child-level
//! callbacks.
//!
//! Three projections share one loop: keep-alives are skipped, an
//! `event_error` aborts the current stream generation with an error (the
//! supervisor reconnects), and `cancel`/`auth_revoked` terminate
//! gracefully (no reconnect). Everything else mutates the subscription's
//! shadow tree and may fire the user callback.
//!
//! `previous_child_key` is the lexicographically preceding sibling at the
//! moment a callback fires, the empty string for the first in order. It is
//! advanced only after the callback returns and survives reconnections,
//! together with the shadow tree.

use anyhow::{anyhow, Result};
use serde_json::{Map, Value};
use tokio::sync::mpsc;

use super::{Event, EventKind};
use crate::path::{first_segment, sanitize_path};
use crate::shadow::{ShadowNode, ShadowTree};
use crate::snapshot::Snapshot;

pub(crate) type ChildEventFn = Box<dyn FnMut(Snapshot, &str) + Send>;

/// Per-subscription state that outlives individual stream generations.
pub(crate) struct ProjectionState {
    pub(crate) tree: ShadowTree,
    pub(crate) prev_key: String,
}

impl ProjectionState {
    pub(crate) fn new() -> Self {
        ProjectionState {
            tree: ShadowTree::new(),
            prev_key: String::new(),
        }
    }

    fn fire(&mut self, callback: &mut ChildEventFn, node: ShadowNode, key: &str) {
        callback(Snapshot::new(node), &self.prev_key);
        self.prev_key = key.to_owned();
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Projection {
    Added,
    Changed,
    Removed,
}

impl Projection {
    /// Drive one stream generation to completion. `Ok(())` means the
    /// stream ended gracefully and the supervisor must not reconnect;
    /// `Err` means it broke down and a reconnect is due.
    pub(crate) async fn run(
        self,
        state: &mut ProjectionState,
        events: &mut mpsc::Receiver<Event>,
        callback: &mut ChildEventFn,
    ) -> Result<()> {
        match self {
            Projection::Added => child_added(state, events, callback).await,
            Projection::Changed => child_changed(state, events, callback).await,
            Projection::Removed => child_removed(state, events, callback).await,
        }
    }
}

/// The shared loop policy: the next event that carries data, `Ok(None)` on
/// graceful termination, `Err` on a broken stream.
async fn next_change(events: &mut mpsc::Receiver<Event>) -> Result<Option<Event>> {
    while let Some(event) = events.recv().await {
        match event.kind {
            EventKind::Error => {
                let message = match event.data {
                    Some(Value::String(message)) => message,
                    other => format!("event stream error: {:?}", other),
                };
                return Err(anyhow!(message));
            }
            EventKind::KeepAlive | EventKind::RulesDebug => continue,
            EventKind::Cancel | EventKind::AuthRevoked => return Ok(None),
            EventKind::Put | EventKind::Patch => return Ok(Some(event)),
        }
    }
    Ok(None)
}

/// Keys of an object payload in dispatch order.
///
/// `serde_json`'s map is already sorted unless the `preserve_order`
/// feature sneaks in through another dependency, so the order is pinned
/// here rather than relied upon.
fn sorted_keys(map: &Map<String, Value>) -> Vec<&String> {
    let mut keys: Vec<&String> = map.keys().collect();
    keys.sort();
    keys
}

async fn child_added(
    state: &mut ProjectionState,
    events: &mut mpsc::Receiver<Event>,
    callback: &mut ChildEventFn,
) -> Result<()> {
    while let Some(event) = next_change(events).await? {
        if event.kind != EventKind::Put {
            // merges never introduce new top-level children
            continue;
        }
        let path = sanitize_path(&event.path).to_owned();
        let child = first_segment(&path).to_owned();
        let data = match &event.data {
            None => {
                state.tree.del(&child);
                continue;
            }
            Some(data) => data,
        };
        if !child.is_empty() && state.tree.get(&child).is_some() {
            // mutations of an existing child are not additions
            continue;
        }
        if child.is_empty() {
            if let Value::Object(map) = data {
                // a whole subtree at the root means one addition per child
                for k in sorted_keys(map) {
                    let node = ShadowNode::new(k, Some(&map[k]));
                    state.tree.add(k, node.clone());
                    state.fire(callback, node, k);
                }
                continue;
            }
        }
        let node = ShadowNode::new(&child, Some(data));
        state.tree.add(&child, node.clone());
        state.fire(callback, node, &child);
    }
    Ok(())
}

async fn child_changed(
    state: &mut ProjectionState,
    events: &mut mpsc::Receiver<Event>,
    callback: &mut ChildEventFn,
) -> Result<()> {
    // the first event of a stream generation is the baseline; it loads the
    // shadow tree without firing
    match next_change(events).await? {
        None => return Ok(()),
        Some(first) => state
            .tree
            .add("", ShadowNode::new("", first.data.as_ref())),
    }
    while let Some(event) = next_change(events).await? {
        let path = sanitize_path(&event.path).to_owned();
        let data = match &event.data {
            None => {
                state.tree.del(&path);
                continue;
            }
            Some(data) => data,
        };
        let child = first_segment(&path).to_owned();
        if !child.is_empty() && state.tree.get(&child).is_none() {
            // a brand-new child is an addition, not a change
            state.tree.add(&path, ShadowNode::new(&child, Some(data)));
            continue;
        }
        if child.is_empty() {
            if let Value::Object(map) = data {
                for k in sorted_keys(map) {
                    let node = ShadowNode::new(k, Some(&map[k]));
                    if state.tree.get(k).is_none() {
                        state.tree.add(k, node);
                        continue;
                    }
                    state.tree.update(k, node.clone());
                    state.fire(callback, node, k);
                }
                continue;
            }
        }
        state.tree.update(&path, ShadowNode::new(&child, Some(data)));
        let node = state
            .tree
            .get(&child)
            .cloned()
            .unwrap_or_else(|| ShadowNode::new(&child, None));
        state.fire(callback, node, &child);
    }
    Ok(())
}

async fn child_removed(
    state: &mut ProjectionState,
    events: &mut mpsc::Receiver<Event>,
    callback: &mut ChildEventFn,
) -> Result<()> {
    match next_change(events).await? {
        None => return Ok(()),
        Some(first) => state
            .tree
            .add("", ShadowNode::new("", first.data.as_ref())),
    }
    while let Some(event) = next_change(events).await? {
        let path = sanitize_path(&event.path).to_owned();
        if event.kind == EventKind::Patch {
            state
                .tree
                .update(&path, ShadowNode::new(&path, event.data.as_ref()));
            continue;
        }
        if let Some(data) = &event.data {
            // additions are only recorded, so their later removal can be
            // reported with the data that vanished
            state.tree.add(&path, ShadowNode::new(&path, Some(data)));
            continue;
        }
        if path.is_empty() {
            // the watched node itself was deleted: report every child
            let keys: Vec<String> = state
                .tree
                .get("")
                .map(|root| root.children().map(|c| c.key().to_owned()).collect())
                .unwrap_or_default();
            for k in keys {
                let node = state
                    .tree
                    .get(&k)
                    .cloned()
                    .unwrap_or_else(|| ShadowNode::new(&k, None));
                callback(Snapshot::new(node), "");
                state.tree.del(&k);
            }
            state.tree.del("");
            continue;
        }
        let key = path.rsplit('/').next().unwrap_or("").to_owned();
        let node = state
            .tree
            .get(&path)
            .cloned()
            .unwrap_or_else(|| ShadowNode::new(&key, None));
        callback(Snapshot::new(node), "");
        state.tree.del(&path);
    }
    Ok(())
}
