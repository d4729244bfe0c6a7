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
//! In-memory mirror of the subset of remote state observed by one
//! subscription.
//!
//! Every subscription owns a [`ShadowTree`] rooted at the watched path. The
//! raw path-level change stream is applied to the tree, and child-level
//! notifications are synthesized from the difference between the tree and
//! each incoming event. The tree is private to the worker driving one
//! subscription, so none of this is synchronized.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::path::split_path;

/// One node of a [`ShadowTree`].
///
/// A node is either a leaf carrying a scalar JSON value or an interior node
/// carrying children; grafting children clears a stale leaf value and vice
/// versa. Children received as a JSON array are stored under their decimal
/// index and re-serialized as an array (see [`ShadowNode::objectify`]).
#[derive(Clone, Debug, PartialEq)]
pub struct ShadowNode {
    key: String,
    value: Option<Value>,
    children: BTreeMap<String, ShadowNode>,
    from_slice: bool,
}

impl ShadowNode {
    /// Build a node (and its subtree) from a decoded JSON value. `None` and
    /// JSON `null` produce an empty node.
    pub fn new(key: &str, data: Option<&Value>) -> ShadowNode {
        let mut node = ShadowNode {
            key: key.to_owned(),
            value: None,
            children: BTreeMap::new(),
            from_slice: false,
        };
        match data {
            None | Some(Value::Null) => {}
            Some(Value::Object(map)) => {
                for (k, v) in map {
                    node.children.insert(k.clone(), ShadowNode::new(k, Some(v)));
                }
            }
            Some(Value::Array(items)) => {
                node.from_slice = true;
                for (i, v) in items.iter().enumerate() {
                    let k = i.to_string();
                    node.children.insert(k.clone(), ShadowNode::new(&k, Some(v)));
                }
            }
            Some(scalar) => node.value = Some(scalar.clone()),
        }
        node
    }

    /// The node's label within its parent; empty for the root.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// The scalar leaf value, if this node is a leaf.
    pub fn value(&self) -> Option<&Value> {
        self.value.as_ref()
    }

    /// The node's children, ordered by key.
    pub fn children(&self) -> impl Iterator<Item = &ShadowNode> {
        self.children.values()
    }

    /// Look up a descendant by slash-separated relative path.
    pub fn child(&self, path: &str) -> Option<&ShadowNode> {
        let mut current = self;
        for segment in split_path(path) {
            current = current.children.get(segment)?;
        }
        Some(current)
    }

    /// Reassemble the JSON value this subtree mirrors. An empty node is
    /// `null`; array-origin children come back as an array with each child
    /// at its decoded index.
    pub fn objectify(&self) -> Value {
        if let Some(value) = &self.value {
            return value.clone();
        }
        if self.children.is_empty() {
            return Value::Null;
        }
        if self.from_slice {
            let mut items = vec![Value::Null; self.children.len()];
            for (k, child) in &self.children {
                if let Ok(index) = k.parse::<usize>() {
                    if index < items.len() {
                        items[index] = child.objectify();
                    }
                }
            }
            return Value::Array(items);
        }
        Value::Object(
            self.children
                .iter()
                .map(|(k, child)| (k.clone(), child.objectify()))
                .collect(),
        )
    }

    /// A node with neither value nor children is eligible for pruning.
    pub fn is_empty(&self) -> bool {
        self.value.is_none() && self.children.is_empty()
    }

    /// The destination gains/overwrites every incoming child and adopts the
    /// incoming value, even when that value is absent.
    fn merge(&mut self, other: ShadowNode) {
        for (k, v) in other.children {
            self.children.insert(k, v);
        }
        self.value = other.value;
    }
}

impl Default for ShadowNode {
    fn default() -> Self {
        ShadowNode::new("", None)
    }
}

/// The shadow tree of one subscription.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ShadowTree {
    root: ShadowNode,
}

impl ShadowTree {
    pub fn new() -> ShadowTree {
        ShadowTree::default()
    }

    /// Graft `node` at `path`, creating interior nodes as needed and
    /// clearing stale leaf values along the ancestry. The empty path
    /// replaces the root.
    pub fn add(&mut self, path: &str, mut node: ShadowNode) {
        let segments = split_path(path);
        match segments.split_last() {
            None => {
                node.key = String::new();
                self.root = node;
            }
            Some((last, ancestors)) => {
                let mut current = &mut self.root;
                for segment in ancestors {
                    current.value = None;
                    current = current
                        .children
                        .entry((*segment).to_owned())
                        .or_insert_with(|| ShadowNode::new(segment, None));
                }
                current.value = None;
                node.key = (*last).to_owned();
                current.children.insert((*last).to_owned(), node);
            }
        }
    }

    /// Ensure the ancestry of `path` exists as in [`add`](Self::add), then
    /// merge `node` into the destination.
    pub fn update(&mut self, path: &str, node: ShadowNode) {
        let mut current = &mut self.root;
        for segment in split_path(path) {
            current.value = None;
            current = current
                .children
                .entry(segment.to_owned())
                .or_insert_with(|| ShadowNode::new(segment, None));
        }
        current.merge(node);
    }

    /// Remove the node at `path`, then prune any ancestors left without
    /// value and children. The root itself is never removed; deleting the
    /// empty path empties it instead.
    pub fn del(&mut self, path: &str) {
        let segments = split_path(path);
        if segments.is_empty() {
            self.root = ShadowNode::new("", None);
            return;
        }
        Self::remove(&mut self.root, &segments);
    }

    fn remove(node: &mut ShadowNode, segments: &[&str]) {
        match segments {
            [] => {}
            [last] => {
                node.children.remove(*last);
            }
            [head, rest @ ..] => {
                if let Some(child) = node.children.get_mut(*head) {
                    Self::remove(child, rest);
                    if child.is_empty() {
                        node.children.remove(*head);
                    }
                }
            }
        }
    }

    /// The node at `path`, if observed. The empty path yields the root.
    pub fn get(&self, path: &str) -> Option<&ShadowNode> {
        self.root.child(path)
    }
}
