use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::shadow::ShadowNode;

/// The data passed to a child-event callback: one subtree of the
/// subscription's shadow tree, captured at the moment the event fired.
///
/// ```
/// # use ember_sdk::Snapshot;
/// # fn handle(snapshot: Snapshot) {
/// println!("{} = {}", snapshot.key(), snapshot.value());
/// # }
/// ```
#[derive(Clone, Debug, PartialEq)]
pub struct Snapshot {
    node: ShadowNode,
}

impl Snapshot {
    pub(crate) fn new(node: ShadowNode) -> Snapshot {
        Snapshot { node }
    }

    /// The key of the child this snapshot was taken for.
    pub fn key(&self) -> &str {
        self.node.key()
    }

    /// The JSON value below this snapshot's location; `null` when the
    /// location holds nothing.
    pub fn value(&self) -> Value {
        self.node.objectify()
    }

    /// A snapshot of a descendant, addressed by a simple key or a deeper
    /// slash-separated relative path.
    pub fn child(&self, path: &str) -> Option<Snapshot> {
        self.node.child(path).cloned().map(Snapshot::new)
    }

    /// Try to lift the desired type out of this snapshot's value.
    pub fn extract<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.value())
    }
}
