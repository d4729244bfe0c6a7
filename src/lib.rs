#![doc = include_str!("../README.md")]

mod path;
mod reference;
pub mod shadow;
mod snapshot;
mod watch;

pub use reference::{Ember, RequestTimeout, ServerError};
pub use reqwest::Client;
pub use snapshot::Snapshot;
pub use watch::{Event, EventKind, EventRegistration};
