//! Event-stream layer: JetStream persistence for the round timeline.

mod jetstream_repo;

pub use jetstream_repo::*;
