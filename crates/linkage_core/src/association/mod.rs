//! Association wiring and persisted record shapes.

pub mod record;
pub mod resolver;
