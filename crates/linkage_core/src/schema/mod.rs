//! Schema declarations: semantic types, entities, registry and provisioning.

pub mod ddl;
pub mod entity;
pub mod registry;
pub mod value;
