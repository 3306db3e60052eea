//! `erpsync-core`: shared building blocks for the offline write path.
//!
//! This crate contains **pure** primitives (no I/O): identifiers, the entity
//! taxonomy understood by the remote API, and the domain error type.

pub mod entity;
pub mod error;
pub mod id;

pub use entity::{CheckIn, Customer, Entity, EntityType, Quotation, SalesOrder, Task};
pub use error::{DomainError, DomainResult};
pub use id::LocalId;
