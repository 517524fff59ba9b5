//! # schemabus registry
//!
//! Schema resolution for schemabus producers and consumers.
//!
//! - [`SchemaRegistry`]: the three registry operations the clients need
//!   (fetch by id, fetch latest by subject, register-or-get)
//! - [`HttpSchemaRegistry`]: Confluent-compatible REST implementation
//! - [`MemorySchemaRegistry`]: in-process implementation for tests and the
//!   in-memory transport
//! - [`SchemaCache`]: memoizes registry lookups for the lifetime of a client
//!
//! Schemas are immutable once an id is assigned, so cache entries never
//! expire.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cache;
pub mod client;
mod convert;
pub mod encoding;
pub mod memory;
pub mod registry;
pub mod schema;

pub use cache::{CacheError, SchemaCache};
pub use client::{HttpSchemaRegistry, RegistryAuth, RegistryClientConfig};
pub use memory::MemorySchemaRegistry;
pub use registry::{RegisteredSchema, RegistryError, SchemaFormat, SchemaRegistry};
pub use schema::{ParsedSchema, SchemaError, SchemaHandle};
