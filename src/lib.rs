//! Tagpin - per-workflow pinning of Docker image tags to content digests
//!
//! A running workflow may reference the same image tag from many jobs, and
//! call-caching correctness requires every one of those references to bind
//! to the same image bytes. Tagpin guarantees that: for the lifetime of one
//! workflow, each tag resolves to exactly one digest, durably recorded
//! before anyone sees it. The key components are:
//!
//! ## Resolver
//!
//! - [`TagResolver`]: one message-driven state machine per workflow,
//!   coalescing concurrent lookups and replaying persisted mappings on
//!   restart
//! - [`ResolverHandle`]: the handle job-preparation code resolves through
//!
//! ## Lookup
//!
//! - [`HashingService`]: the seam to the external digest lookup
//! - [`RegistryHashingService`]: Docker Registry v2 implementation
//!
//! ## Storage
//!
//! - [`store`]: durable `(workflow, tag) -> digest` rows, Postgres-backed
//!   with an in-memory twin
//! - [`config`]: environment-based configuration

pub mod config;
pub mod lookup;
pub mod reference;
pub mod resolver;
pub mod store;

pub use config::{Config, ResolverConfig, StartMode};
pub use lookup::{HashResponse, HashingService, RegistryHashingService};
pub use reference::{ContentDigest, ImageRef, ReferenceError};
pub use resolver::{Resolution, ResolveError, ResolverHandle, TagResolver};
pub use store::{DigestStore, MemoryStore, PostgresStore, StoreError, StoredDigest};
