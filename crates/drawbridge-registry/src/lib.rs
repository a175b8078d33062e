//! Redis-backed task registry: one hash per task, string indexes for
//! idempotency keys and content hashes, and a created-time zset driving the
//! expiry and purge scans.

mod registry;

pub use registry::{RegistryError, RegistryResult, TaskRegistry};
