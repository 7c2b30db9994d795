//! Fetch and mutation units sitting between callers and the remote API.
//!
//! - `FetchUnit`: memoized reads through the `TtlStore`, re-run when the
//!   computed cache key changes
//! - `MutationUnit`: writes that invalidate exact keys or wildcard patterns
//!   once they succeed
//!
//! Both wrap type-erased producers and extract payloads through an
//! explicit `Envelope` strategy.

pub mod envelope;
pub mod fetch;
pub mod mutation;
pub mod producer;
pub mod state;

pub use envelope::{Envelope, DATA_FIELD};
pub use fetch::{FetchConfig, FetchUnit, DEFAULT_TTL};
pub use mutation::{MutationConfig, MutationUnit};
pub use producer::{MutationProducer, Producer, ProducerFuture};
pub use state::UnitState;
