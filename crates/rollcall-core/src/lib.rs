//! Rollcall core - the data layer behind the school-management client.
//!
//! Sits between UI code and the remote API:
//!
//! - `cache`: session-scoped TTL store and deterministic cache keys
//! - `query`: fetch units (memoized, dependency-driven reads) and mutation
//!   units (writes that invalidate cache entries)
//! - `auth`: bounded, renewable session window
//! - `api`: JSON REST client and the producer error taxonomy
//!
//! The store and the session manager share one `SessionStorage` instance,
//! constructed explicitly and injected, so independent caches can coexist.

pub mod api;
pub mod auth;
pub mod cache;
pub mod clock;
pub mod config;
pub mod error;
pub mod query;
pub mod storage;

pub use api::{ApiClient, ApiError};
pub use auth::{SessionDecision, SessionManager, SessionPolicy, SessionState};
pub use cache::{DepValue, TtlStore};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::Config;
pub use error::{ConfigError, SessionError, StorageError};
pub use query::{
    Envelope, FetchConfig, FetchUnit, MutationConfig, MutationProducer, MutationUnit, Producer,
    UnitState,
};
pub use storage::{MemoryStorage, SessionStorage};
