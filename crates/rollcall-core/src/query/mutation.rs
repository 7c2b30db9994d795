//! Mutation unit: runs a write and invalidates the cache entries it makes
//! stale.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, warn};

use crate::api::ApiError;
use crate::cache::{KeyPattern, TtlStore};
use crate::error::ConfigError;

use super::envelope::{decode, Envelope};
use super::producer::MutationProducer;
use super::state::UnitState;

type SuccessCallback<T> = Arc<dyn Fn(&T) + Send + Sync>;
type ErrorCallback = Arc<dyn Fn(&ApiError) + Send + Sync>;

/// Options recognised by a mutation unit.
pub struct MutationConfig<T> {
    /// Exact keys, or wildcard patterns when they contain `*`.
    pub invalidate_keys: Vec<String>,
    pub on_success: Option<SuccessCallback<T>>,
    pub on_error: Option<ErrorCallback>,
    pub envelope: Envelope,
}

impl<T> Default for MutationConfig<T> {
    fn default() -> Self {
        Self {
            invalidate_keys: Vec::new(),
            on_success: None,
            on_error: None,
            envelope: Envelope::default(),
        }
    }
}

impl<T> MutationConfig<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn invalidate(mut self, key_or_pattern: impl Into<String>) -> Self {
        self.invalidate_keys.push(key_or_pattern.into());
        self
    }

    pub fn on_success<F>(mut self, f: F) -> Self
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.on_success = Some(Arc::new(f));
        self
    }

    pub fn on_error<F>(mut self, f: F) -> Self
    where
        F: Fn(&ApiError) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(f));
        self
    }

    pub fn with_envelope(mut self, envelope: Envelope) -> Self {
        self.envelope = envelope;
        self
    }
}

impl<T> fmt::Debug for MutationConfig<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutationConfig")
            .field("invalidate_keys", &self.invalidate_keys)
            .field("on_success", &self.on_success.is_some())
            .field("on_error", &self.on_error.is_some())
            .field("envelope", &self.envelope)
            .finish()
    }
}

#[derive(Debug, Clone)]
enum Invalidation {
    Exact(String),
    Pattern(KeyPattern),
}

impl Invalidation {
    fn parse(key: &str) -> Result<Self, ConfigError> {
        if key.is_empty() {
            return Err(ConfigError::EmptyPattern);
        }
        if KeyPattern::is_wildcard(key) {
            Ok(Invalidation::Pattern(KeyPattern::new(key)?))
        } else {
            Ok(Invalidation::Exact(key.to_string()))
        }
    }

    fn apply(&self, store: &TtlStore) {
        match self {
            Invalidation::Exact(key) => store.remove(key),
            Invalidation::Pattern(pattern) => {
                store.remove_matching(pattern);
            }
        }
    }
}

struct MutationInner<P, T> {
    store: TtlStore,
    producer: Mutex<MutationProducer<P>>,
    invalidations: Vec<Invalidation>,
    on_success: Option<SuccessCallback<T>>,
    on_error: Option<ErrorCallback>,
    envelope: Envelope,
    state: Mutex<UnitState<T>>,
}

/// A write operation bound to one call site.
pub struct MutationUnit<P, T = Value> {
    inner: Arc<MutationInner<P, T>>,
}

impl<P, T> Clone for MutationUnit<P, T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<P, T> MutationUnit<P, T>
where
    P: Send + 'static,
    T: DeserializeOwned + Clone + Send + 'static,
{
    /// Build the unit, compiling every invalidation pattern up front.
    pub fn new(
        store: TtlStore,
        producer: MutationProducer<P>,
        config: MutationConfig<T>,
    ) -> Result<Self, ConfigError> {
        let invalidations = config
            .invalidate_keys
            .iter()
            .map(|k| Invalidation::parse(k))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            inner: Arc::new(MutationInner {
                store,
                producer: Mutex::new(producer),
                invalidations,
                on_success: config.on_success,
                on_error: config.on_error,
                envelope: config.envelope,
                state: Mutex::new(UnitState::default()),
            }),
        })
    }

    pub fn set_producer(&self, producer: MutationProducer<P>) {
        *self.inner.producer.lock() = producer;
    }

    /// Run the write. On success the configured cache entries are dropped
    /// and the payload returned; on failure the cache is left untouched and
    /// the error is both recorded and returned.
    pub async fn mutate(&self, payload: P) -> Result<T, ApiError> {
        self.inner.state.lock().begin();

        let producer = self.inner.producer.lock().clone();
        let outcome = producer.call(payload).await;

        let result = outcome.and_then(|response| {
            // The write landed even if the reply turns out to be unusable
            self.invalidate();
            decode::<T>(self.inner.envelope.extract(response))
        });

        match result {
            Ok(data) => {
                if let Some(ref on_success) = self.inner.on_success {
                    on_success(&data);
                }
                let mut state = self.inner.state.lock();
                state.data = Some(data.clone());
                state.loading = false;
                Ok(data)
            }
            Err(e) => {
                warn!(error = %e, "Mutation failed");
                {
                    let mut state = self.inner.state.lock();
                    state.error = Some(e.user_message());
                    state.loading = false;
                }
                if let Some(ref on_error) = self.inner.on_error {
                    on_error(&e);
                }
                Err(e)
            }
        }
    }

    fn invalidate(&self) {
        for invalidation in &self.inner.invalidations {
            debug!(invalidation = ?invalidation, "Invalidating after mutation");
            invalidation.apply(&self.inner.store);
        }
    }

    pub fn snapshot(&self) -> UnitState<T> {
        self.inner.state.lock().clone()
    }

    pub fn data(&self) -> Option<T> {
        self.inner.state.lock().data.clone()
    }

    pub fn loading(&self) -> bool {
        self.inner.state.lock().loading
    }

    pub fn error(&self) -> Option<String> {
        self.inner.state.lock().error.clone()
    }
}

// ============================================================================
// Tests
// ============================================================================
