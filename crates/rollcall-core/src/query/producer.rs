//! Type-erased async operations wrapped by fetch and mutation units.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt};
use serde::Serialize;
use serde_json::Value;

use crate::api::ApiError;

/// Future returned by a producer: the raw response as JSON.
pub type ProducerFuture = BoxFuture<'static, Result<Value, ApiError>>;

fn to_json<R: Serialize>(response: R) -> Result<Value, ApiError> {
    serde_json::to_value(response).map_err(|e| ApiError::InvalidResponse(e.to_string()))
}

/// A zero-argument async operation whose result a fetch unit caches.
///
/// The label names the operation; it is the fallback cache-key prefix when
/// no explicit key is configured. Two producers with the same label and
/// dependencies share cache entries.
#[derive(Clone)]
pub struct Producer {
    label: String,
    call: Arc<dyn Fn() -> ProducerFuture + Send + Sync>,
}

impl Producer {
    pub fn new<F, Fut, R>(label: impl Into<String>, f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, ApiError>> + Send + 'static,
        R: Serialize + Send,
    {
        let call = move || {
            let fut = f();
            async move { to_json(fut.await?) }.boxed()
        };
        Self {
            label: label.into(),
            call: Arc::new(call),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn call(&self) -> ProducerFuture {
        (self.call)()
    }
}

impl fmt::Debug for Producer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Producer").field("label", &self.label).finish()
    }
}

/// A one-argument async write operation used by a mutation unit.
pub struct MutationProducer<P> {
    call: Arc<dyn Fn(P) -> ProducerFuture + Send + Sync>,
}

impl<P: Send + 'static> MutationProducer<P> {
    pub fn new<F, Fut, R>(f: F) -> Self
    where
        F: Fn(P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, ApiError>> + Send + 'static,
        R: Serialize + Send,
    {
        let call = move |payload: P| {
            let fut = f(payload);
            async move { to_json(fut.await?) }.boxed()
        };
        Self {
            call: Arc::new(call),
        }
    }

    pub fn call(&self, payload: P) -> ProducerFuture {
        (self.call)(payload)
    }
}

impl<P> Clone for MutationProducer<P> {
    fn clone(&self) -> Self {
        Self {
            call: Arc::clone(&self.call),
        }
    }
}
