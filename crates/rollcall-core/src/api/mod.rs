//! REST API client module for the school-management backend.
//!
//! This module provides the `ApiClient` for JSON requests against the
//! remote API and the `ApiError` taxonomy every producer failure maps to.
//!
//! The API uses bearer token authentication.

pub mod client;
pub mod error;

pub use client::ApiClient;
pub use error::{ApiError, ServerBody, GENERIC_ERROR_MESSAGE};
