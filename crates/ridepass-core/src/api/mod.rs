//! Authorized JSON API access.
//!
//! `AuthorizedClient` sends requests through the session's
//! [`AuthInterceptor`](crate::interceptor::AuthInterceptor), replaying a
//! request once when a 401 led to a successful refresh and backing off on
//! rate limits.

pub mod client;
pub mod error;

pub use client::AuthorizedClient;
pub use error::ApiError;
