//! REST fetch-through executor.
//!
//! The engine only ever needs a simple GET/POST executor; the
//! [`RestClient`] trait keeps the HTTP plumbing an external
//! collaborator so tests can stub it with canned envelopes. The
//! provided [`HttpClient`] implements it over `reqwest`.

pub mod client;
pub mod error;

pub use client::{HttpClient, RestClient};
pub use error::ApiError;
