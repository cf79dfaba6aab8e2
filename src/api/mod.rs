//! HTTP boundary for authenticated platform calls.

pub mod envelope;
pub mod response;
mod client;

pub use client::ApiClient;
