//! HTTP client for wayback.
//!
//! This crate provides a reqwest-backed [`wayback_core::Fetcher`] so caches can
//! be filled from real endpoints.

pub mod fetch;

pub use fetch::{FetchClient, FetchConfig, FetchResponse};
