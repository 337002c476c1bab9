//! Cached client for a project/task board API.
//!
//! Reads go through [`query::QueryClient`], which serves fresh data from the
//! shared [`cache::EntityCache`] and collapses concurrent identical requests
//! into one. Writes go through [`mutation::MutationClient`], which only
//! touches the cache once the backend has confirmed the change.

pub mod api;
pub mod cache;
pub mod config;
pub mod error;
pub mod logging;
pub mod mutation;
pub mod notify;
pub mod query;
