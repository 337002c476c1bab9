//! Project/task backend: wire types, REST client and the cached façade.

pub mod cached_client;
pub mod client;
pub mod envelope;
pub mod keys;
pub mod types;
pub mod validation;

pub use cached_client::CachedApiClient;
pub use client::ApiClient;
pub use envelope::Envelope;
pub use keys::ApiQueryKey;
