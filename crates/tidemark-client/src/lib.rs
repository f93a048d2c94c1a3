//! tidemark-client — talking to search-index clusters.
//!
//! # Architecture
//!
//! ```text
//!   lifecycle engines
//!          │  Arc<dyn SearchClient>
//!          ▼
//!   ClientPool ── ClientFactory ──┬── HttpSearchClient (hyper http1, rustls)
//!                                 └── MemoryFleet / MemoryCluster (`testing` feature)
//! ```
//!
//! Every call is bounded by a request timeout. Call sites that need more
//! than one attempt wrap the call with [`retry::retry`] or
//! [`retry::poll_until`] and a [`tidemark_core::RetryPolicy`].

pub mod client;
pub mod error;
#[cfg(any(test, feature = "testing"))]
pub mod memory;
pub mod pool;
pub mod retry;
pub mod tls;
pub mod transport;
pub mod types;

pub use client::SearchClient;
pub use error::{ClientError, ClientResult};
#[cfg(any(test, feature = "testing"))]
pub use memory::{MemoryCluster, MemoryFleet};
pub use pool::{ClientFactory, ClientPool, HttpClientFactory};
pub use transport::HttpSearchClient;
pub use types::*;
