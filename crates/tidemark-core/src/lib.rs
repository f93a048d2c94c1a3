pub mod bucket;
pub mod config;
pub mod error;
pub mod naming;
pub mod retry;
pub mod types;

pub use config::{
    ClientConfig, DaemonConfig, LifecycleSettings, RetryPolicies, RoutingSettings, TidemarkConfig,
};
pub use error::{CoreError, CoreResult};
pub use naming::{AliasKind, IndexNaming, IndexVersion, NameError, ParsedAlias, ParsedIndex};
pub use retry::{Backoff, RetryPolicy};
pub use types::*;
