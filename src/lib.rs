pub mod catalog;
pub mod config;
pub mod error;
pub mod fetch;
pub mod report;

pub use catalog::{Catalog, ModelSpec, UrlStrategy};
pub use config::{ConfigBuilder, FetchConfig, FileConfig};
pub use error::{AttemptError, ConfigError, FetchError, TransportError};
pub use fetch::{FetchEvent, FetchObserver, Fetcher, NoopObserver};
pub use report::{ArtifactReport, ArtifactStatus, LocalState, SessionReport};

pub type Result<T> = anyhow::Result<T>;
