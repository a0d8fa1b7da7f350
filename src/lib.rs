//! grafana-lambda - Grafana on AWS Lambda
//!
//! Runs a stateful Grafana server inside short-lived Lambda environments.
//! State (the SQLite database and plugins) is mirrored to a versioned S3
//! bucket, and a DynamoDB lease lock serializes every request that may
//! write to it.

pub mod clock;
pub mod config;
pub mod error;
pub mod lock;
pub mod process;
pub mod proxy;
pub mod router;
pub mod sync;

pub use config::Config;
pub use error::{GrafanaLambdaError, Result};
pub use router::{Invocation, RequestRouter, Route};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
