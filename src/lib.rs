//! # percy-core
//!
//! The concurrency core of a visual-regression snapshot orchestrator. Many
//! snapshot requests are accepted, each triggers headless-browser asset
//! discovery, and discovered resources are uploaded to a remote build.
//!
//! The interesting machinery is the pipeline coordination:
//!
//! - a pair of priority task [`Queue`]s with per-task cancellation and a
//!   flush/drain barrier protocol,
//! - a build-state machine ([`Percy`]) that gates and serializes queue work
//!   across start/snapshot/flush/stop,
//! - a structured [`Logger`] with in-memory retention, namespace-filtered
//!   debug routing, and remote forwarding over a message socket.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use percy_core::{Config, Percy};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), percy_core::Error> {
//!     let percy = Percy::new(Config::default());
//!     percy.start().await?;
//!     percy.snapshot("https://example.com/pricing").await?;
//!     percy.stop(false).await?;
//!     Ok(())
//! }
//! ```
//!
//! Uploads can be deferred (`defer_uploads`), skipped (`skip_uploads`), or
//! replaced by a counting dry run (`dry_run`). All state is in-memory for a
//! single process lifetime; there is one logical tenant per process.

/// Configuration structures and upload-mode normalization
pub mod config;

/// Error types shared across the crate
pub mod error;

/// Cancelable units of work and the cancellation adapter
pub mod task;

/// Id-keyed priority queue with bounded concurrency and flush barriers
pub mod queue;

/// Structured logger with in-memory retention
pub mod logger;

/// Remote log forwarding over a bidirectional message socket
pub mod remote_logger;

/// Remote API client for builds and snapshot uploads
pub mod client;

/// Headless browser driver
pub mod browser;

/// Snapshot input forms, validation, gathering, and discovery seams
pub mod snapshot;

/// The top-level build-state machine
pub mod percy;

/// Counter and gauge handles recorded by the core
pub mod metrics;


pub use client::{ApiClient, BuildInfo, PercyClient, SnapshotUpload, UploadResource};
pub use config::{Config, DiscoveryConfig, SnapshotConfig};
pub use error::{ApiErrorDetail, Error};
pub use logger::{LogEntry, LogGroup, LogLevel, Logger, Namespaces};
pub use percy::{Build, Percy, PercyBuilder, ReadyState, SnapshotServer, BUILD_TASK_ID};
pub use queue::{Queue, TaskHandle, FLUSH_TASK_ID};
pub use remote_logger::{socket_pair, LogSocket, RemoteAttachment, REMOTE_TIMEOUT};
pub use snapshot::{
    AdditionalSnapshot, ResourceDiscoverer, Snapshot, SnapshotInput, SnapshotOptions,
    SnapshotSource,
};
pub use task::{CancelHandle, CancelToken, Cancelable, TaskBody, TaskWork};

pub use browser::{
    BrowserDriver, CaptureOptions, CapturedPage, ChromeBrowser, ChromeLaunchOptions, PageResource,
};
pub use metrics::CoreMetrics;
