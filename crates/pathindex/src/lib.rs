//! Path index engine.
//!
//! Keeps an in-memory index of every file under a configured set of roots:
//! - Parallel scanning and a path-set fingerprint for change detection
//! - Nested per-root trees with filename, root and parent-folder lookups
//! - Snapshot persistence with compression
//! - Rate-limited refresh driven by timers, requests and filesystem events

pub mod builder;
pub mod classify;
pub mod config;
pub mod engine;
pub mod error;
pub mod fingerprint;
pub mod persistence;
pub mod scan;
pub mod scheduler;
pub mod state;
pub mod tree;
pub mod watcher;

// Re-export main types
pub use builder::{builder_from_config, HelperProcessBuilder, InProcessBuilder, TreeBuilder};
pub use classify::{Classifier, MimeClassifier, Probe};
pub use config::{ConfigSource, EngineConfig};
pub use engine::{refresh_once, IndexEngine};
pub use error::{IndexError, Result};
pub use fingerprint::{fingerprint, Fingerprint};
pub use persistence::SnapshotStore;
pub use scan::{RootKind, RootSpec, ScanOutcome};
pub use scheduler::{RefreshOutcome, RefreshPhase, StatsSnapshot};
pub use state::{IndexSnapshot, SharedIndex};
pub use tree::{IndexState, Leaf, PathNode};
