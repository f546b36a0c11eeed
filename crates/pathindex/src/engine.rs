//! The long-running engine handle.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::builder::{builder_from_config, TreeBuilder};
use crate::config::{ConfigSource, EngineConfig};
use crate::error::{IndexError, Result};
use crate::persistence::SnapshotStore;
use crate::scheduler::{
    full_cycle, CycleContext, RefreshOutcome, Scheduler, SchedulerParts, SchedulerStats,
    StatsSnapshot, Trigger,
};
use crate::state::{IndexSnapshot, SharedIndex};
use crate::tree::{Leaf, PathNode};

/// Owns the refresh scheduler and exposes the published index.
///
/// Must be started from within a tokio runtime. Lookups never block on a
/// refresh; they read whichever snapshot is current.
pub struct IndexEngine {
    index: Arc<SharedIndex>,
    stats: Arc<SchedulerStats>,
    sender: mpsc::UnboundedSender<Trigger>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl IndexEngine {
    /// Starts with a fixed configuration.
    pub fn start(config: EngineConfig) -> Result<Self> {
        Self::start_with_source(ConfigSource::Static(config))
    }

    /// Starts from a TOML file that is polled for changes.
    pub fn start_from_file(path: impl AsRef<Path>) -> Result<Self> {
        Self::start_with_source(ConfigSource::File(PathBuf::from(path.as_ref())))
    }

    pub fn start_with_source(source: ConfigSource) -> Result<Self> {
        let (config, config_hash) = source.load()?;
        let builder = builder_from_config(&config)?;
        Ok(Self::spawn(source, config, config_hash, builder, false))
    }

    /// Starts with a caller-supplied tree builder. Config reloads keep it.
    pub fn start_with_builder(config: EngineConfig, builder: Arc<dyn TreeBuilder>) -> Self {
        Self::spawn(ConfigSource::Static(config.clone()), config, 0, builder, true)
    }

    fn spawn(
        source: ConfigSource,
        config: EngineConfig,
        config_hash: u64,
        builder: Arc<dyn TreeBuilder>,
        fixed_builder: bool,
    ) -> Self {
        let index = Arc::new(SharedIndex::new());
        let stats = Arc::new(SchedulerStats::default());
        let (sender, receiver) = mpsc::unbounded_channel();
        let (shutdown, shutdown_rx) = watch::channel(false);

        tracing::info!(
            "starting index engine: paths={} root_paths={} builder={}",
            config.paths.len(),
            config.root_paths.len(),
            builder.name()
        );
        let scheduler = Scheduler::new(SchedulerParts {
            source,
            config,
            config_hash,
            builder,
            fixed_builder,
            index: index.clone(),
            stats: stats.clone(),
            sender: sender.clone(),
            receiver,
            shutdown: shutdown_rx,
        });
        let task = tokio::spawn(scheduler.run());

        Self {
            index,
            stats,
            sender,
            shutdown,
            task: Mutex::new(Some(task)),
        }
    }

    pub fn index(&self) -> Arc<SharedIndex> {
        self.index.clone()
    }

    pub fn current(&self) -> Arc<IndexSnapshot> {
        self.index.current()
    }

    pub fn find_by_filename(&self, name: &str) -> Vec<Leaf> {
        self.index.find_by_filename(name)
    }

    pub fn find_by_root(&self, root: &str) -> Option<Arc<PathNode>> {
        self.index.find_by_root(root)
    }

    pub fn find_by_parent_folder(&self, folder: &str) -> Option<Arc<PathNode>> {
        self.index.find_by_parent_folder(folder)
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Queues a full refresh without waiting for it.
    pub fn request_refresh(&self) -> Result<()> {
        self.sender
            .send(Trigger::Forced { done: None })
            .map_err(|_| IndexError::Stopped)
    }

    /// Queues a full refresh and waits for the cycle that serves it.
    ///
    /// Subject to the cooldown; requests queued together share one cycle.
    pub async fn refresh_now(&self) -> Result<RefreshOutcome> {
        let (done, outcome) = oneshot::channel();
        self.sender
            .send(Trigger::Forced { done: Some(done) })
            .map_err(|_| IndexError::Stopped)?;
        outcome.await.map_err(|_| IndexError::Stopped)
    }

    /// Stops the scheduler and its watchers. A cycle already running on the
    /// blocking pool finishes first; pending requests are dropped.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(error) = task.await {
                tracing::warn!("refresh scheduler ended abnormally: {error}");
            }
        }
    }
}

/// Runs a single full cycle on the calling thread, without a scheduler.
///
/// Uses the persisted snapshot when it still matches the filesystem.
pub fn refresh_once(config: &EngineConfig) -> Result<(Arc<SharedIndex>, RefreshOutcome)> {
    let ctx = CycleContext {
        index: Arc::new(SharedIndex::new()),
        stats: Arc::new(SchedulerStats::default()),
        builder: builder_from_config(config)?,
        store: config.cache.dir.clone().map(SnapshotStore::new),
        builder_key: config.builder_key(),
    };
    let (outcome, _) = full_cycle(&ctx, config, false);
    Ok((ctx.index, outcome))
}

impl Drop for IndexEngine {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}
