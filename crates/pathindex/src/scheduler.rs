//! Refresh scheduling.
//!
//! A single task owns the refresh cycle. Periodic ticks, forced refreshes,
//! watcher events and config polls all arrive as [`Trigger`]s on one channel;
//! the task coalesces whatever is queued, waits out the cooldown of the
//! operations involved, and runs one cycle at a time on the blocking pool.
//!
//! Full cycle: `Idle → Scanning → Detecting → (Skipping | Rebuilding) → Idle`.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{interval, interval_at, sleep_until, Instant, Interval, MissedTickBehavior};

use crate::builder::{builder_from_config, TreeBuilder};
use crate::config::{ConfigSource, EngineConfig};
use crate::fingerprint::{fingerprint, Fingerprint};
use crate::persistence::SnapshotStore;
use crate::scan::{resolve_roots, scan_root, scan_roots, RootSpec, ScanOutcome};
use crate::state::{IndexSnapshot, SharedIndex};
use crate::watcher::{affected_roots, WatchSet};

/// Cooldown key of the full refresh cycle.
pub const FULL_REFRESH: &str = "refresh";

/// Cooldown key of a change-driven rescan of one root.
pub fn rescan_operation(root: &str) -> String {
    format!("rescan:{root}")
}

/// A request for the scheduler.
#[derive(Debug)]
pub enum Trigger {
    /// The periodic ticker fired.
    Periodic,
    /// Someone asked for a refresh; `done` receives the cycle's outcome.
    Forced {
        done: Option<oneshot::Sender<RefreshOutcome>>,
    },
    /// The watcher saw changes under these paths.
    Changed { paths: Vec<PathBuf> },
    /// Time to check whether the config file changed.
    ConfigPoll,
}

/// Where the scheduler currently is in a cycle.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
#[repr(u8)]
pub enum RefreshPhase {
    Idle = 0,
    Scanning = 1,
    Detecting = 2,
    Skipping = 3,
    Rebuilding = 4,
}

impl RefreshPhase {
    pub fn load(atomic: &AtomicU8) -> Self {
        match atomic.load(Ordering::Relaxed) {
            1 => Self::Scanning,
            2 => Self::Detecting,
            3 => Self::Skipping,
            4 => Self::Rebuilding,
            _ => Self::Idle,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Scanning => "scanning",
            Self::Detecting => "detecting",
            Self::Skipping => "skipping",
            Self::Rebuilding => "rebuilding",
        }
    }
}

/// What one cycle did.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum RefreshOutcome {
    /// The tree builder ran and the result was published and persisted.
    Rebuilt {
        fingerprint: Fingerprint,
        roots: usize,
        leaves: usize,
    },
    /// The persisted snapshot matched and was published instead of building.
    Restored {
        fingerprint: Fingerprint,
        roots: usize,
        leaves: usize,
    },
    /// The published snapshot already matched the filesystem.
    Unchanged { fingerprint: Fingerprint },
    /// Watcher-driven rescan of individual roots.
    Patched { roots: Vec<String>, leaves: usize },
    /// The cycle aborted; the previous snapshot stays published.
    Failed { reason: String },
}

impl RefreshOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }
}

impl fmt::Display for RefreshOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rebuilt {
                fingerprint,
                roots,
                leaves,
            } => write!(f, "rebuilt fingerprint={fingerprint} roots={roots} leaves={leaves}"),
            Self::Restored {
                fingerprint,
                roots,
                leaves,
            } => write!(f, "restored fingerprint={fingerprint} roots={roots} leaves={leaves}"),
            Self::Unchanged { fingerprint } => write!(f, "unchanged fingerprint={fingerprint}"),
            Self::Patched { roots, leaves } => {
                write!(f, "patched roots={} leaves={leaves}", roots.join(","))
            }
            Self::Failed { reason } => write!(f, "failed: {reason}"),
        }
    }
}

/// Counters shared between the scheduler task and the engine handle.
#[derive(Debug, Default)]
pub struct SchedulerStats {
    phase: AtomicU8,
    cycles: AtomicU64,
    rebuilds: AtomicU64,
    restores: AtomicU64,
    unchanged: AtomicU64,
    patches: AtomicU64,
    failures: AtomicU64,
}

/// A point-in-time copy of [`SchedulerStats`].
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct StatsSnapshot {
    pub phase: RefreshPhase,
    pub cycles: u64,
    pub rebuilds: u64,
    pub restores: u64,
    pub unchanged: u64,
    pub patches: u64,
    pub failures: u64,
}

impl SchedulerStats {
    pub fn set_phase(&self, phase: RefreshPhase) {
        self.phase.store(phase as u8, Ordering::Relaxed);
    }

    pub fn record(&self, outcome: &RefreshOutcome) {
        self.cycles.fetch_add(1, Ordering::Relaxed);
        let counter = match outcome {
            RefreshOutcome::Rebuilt { .. } => &self.rebuilds,
            RefreshOutcome::Restored { .. } => &self.restores,
            RefreshOutcome::Unchanged { .. } => &self.unchanged,
            RefreshOutcome::Patched { .. } => &self.patches,
            RefreshOutcome::Failed { .. } => &self.failures,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            phase: RefreshPhase::load(&self.phase),
            cycles: self.cycles.load(Ordering::Relaxed),
            rebuilds: self.rebuilds.load(Ordering::Relaxed),
            restores: self.restores.load(Ordering::Relaxed),
            unchanged: self.unchanged.load(Ordering::Relaxed),
            patches: self.patches.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }
}

/// Minimum spacing between runs of the same named operation.
///
/// A run requested before the boundary is delayed to it, never dropped.
#[derive(Debug)]
pub struct Cooldown {
    min_interval: Duration,
    last_fired: HashMap<String, Instant>,
}

impl Cooldown {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_fired: HashMap::new(),
        }
    }

    pub fn set_min_interval(&mut self, min_interval: Duration) {
        self.min_interval = min_interval;
    }

    /// `None` if `operation` may run now, otherwise the earliest instant it may.
    pub fn ready_at(&self, operation: &str) -> Option<Instant> {
        let last = self.last_fired.get(operation)?;
        let boundary = *last + self.min_interval;
        (boundary > Instant::now()).then_some(boundary)
    }

    pub fn mark(&mut self, operation: &str) {
        self.last_fired.insert(operation.to_string(), Instant::now());
    }
}

/// Triggers coalesced into one unit of work.
#[derive(Debug, Default)]
struct Batch {
    full: bool,
    changed: Vec<PathBuf>,
    waiters: Vec<oneshot::Sender<RefreshOutcome>>,
    config_poll: bool,
    triggers: usize,
}

impl Batch {
    fn absorb(&mut self, trigger: Trigger) {
        self.triggers += 1;
        match trigger {
            Trigger::Periodic => self.full = true,
            Trigger::Forced { done } => {
                self.full = true;
                self.waiters.extend(done);
            }
            Trigger::Changed { paths } => self.changed.extend(paths),
            Trigger::ConfigPoll => self.config_poll = true,
        }
    }
}

/// Everything a cycle needs, cloneable onto the blocking pool.
#[derive(Clone)]
pub(crate) struct CycleContext {
    pub index: Arc<SharedIndex>,
    pub stats: Arc<SchedulerStats>,
    pub builder: Arc<dyn TreeBuilder>,
    pub store: Option<SnapshotStore>,
    /// [`EngineConfig::builder_key`] of the settings `builder` was made from.
    pub builder_key: u64,
}

/// Runs one full cycle. Returns the outcome and the roots it resolved.
///
/// `force` skips both fingerprint checks; set after a config reload, since
/// builder settings are not part of the fingerprint.
pub(crate) fn full_cycle(
    ctx: &CycleContext,
    config: &EngineConfig,
    force: bool,
) -> (RefreshOutcome, Vec<RootSpec>) {
    ctx.stats.set_phase(RefreshPhase::Scanning);
    let roots = resolve_roots(config);
    let scan = scan_roots(&roots);

    ctx.stats.set_phase(RefreshPhase::Detecting);
    let fingerprint = fingerprint(scan.paths());
    let current = ctx.index.current();

    let outcome = if !force && current.fingerprint == Some(fingerprint) {
        ctx.stats.set_phase(RefreshPhase::Skipping);
        RefreshOutcome::Unchanged { fingerprint }
    } else if let Some(snapshot) = restore_snapshot(ctx, fingerprint, force) {
        ctx.stats.set_phase(RefreshPhase::Skipping);
        let published = ctx.index.publish(snapshot);
        RefreshOutcome::Restored {
            fingerprint,
            roots: published.roots.len(),
            leaves: published.leaf_count(),
        }
    } else {
        ctx.stats.set_phase(RefreshPhase::Rebuilding);
        rebuild(ctx, &scan, &roots, fingerprint)
    };

    ctx.stats.set_phase(RefreshPhase::Idle);
    (outcome, roots)
}

fn restore_snapshot(
    ctx: &CycleContext,
    fingerprint: Fingerprint,
    force: bool,
) -> Option<IndexSnapshot> {
    if force {
        return None;
    }
    let store = ctx.store.as_ref()?;
    if store.load_fingerprint()? != fingerprint {
        return None;
    }
    let (_, snapshot) = store.load(ctx.builder_key)?;
    Some(snapshot)
}

fn rebuild(
    ctx: &CycleContext,
    scan: &ScanOutcome,
    roots: &[RootSpec],
    fingerprint: Fingerprint,
) -> RefreshOutcome {
    let state = match ctx.builder.build(scan, roots) {
        Ok(state) => state,
        Err(error) => {
            tracing::warn!(
                "{} tree builder failed, keeping previous index: {}",
                ctx.builder.name(),
                error
            );
            return RefreshOutcome::Failed {
                reason: error.to_string(),
            };
        }
    };

    let published = ctx
        .index
        .publish(IndexSnapshot::new(Some(fingerprint), state, unix_now_secs()));
    if let Some(store) = &ctx.store {
        if let Err(error) = store.save(fingerprint, ctx.builder_key, &published) {
            tracing::warn!(
                "index snapshot write failed for {}: {}",
                store.dir().display(),
                error
            );
        }
    }
    RefreshOutcome::Rebuilt {
        fingerprint,
        roots: published.roots.len(),
        leaves: published.leaf_count(),
    }
}

/// Rescans the named roots and splices them into the published state.
///
/// No fingerprint check and no persistence: the result no longer matches a
/// full scan, so it is published with an unknown fingerprint.
pub(crate) fn patch_cycle(
    ctx: &CycleContext,
    roots: &[RootSpec],
    names: &BTreeSet<String>,
) -> RefreshOutcome {
    ctx.stats.set_phase(RefreshPhase::Scanning);
    let specs: Vec<RootSpec> = roots
        .iter()
        .filter(|spec| names.contains(&spec.name()))
        .cloned()
        .collect();
    let mut scan = ScanOutcome::default();
    for spec in &specs {
        match scan_root(spec) {
            Some(files) => scan.files.extend(files),
            None => scan.skipped_roots.push(spec.path.clone()),
        }
    }
    scan.files.sort();

    ctx.stats.set_phase(RefreshPhase::Rebuilding);
    let outcome = match ctx.builder.build(&scan, &specs) {
        Ok(mut built) => {
            let mut roots = ctx.index.current().roots.clone();
            for name in names {
                match built.remove(name) {
                    Some(node) => {
                        roots.insert(name.clone(), Arc::new(node));
                    }
                    None => {
                        roots.remove(name);
                    }
                }
            }
            let published = ctx
                .index
                .publish(IndexSnapshot::from_roots(None, roots, unix_now_secs()));
            RefreshOutcome::Patched {
                roots: names.iter().cloned().collect(),
                leaves: published.leaf_count(),
            }
        }
        Err(error) => {
            tracing::warn!("rescan of {names:?} failed, keeping previous index: {error}");
            RefreshOutcome::Failed {
                reason: error.to_string(),
            }
        }
    };
    ctx.stats.set_phase(RefreshPhase::Idle);
    outcome
}

/// The scheduler task's state.
pub(crate) struct Scheduler {
    source: ConfigSource,
    config: EngineConfig,
    config_hash: u64,
    roots: Vec<RootSpec>,
    ctx: CycleContext,
    /// Set when the builder was injected rather than derived from config.
    fixed_builder: bool,
    /// Set by a config reload; the next full cycle rebuilds unconditionally.
    force_rebuild: bool,
    cooldown: Cooldown,
    watches: WatchSet,
    ticker: Interval,
    config_poll: Option<Interval>,
    sender: mpsc::UnboundedSender<Trigger>,
    receiver: mpsc::UnboundedReceiver<Trigger>,
    shutdown: watch::Receiver<bool>,
}

pub(crate) struct SchedulerParts {
    pub source: ConfigSource,
    pub config: EngineConfig,
    pub config_hash: u64,
    pub builder: Arc<dyn TreeBuilder>,
    pub fixed_builder: bool,
    pub index: Arc<SharedIndex>,
    pub stats: Arc<SchedulerStats>,
    pub sender: mpsc::UnboundedSender<Trigger>,
    pub receiver: mpsc::UnboundedReceiver<Trigger>,
    pub shutdown: watch::Receiver<bool>,
}

impl Scheduler {
    pub(crate) fn new(parts: SchedulerParts) -> Self {
        let SchedulerParts {
            source,
            config,
            config_hash,
            builder,
            fixed_builder,
            index,
            stats,
            sender,
            receiver,
            shutdown,
        } = parts;

        let mut ticker = interval(config.refresh.rebuild_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let config_poll = poll_interval(&source, &config);
        let roots = resolve_roots(&config);

        Self {
            cooldown: Cooldown::new(config.refresh.min_interval()),
            ctx: CycleContext {
                index,
                stats,
                builder,
                store: config.cache.dir.clone().map(SnapshotStore::new),
                builder_key: config.builder_key(),
            },
            source,
            config,
            config_hash,
            roots,
            fixed_builder,
            force_rebuild: false,
            watches: WatchSet::default(),
            ticker,
            config_poll,
            sender,
            receiver,
            shutdown,
        }
    }

    pub(crate) async fn run(mut self) {
        self.restart_watchers();
        tracing::info!(
            "refresh scheduler started roots={} rebuild_interval={:?} min_interval={:?}",
            self.roots.len(),
            self.config.refresh.rebuild_interval(),
            self.config.refresh.min_interval()
        );

        loop {
            let trigger = tokio::select! {
                biased;
                _ = self.shutdown.changed() => break,
                trigger = self.receiver.recv() => match trigger {
                    Some(trigger) => trigger,
                    None => break,
                },
                _ = self.ticker.tick() => Trigger::Periodic,
                _ = tick_optional(&mut self.config_poll) => Trigger::ConfigPoll,
            };
            if !self.handle(trigger).await {
                break;
            }
        }

        self.watches.stop_all();
        self.ctx.stats.set_phase(RefreshPhase::Idle);
        tracing::info!("refresh scheduler stopped");
    }

    /// Coalesces `first` with everything queued, waits for the cooldown and
    /// runs the batch. Returns `false` on shutdown.
    async fn handle(&mut self, first: Trigger) -> bool {
        let mut batch = Batch::default();
        batch.absorb(first);

        loop {
            while let Ok(trigger) = self.receiver.try_recv() {
                batch.absorb(trigger);
            }
            if std::mem::take(&mut batch.config_poll) && self.reload_config_if_changed() {
                batch.full = true;
            }

            let operations = self.operations(&batch);
            if operations.is_empty() {
                return true;
            }
            let deadline = operations
                .iter()
                .filter_map(|operation| self.cooldown.ready_at(operation))
                .max();
            let Some(deadline) = deadline else {
                break;
            };
            tracing::debug!(
                "delaying {:?} until cooldown ends in {:?}",
                operations,
                deadline.saturating_duration_since(Instant::now())
            );
            tokio::select! {
                _ = sleep_until(deadline) => {}
                _ = self.shutdown.changed() => return false,
            }
        }

        tracing::debug!("running refresh batch of {} triggers", batch.triggers);
        self.execute(batch).await;
        true
    }

    fn operations(&self, batch: &Batch) -> Vec<String> {
        if batch.full {
            return vec![FULL_REFRESH.to_string()];
        }
        self.affected_root_names(&batch.changed)
            .iter()
            .map(|name| rescan_operation(name))
            .collect()
    }

    fn affected_root_names(&self, paths: &[PathBuf]) -> BTreeSet<String> {
        affected_roots(&self.roots, paths)
            .into_iter()
            .map(|index| self.roots[index].name())
            .collect()
    }

    async fn execute(&mut self, batch: Batch) {
        let outcome = if batch.full {
            self.cooldown.mark(FULL_REFRESH);
            let ctx = self.ctx.clone();
            let config = self.config.clone();
            let force = std::mem::take(&mut self.force_rebuild);
            match tokio::task::spawn_blocking(move || full_cycle(&ctx, &config, force)).await {
                Ok((outcome, roots)) => {
                    if roots != self.roots {
                        self.roots = roots;
                        self.restart_watchers();
                    }
                    outcome
                }
                Err(error) => cycle_panicked(&error),
            }
        } else {
            let names = self.affected_root_names(&batch.changed);
            for name in &names {
                self.cooldown.mark(&rescan_operation(name));
            }
            let ctx = self.ctx.clone();
            let roots = self.roots.clone();
            match tokio::task::spawn_blocking(move || patch_cycle(&ctx, &roots, &names)).await {
                Ok(outcome) => outcome,
                Err(error) => cycle_panicked(&error),
            }
        };

        self.ctx.stats.set_phase(RefreshPhase::Idle);
        self.ctx.stats.record(&outcome);
        if outcome.is_failure() {
            tracing::warn!("refresh cycle {outcome}");
        } else {
            tracing::info!("refresh cycle {outcome}");
        }
        for waiter in batch.waiters {
            let _ = waiter.send(outcome.clone());
        }
    }

    fn restart_watchers(&mut self) {
        self.watches.stop_all();
        if self.config.watch.enabled {
            self.watches = WatchSet::start(&self.roots, &self.sender);
        }
    }

    /// Reloads the config file if its bytes changed. A config that fails to
    /// load is logged and the previous one kept.
    fn reload_config_if_changed(&mut self) -> bool {
        if !self.source.is_file() {
            return false;
        }
        let Some(hash) = self.source.current_hash() else {
            tracing::warn!("config file unreadable, keeping previous config");
            return false;
        };
        if hash == self.config_hash {
            return false;
        }
        self.config_hash = hash;

        match self.source.load() {
            Ok((config, hash)) => {
                tracing::info!("config changed, reloading (hash={hash:016x})");
                self.config_hash = hash;
                self.apply_config(config);
                true
            }
            Err(error) => {
                tracing::warn!("config reload failed, keeping previous config: {error}");
                false
            }
        }
    }

    fn apply_config(&mut self, config: EngineConfig) {
        if !self.fixed_builder {
            match builder_from_config(&config) {
                Ok(builder) => {
                    self.ctx.builder = builder;
                    self.ctx.builder_key = config.builder_key();
                }
                Err(error) => tracing::warn!("keeping previous tree builder: {error}"),
            }
        }
        self.ctx.store = config.cache.dir.clone().map(SnapshotStore::new);
        self.cooldown.set_min_interval(config.refresh.min_interval());

        let period = config.refresh.rebuild_interval();
        if period != self.config.refresh.rebuild_interval() {
            self.ticker = interval_at(Instant::now() + period, period);
            self.ticker
                .set_missed_tick_behavior(MissedTickBehavior::Delay);
        }
        if config.refresh.config_poll_secs != self.config.refresh.config_poll_secs {
            self.config_poll = poll_interval(&self.source, &config);
        }

        self.roots = resolve_roots(&config);
        self.config = config;
        self.force_rebuild = true;
        self.restart_watchers();
    }
}

fn poll_interval(source: &ConfigSource, config: &EngineConfig) -> Option<Interval> {
    if !source.is_file() {
        return None;
    }
    let period = config.refresh.config_poll_interval()?;
    let mut poll = interval_at(Instant::now() + period, period);
    poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
    Some(poll)
}

async fn tick_optional(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

fn cycle_panicked(error: &tokio::task::JoinError) -> RefreshOutcome {
    RefreshOutcome::Failed {
        reason: format!("refresh cycle panicked: {error}"),
    }
}

/// Returns the current Unix timestamp in seconds.
pub fn unix_now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|value| value.as_secs())
        .unwrap_or(0)
}
