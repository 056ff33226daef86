//! File watching for the dev server.
//!
//! Raw notify events are filtered and pushed into a tokio channel. A
//! [`Debouncer`] coalesces them into batches and guarantees that at most one
//! invalidation pass runs at a time.

use notify::{
    event::{CreateKind, ModifyKind, RemoveKind, RenameMode},
    Config, Event, EventKind, PollWatcher, RecommendedWatcher, RecursiveMode,
    Watcher as NotifyWatcher,
};
use std::collections::BTreeSet;
use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Poll interval for the fallback backend.
const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Directory names never watched.
const IGNORED_DIRS: &[&str] = &["node_modules", ".git", "target"];

/// Where the debouncer is in its cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebounceState {
    Idle,
    /// Collecting events until the deadline passes.
    Debouncing { deadline: Instant },
    /// A batch was handed out and its pass has not completed.
    Invalidating,
}

/// Coalesces change events into batches. Pure: time is passed in.
#[derive(Debug)]
pub struct Debouncer {
    window: Duration,
    state: DebounceState,
    pending: BTreeSet<PathBuf>,
    /// Events that arrived while a pass was running.
    queued: BTreeSet<PathBuf>,
}

impl Debouncer {
    #[must_use]
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            state: DebounceState::Idle,
            pending: BTreeSet::new(),
            queued: BTreeSet::new(),
        }
    }

    #[must_use]
    pub fn state(&self) -> DebounceState {
        self.state
    }

    /// When the current batch becomes due, if one is being collected.
    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        match self.state {
            DebounceState::Debouncing { deadline } => Some(deadline),
            _ => None,
        }
    }

    /// Record changed paths. Restarts the timer while debouncing.
    pub fn on_event<I>(&mut self, paths: I, now: Instant)
    where
        I: IntoIterator<Item = PathBuf>,
    {
        match self.state {
            DebounceState::Invalidating => self.queued.extend(paths),
            DebounceState::Idle | DebounceState::Debouncing { .. } => {
                self.pending.extend(paths);
                if !self.pending.is_empty() {
                    self.state = DebounceState::Debouncing {
                        deadline: now + self.window,
                    };
                }
            }
        }
    }

    /// Hand out the batch once the deadline has passed.
    pub fn poll(&mut self, now: Instant) -> Option<Vec<PathBuf>> {
        match self.state {
            DebounceState::Debouncing { deadline } if now >= deadline => {
                self.state = DebounceState::Invalidating;
                Some(std::mem::take(&mut self.pending).into_iter().collect())
            }
            _ => None,
        }
    }

    /// The pass for the last batch finished.
    pub fn on_pass_complete(&mut self, now: Instant) {
        if self.state != DebounceState::Invalidating {
            return;
        }
        if self.queued.is_empty() {
            self.state = DebounceState::Idle;
        } else {
            self.pending = std::mem::take(&mut self.queued);
            self.state = DebounceState::Debouncing {
                deadline: now + self.window,
            };
        }
    }
}

/// Backend a [`FileWatcher`] ended up with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchBackend {
    Native,
    Polling,
    Disabled,
}

impl WatchBackend {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Native => "native",
            Self::Polling => "polling",
            Self::Disabled => "disabled",
        }
    }
}

/// Failure to start a watch backend. Never fatal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatcherError {
    pub backend: WatchBackend,
    pub message: String,
}

impl WatcherError {
    fn new(backend: WatchBackend, err: &notify::Error) -> Self {
        Self {
            backend,
            message: err.to_string(),
        }
    }
}

impl fmt::Display for WatcherError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} watcher failed: {}", self.backend.as_str(), self.message)
    }
}

impl std::error::Error for WatcherError {}

/// Which paths under a root are worth reporting.
#[derive(Debug, Clone)]
pub struct WatchFilter {
    root: PathBuf,
    out_dir: PathBuf,
}

impl WatchFilter {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>, out_dir: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            out_dir: out_dir.into(),
        }
    }

    /// Dependency folders, VCS metadata, build output and dotfiles are
    /// ignored. Only the part of the path below the root is inspected.
    #[must_use]
    pub fn should_ignore(&self, path: &Path) -> bool {
        if path.starts_with(&self.out_dir) {
            return true;
        }
        let Ok(rel) = path.strip_prefix(&self.root) else {
            return true;
        };
        rel.components().any(|c| {
            let name = c.as_os_str().to_string_lossy();
            IGNORED_DIRS.contains(&name.as_ref()) || name.starts_with('.')
        })
    }
}

/// Check if we should process this event.
fn should_process_event(event: &Event) -> bool {
    match &event.kind {
        EventKind::Create(CreateKind::File | CreateKind::Any) => true,
        EventKind::Modify(
            ModifyKind::Data(_)
            | ModifyKind::Any
            | ModifyKind::Name(RenameMode::To | RenameMode::From | RenameMode::Both | RenameMode::Any),
        ) => true,
        EventKind::Remove(RemoveKind::File | RemoveKind::Any) => true,
        // Directories, metadata and access events
        _ => false,
    }
}

fn event_handler(
    filter: WatchFilter,
    tx: mpsc::UnboundedSender<Vec<PathBuf>>,
) -> impl FnMut(notify::Result<Event>) + Send + 'static {
    move |res: notify::Result<Event>| match res {
        Ok(event) => {
            if !should_process_event(&event) {
                return;
            }
            let paths: Vec<PathBuf> = event
                .paths
                .into_iter()
                .filter(|p| !filter.should_ignore(p))
                .collect();
            if paths.is_empty() {
                return;
            }
            if let Err(e) = tx.send(paths) {
                debug!(error = %e, "Watch receiver dropped");
            }
        }
        Err(e) => {
            error!(error = %e, "Watch error");
        }
    }
}

// Held only to keep the watch alive
enum Backend {
    Native { _watcher: RecommendedWatcher },
    Polling { _watcher: PollWatcher },
}

/// Recursive watch over a project root. Dropping it stops watching.
pub struct FileWatcher {
    backend: WatchBackend,
    _inner: Option<Backend>,
}

impl fmt::Debug for FileWatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileWatcher")
            .field("backend", &self.backend)
            .finish_non_exhaustive()
    }
}

impl FileWatcher {
    /// Watch `root`, falling back to polling when the native backend is
    /// unavailable. Never fails: with no usable backend, watching is off.
    pub fn start(
        root: &Path,
        filter: WatchFilter,
        tx: mpsc::UnboundedSender<Vec<PathBuf>>,
    ) -> Self {
        match start_native(root, event_handler(filter.clone(), tx.clone())) {
            Ok(watcher) => {
                info!(root = %root.display(), "Watching directory");
                return Self {
                    backend: WatchBackend::Native,
                    _inner: Some(Backend::Native { _watcher: watcher }),
                };
            }
            Err(err) => warn!(error = %err, "Falling back to polling watcher"),
        }

        match start_polling(root, event_handler(filter, tx)) {
            Ok(watcher) => {
                info!(root = %root.display(), interval_ms = POLL_INTERVAL.as_millis() as u64, "Polling directory");
                Self {
                    backend: WatchBackend::Polling,
                    _inner: Some(Backend::Polling { _watcher: watcher }),
                }
            }
            Err(err) => {
                warn!(error = %err, "File watching disabled");
                Self::disabled()
            }
        }
    }

    /// A watcher that reports nothing.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            backend: WatchBackend::Disabled,
            _inner: None,
        }
    }

    #[must_use]
    pub fn backend(&self) -> WatchBackend {
        self.backend
    }
}

fn start_native<F>(root: &Path, handler: F) -> Result<RecommendedWatcher, WatcherError>
where
    F: FnMut(notify::Result<Event>) + Send + 'static,
{
    let mut watcher = RecommendedWatcher::new(handler, Config::default())
        .map_err(|e| WatcherError::new(WatchBackend::Native, &e))?;
    watcher
        .watch(root, RecursiveMode::Recursive)
        .map_err(|e| WatcherError::new(WatchBackend::Native, &e))?;
    Ok(watcher)
}

fn start_polling<F>(root: &Path, handler: F) -> Result<PollWatcher, WatcherError>
where
    F: FnMut(notify::Result<Event>) + Send + 'static,
{
    let config = Config::default()
        .with_poll_interval(POLL_INTERVAL)
        .with_compare_contents(true);
    let mut watcher = PollWatcher::new(handler, config)
        .map_err(|e| WatcherError::new(WatchBackend::Polling, &e))?;
    watcher
        .watch(root, RecursiveMode::Recursive)
        .map_err(|e| WatcherError::new(WatchBackend::Polling, &e))?;
    Ok(watcher)
}

/// Drive a [`Debouncer`] from `rx`, awaiting `on_batch` for every batch.
/// Batches never overlap. Returns when the channel closes.
pub async fn run_debounced<F, Fut>(
    mut rx: mpsc::UnboundedReceiver<Vec<PathBuf>>,
    window: Duration,
    mut on_batch: F,
) where
    F: FnMut(Vec<PathBuf>) -> Fut,
    Fut: Future<Output = ()>,
{
    let mut debouncer = Debouncer::new(window);
    loop {
        let received = match debouncer.deadline() {
            Some(deadline) => {
                tokio::time::timeout_at(tokio::time::Instant::from_std(deadline), rx.recv())
                    .await
                    .ok()
            }
            None => Some(rx.recv().await),
        };
        match received {
            Some(Some(paths)) => debouncer.on_event(paths, Instant::now()),
            Some(None) => {
                debug!("Watch event channel closed");
                break;
            }
            // Deadline reached
            None => {}
        }

        if let Some(batch) = debouncer.poll(Instant::now()) {
            debug!(count = batch.len(), "Processing coalesced file events");
            on_batch(batch).await;
            // Anything that arrived during the pass is already in the channel
            while let Ok(paths) = rx.try_recv() {
                debouncer.on_event(paths, Instant::now());
            }
            debouncer.on_pass_complete(Instant::now());
        }
    }
}
