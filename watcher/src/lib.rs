//! Dual-source file-change watcher: a kernel notification source and a
//! periodic polling fallback, funneled into one bounded queue drained by a
//! single dispatcher thread that deduplicates and invokes the caller's
//! handler.
//!
//! The scan source is not optional scaffolding — it heals events dropped
//! by a full kernel-notification queue and catches paths that only became
//! watchable after startup.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};

use chrono::Utc;
use notify::{RecommendedWatcher, RecursiveMode, Watcher as NotifyWatcherTrait};
use serde::{Deserialize, Serialize};
use thiserror::Error;

const DEDUP_WINDOW: Duration = Duration::from_secs(2);
const QUEUE_CAPACITY: usize = 4096;
const THREAD_JOIN_BOUND: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum WatcherError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("notify error: {0}")]
    Notify(#[from] notify::Error),
}

pub type Result<T> = std::result::Result<T, WatcherError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WatchEventType {
    Modify,
    Delete,
    Create,
    Move,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchEvent {
    pub event_type: WatchEventType,
    pub file_path: String,
    pub timestamp: chrono::DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatcherStatistics {
    pub is_running: bool,
    pub is_paused: bool,
    pub kernel_source_enabled: bool,
    pub protected_paths_count: usize,
    pub watched_files_count: usize,
    pub pending_events: usize,
    pub fallback_interval_secs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct FileState {
    mtime: SystemTime,
    size: u64,
    inode: u64,
}

pub type EventHandler = dyn Fn(WatchEvent) + Send + Sync + 'static;

struct RawEvent {
    event_type: WatchEventType,
    path: PathBuf,
}

pub struct Watcher {
    protected_paths: Arc<Mutex<HashSet<PathBuf>>>,
    file_states: Arc<Mutex<HashMap<PathBuf, FileState>>>,
    running: Arc<AtomicBool>,
    paused: Arc<AtomicBool>,
    use_kernel: bool,
    fallback_interval: Duration,
    pending_events: Arc<AtomicUsize>,
    handler: Arc<EventHandler>,

    notify_watcher: Mutex<Option<RecommendedWatcher>>,
    raw_tx: Mutex<Option<SyncSender<RawEvent>>>,
    threads: Mutex<Vec<std::thread::JoinHandle<()>>>,
}

impl Watcher {
    pub fn new(
        protected_paths: Vec<PathBuf>,
        use_kernel: bool,
        fallback_interval: Duration,
        handler: impl Fn(WatchEvent) + Send + Sync + 'static,
    ) -> Self {
        Self {
            protected_paths: Arc::new(Mutex::new(protected_paths.into_iter().collect())),
            file_states: Arc::new(Mutex::new(HashMap::new())),
            running: Arc::new(AtomicBool::new(false)),
            paused: Arc::new(AtomicBool::new(false)),
            use_kernel,
            fallback_interval,
            pending_events: Arc::new(AtomicUsize::new(0)),
            handler: Arc::new(handler),
            notify_watcher: Mutex::new(None),
            raw_tx: Mutex::new(None),
            threads: Mutex::new(Vec::new()),
        }
    }

    pub fn start(&self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.init_file_states();

        let (tx, rx) = sync_channel::<RawEvent>(QUEUE_CAPACITY);
        *self.raw_tx.lock().unwrap() = Some(tx.clone());

        let mut threads = Vec::new();

        if self.use_kernel {
            let watch_tx = tx.clone();
            let watch_pending = self.pending_events.clone();
            let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
                if let Ok(event) = res {
                    for raw in map_notify_event(event) {
                        send_raw(&watch_tx, &watch_pending, raw);
                    }
                }
            })?;
            for path in self.protected_paths.lock().unwrap().iter() {
                watcher.watch(path, RecursiveMode::Recursive)?;
            }
            *self.notify_watcher.lock().unwrap() = Some(watcher);
        }

        threads.push(self.spawn_poll_thread(tx.clone()));
        threads.push(self.spawn_dispatcher_thread(rx));

        *self.threads.lock().unwrap() = threads;
        Ok(())
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        *self.raw_tx.lock().unwrap() = None;
        *self.notify_watcher.lock().unwrap() = None;

        let handles = std::mem::take(&mut *self.threads.lock().unwrap());
        let deadline = Instant::now() + THREAD_JOIN_BOUND;
        for handle in handles {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                tracing::warn!("watcher thread join bound exceeded, abandoning");
                continue;
            }
            let _ = handle.join();
        }
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    pub fn add_path(&self, path: PathBuf) -> Result<()> {
        self.protected_paths.lock().unwrap().insert(path.clone());
        self.update_file_states_for_path(&path);
        if let Some(watcher) = self.notify_watcher.lock().unwrap().as_mut() {
            watcher.watch(&path, RecursiveMode::Recursive)?;
        }
        Ok(())
    }

    pub fn remove_path(&self, path: &Path) -> Result<()> {
        self.protected_paths.lock().unwrap().remove(path);
        self.file_states
            .lock()
            .unwrap()
            .retain(|cached, _| !cached.starts_with(path));
        if let Some(watcher) = self.notify_watcher.lock().unwrap().as_mut() {
            let _ = watcher.unwatch(path);
        }
        Ok(())
    }

    pub fn statistics(&self) -> WatcherStatistics {
        WatcherStatistics {
            is_running: self.running.load(Ordering::SeqCst),
            is_paused: self.paused.load(Ordering::SeqCst),
            kernel_source_enabled: self.use_kernel,
            protected_paths_count: self.protected_paths.lock().unwrap().len(),
            watched_files_count: self.file_states.lock().unwrap().len(),
            pending_events: self.pending_events.load(Ordering::SeqCst),
            fallback_interval_secs: self.fallback_interval.as_secs(),
        }
    }

    fn init_file_states(&self) {
        let paths: Vec<PathBuf> = self.protected_paths.lock().unwrap().iter().cloned().collect();
        for path in paths {
            self.update_file_states_for_path(&path);
        }
    }

    fn update_file_states_for_path(&self, path: &Path) {
        let mut states = self.file_states.lock().unwrap();
        for entry in walkdir::WalkDir::new(path).into_iter().filter_map(|e| e.ok()) {
            if !entry.file_type().is_file() {
                continue;
            }
            if let Some(state) = read_file_state(entry.path()) {
                states.insert(entry.path().to_path_buf(), state);
            }
        }
    }

    fn spawn_poll_thread(&self, tx: SyncSender<RawEvent>) -> std::thread::JoinHandle<()> {
        let protected_paths = self.protected_paths.clone();
        let file_states = self.file_states.clone();
        let running = self.running.clone();
        let interval = self.fallback_interval;
        let pending = self.pending_events.clone();

        std::thread::Builder::new()
            .name("watcher-poll".into())
            .spawn(move || {
                while running.load(Ordering::SeqCst) {
                    let slept = sleep_in_ticks(interval, &running);
                    if !slept {
                        break;
                    }
                    let paths: Vec<PathBuf> = protected_paths.lock().unwrap().iter().cloned().collect();
                    for path in paths {
                        poll_path(&path, &file_states, &tx, &pending);
                    }
                }
            })
            .expect("spawn watcher-poll thread")
    }

    fn spawn_dispatcher_thread(&self, rx: Receiver<RawEvent>) -> std::thread::JoinHandle<()> {
        let running = self.running.clone();
        let paused = self.paused.clone();
        let pending = self.pending_events.clone();
        let handler = self.handler.clone();

        std::thread::Builder::new()
            .name("watcher-dispatch".into())
            .spawn(move || {
                let mut last_emit: HashMap<PathBuf, Instant> = HashMap::new();
                while running.load(Ordering::SeqCst) {
                    match rx.recv_timeout(Duration::from_secs(1)) {
                        Ok(raw) => {
                            pending.fetch_sub(1, Ordering::SeqCst);
                            if paused.load(Ordering::SeqCst) {
                                continue;
                            }
                            if is_duplicate(&mut last_emit, &raw.path) {
                                continue;
                            }
                            let event = WatchEvent {
                                event_type: raw.event_type,
                                file_path: raw.path.to_string_lossy().into_owned(),
                                timestamp: Utc::now(),
                            };
                            (handler)(event);
                        }
                        Err(std::sync::mpsc::RecvTimeoutError::Timeout) => continue,
                        Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => break,
                    }
                }
            })
            .expect("spawn watcher-dispatch thread")
    }
}

/// Drops a new event if the previous event on the same path occurred within
/// the dedup window, regardless of event type. This deliberately collapses
/// e.g. a `Delete` following a `Modify` within the window.
fn is_duplicate(last_emit: &mut HashMap<PathBuf, Instant>, path: &Path) -> bool {
    let now = Instant::now();
    if let Some(last) = last_emit.get(path) {
        if now.duration_since(*last) < DEDUP_WINDOW {
            return true;
        }
    }
    last_emit.insert(path.to_path_buf(), now);
    false
}

fn sleep_in_ticks(total: Duration, running: &AtomicBool) -> bool {
    let tick = Duration::from_millis(500);
    let mut elapsed = Duration::ZERO;
    while elapsed < total {
        if !running.load(Ordering::SeqCst) {
            return false;
        }
        let step = tick.min(total - elapsed);
        std::thread::sleep(step);
        elapsed += step;
    }
    running.load(Ordering::SeqCst)
}

fn poll_path(
    path: &Path,
    file_states: &Arc<Mutex<HashMap<PathBuf, FileState>>>,
    tx: &SyncSender<RawEvent>,
    pending: &Arc<AtomicUsize>,
) {
    let mut seen = HashSet::new();
    for entry in walkdir::WalkDir::new(path).into_iter().filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() {
            continue;
        }
        let file_path = entry.path().to_path_buf();
        seen.insert(file_path.clone());
        check_file_change(&file_path, file_states, tx, pending);
    }

    let mut states = file_states.lock().unwrap();
    let vanished: Vec<PathBuf> = states
        .keys()
        .filter(|cached| cached.starts_with(path) && !seen.contains(*cached) && !cached.exists())
        .cloned()
        .collect();
    for gone in vanished {
        states.remove(&gone);
        drop_send(tx, pending, RawEvent { event_type: WatchEventType::Delete, path: gone });
    }
}

fn check_file_change(
    path: &Path,
    file_states: &Arc<Mutex<HashMap<PathBuf, FileState>>>,
    tx: &SyncSender<RawEvent>,
    pending: &Arc<AtomicUsize>,
) {
    let Some(current) = read_file_state(path) else { return };
    let mut states = file_states.lock().unwrap();
    match states.get(path).copied() {
        None => {
            states.insert(path.to_path_buf(), current);
            drop(states);
            drop_send(tx, pending, RawEvent { event_type: WatchEventType::Create, path: path.to_path_buf() });
        }
        Some(previous) => {
            if previous.mtime != current.mtime || previous.size != current.size {
                states.insert(path.to_path_buf(), current);
                drop(states);
                drop_send(tx, pending, RawEvent { event_type: WatchEventType::Modify, path: path.to_path_buf() });
            }
        }
    }
}

fn drop_send(tx: &SyncSender<RawEvent>, pending: &Arc<AtomicUsize>, event: RawEvent) {
    if tx.try_send(event).is_ok() {
        pending.fetch_add(1, Ordering::SeqCst);
    }
}

/// Mirrors `drop_send` for the kernel source, which sends via a blocking
/// `send` from inside the `notify` callback rather than `try_send`. Every
/// enqueue here must increment `pending` too, or the dispatcher's
/// unconditional `fetch_sub` on receipt underflows the counter.
fn send_raw(tx: &SyncSender<RawEvent>, pending: &Arc<AtomicUsize>, event: RawEvent) {
    if tx.send(event).is_ok() {
        pending.fetch_add(1, Ordering::SeqCst);
    }
}

#[cfg(unix)]
fn read_file_state(path: &Path) -> Option<FileState> {
    use std::os::unix::fs::MetadataExt;
    let metadata = std::fs::metadata(path).ok()?;
    Some(FileState {
        mtime: metadata.modified().ok()?,
        size: metadata.len(),
        inode: metadata.ino(),
    })
}

#[cfg(not(unix))]
fn read_file_state(path: &Path) -> Option<FileState> {
    let metadata = std::fs::metadata(path).ok()?;
    Some(FileState {
        mtime: metadata.modified().ok()?,
        size: metadata.len(),
        inode: 0,
    })
}

fn map_notify_event(event: notify::Event) -> Vec<RawEvent> {
    use notify::EventKind;
    let event_type = match event.kind {
        EventKind::Create(_) => WatchEventType::Create,
        EventKind::Modify(notify::event::ModifyKind::Name(_)) => WatchEventType::Move,
        EventKind::Modify(_) => WatchEventType::Modify,
        EventKind::Remove(_) => WatchEventType::Delete,
        _ => return Vec::new(),
    };
    event
        .paths
        .into_iter()
        .filter(|p| p.is_file() || event_type == WatchEventType::Delete)
        .map(|path| RawEvent { event_type, path })
        .collect()
}
