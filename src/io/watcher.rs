use crate::io::events::{ChangeEvent, ChangeKind, ChangeWindow, Observation};
use crate::io::ignore::IgnoreSet;
use anyhow::{Context, Result};
use chrono::Utc;
use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TryRecvError, Receiver, Sender};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const RAW_CHANNEL_CAPACITY: usize = 1024;
const OBSERVATION_CHANNEL_CAPACITY: usize = 256;

/// Live handle on a recursive watch.
///
/// Observations are produced lazily by a background debounce task. Dropping
/// the handle (or calling [`ChangeObserver::stop`]) releases the OS watch.
/// Events that occur while no observer is alive are never replayed.
pub struct ChangeObserver {
    watcher: Option<RecommendedWatcher>,
    rx: Receiver<Observation>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

/// Starts watching `root` recursively.
pub fn watch(root: &Path, ignore: IgnoreSet, debounce: Duration) -> Result<ChangeObserver> {
    let root = root
        .canonicalize()
        .with_context(|| format!("Cannot watch {}", root.display()))?;
    let (raw_tx, raw_rx) = mpsc::channel::<ChangeEvent>(RAW_CHANNEL_CAPACITY);
    let (obs_tx, obs_rx) = mpsc::channel::<Observation>(OBSERVATION_CHANNEL_CAPACITY);

    let callback_root = root.clone();
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
        Ok(event) => {
            for change in classify(&event, &callback_root, &ignore) {
                if raw_tx.blocking_send(change).is_err() {
                    return;
                }
            }
        }
        Err(e) => warn!(error = %e, "watch error"),
    })?;

    watcher
        .watch(&root, RecursiveMode::Recursive)
        .with_context(|| format!("Failed to watch {}", root.display()))?;
    info!(root = %root.display(), debounce_ms = debounce.as_millis() as u64, "change observer online");

    let cancel = CancellationToken::new();
    let task = tokio::spawn(debounce_loop(raw_rx, obs_tx, debounce, cancel.clone()));

    Ok(ChangeObserver {
        watcher: Some(watcher),
        rx: obs_rx,
        cancel,
        task: Some(task),
    })
}

impl ChangeObserver {
    /// An observer fed from an existing channel instead of an OS watch.
    pub fn from_channel(rx: Receiver<Observation>) -> Self {
        Self {
            watcher: None,
            rx,
            cancel: CancellationToken::new(),
            task: None,
        }
    }

    /// Waits for the next observation. `None` once the observer is stopped.
    pub async fn next(&mut self) -> Option<Observation> {
        self.rx.recv().await
    }

    /// Takes every observation flushed so far without waiting.
    pub fn drain(&mut self) -> Vec<Observation> {
        let mut out = Vec::new();
        loop {
            match self.rx.try_recv() {
                Ok(obs) => out.push(obs),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        out
    }

    /// Releases the watch handle and waits for the debounce task to exit.
    /// Observations still queued are discarded.
    pub async fn stop(mut self) {
        self.release();
        self.rx.close();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }

    fn release(&mut self) {
        self.cancel.cancel();
        if self.watcher.take().is_some() {
            debug!("watch handle released");
        }
    }
}

impl Drop for ChangeObserver {
    fn drop(&mut self) {
        self.release();
    }
}

async fn debounce_loop(
    mut raw_rx: Receiver<ChangeEvent>,
    obs_tx: Sender<Observation>,
    debounce: Duration,
    cancel: CancellationToken,
) {
    let mut window = ChangeWindow::default();

    loop {
        let first = tokio::select! {
            _ = cancel.cancelled() => return,
            ev = raw_rx.recv() => match ev {
                Some(ev) => ev,
                None => return,
            },
        };
        window.push(first);

        // The window opens on the first event and closes after `debounce`.
        let deadline = Instant::now() + debounce;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = sleep_until(deadline) => break,
                ev = raw_rx.recv() => match ev {
                    Some(ev) => window.push(ev),
                    None => break,
                },
            }
        }

        if let Some(observation) = window.flush() {
            debug!(entries = observation.events().len(), "observation flushed");
            // A full queue must not outlive a stop request.
            tokio::select! {
                _ = cancel.cancelled() => return,
                sent = obs_tx.send(observation) => if sent.is_err() {
                    return;
                },
            }
        }
    }
}

/// Maps one notify event onto zero or more relative, non-ignored changes.
fn classify(event: &Event, root: &Path, ignore: &IgnoreSet) -> Vec<ChangeEvent> {
    let kinded: Vec<(ChangeKind, &PathBuf)> = match &event.kind {
        EventKind::Create(_) => event.paths.iter().map(|p| (ChangeKind::Created, p)).collect(),
        EventKind::Remove(_) => event.paths.iter().map(|p| (ChangeKind::Deleted, p)).collect(),
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
            event.paths.iter().map(|p| (ChangeKind::Deleted, p)).collect()
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
            event.paths.iter().map(|p| (ChangeKind::Created, p)).collect()
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) if event.paths.len() == 2 => vec![
            (ChangeKind::Deleted, &event.paths[0]),
            (ChangeKind::Created, &event.paths[1]),
        ],
        EventKind::Modify(ModifyKind::Name(_)) => event
            .paths
            .iter()
            .map(|p| {
                let kind = if p.exists() { ChangeKind::Created } else { ChangeKind::Deleted };
                (kind, p)
            })
            .collect(),
        // chmod/touch noise
        EventKind::Modify(ModifyKind::Metadata(_)) => Vec::new(),
        EventKind::Modify(_) => event.paths.iter().map(|p| (ChangeKind::Modified, p)).collect(),
        _ => Vec::new(),
    };

    let at = Utc::now();
    kinded
        .into_iter()
        .filter_map(|(kind, path)| {
            let relative = path.strip_prefix(root).ok()?.to_path_buf();
            if relative.as_os_str().is_empty() || ignore.is_ignored(&relative) {
                return None;
            }
            Some(ChangeEvent { kind, path: relative, at })
        })
        .collect()
}
