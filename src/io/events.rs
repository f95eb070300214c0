use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

/// Maximum number of entries spelled out in an observation summary.
pub const SUMMARY_ENTRY_LIMIT: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Created,
    Modified,
    Deleted,
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeKind::Created => write!(f, "created"),
            ChangeKind::Modified => write!(f, "modified"),
            ChangeKind::Deleted => write!(f, "deleted"),
        }
    }
}

/// One filesystem change, path relative to the watched root.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub path: PathBuf,
    pub at: DateTime<Utc>,
}

/// An immutable batch of changes collected within one debounce window.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    events: Vec<ChangeEvent>,
}

impl Observation {
    pub fn new(events: Vec<ChangeEvent>) -> Self {
        Self { events }
    }

    pub fn events(&self) -> &[ChangeEvent] {
        &self.events
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Folds several observations (drained in arrival order) into one.
    pub fn merge(batches: Vec<Observation>) -> Observation {
        let mut window = ChangeWindow::default();
        for event in batches.into_iter().flat_map(|o| o.events) {
            window.push(event);
        }
        window.flush().unwrap_or_else(|| Observation::new(Vec::new()))
    }

    /// Human/LLM-readable digest. This is the only part of an observation that is persisted.
    pub fn summary(&self) -> String {
        if self.events.is_empty() {
            return "No changes observed.".to_string();
        }

        let mut out = format!("{} change(s) observed:", self.events.len());
        for event in self.events.iter().take(SUMMARY_ENTRY_LIMIT) {
            out.push_str(&format!("\n- {} {}", event.kind, event.path.display()));
        }
        if self.events.len() > SUMMARY_ENTRY_LIMIT {
            out.push_str(&format!(
                "\n... and {} more",
                self.events.len() - SUMMARY_ENTRY_LIMIT
            ));
        }
        out
    }
}

/// Per-path coalescing buffer for one debounce window.
///
/// Two events on the same path reduce to the later kind, except that a path
/// created inside the window stays `created` through later modifications and
/// disappears entirely if it is deleted again before the flush.
#[derive(Debug, Default)]
pub struct ChangeWindow {
    order: Vec<PathBuf>,
    entries: HashMap<PathBuf, WindowEntry>,
}

#[derive(Debug)]
struct WindowEntry {
    first: ChangeKind,
    last: ChangeKind,
    at: DateTime<Utc>,
}

impl ChangeWindow {
    pub fn push(&mut self, event: ChangeEvent) {
        match self.entries.get_mut(&event.path) {
            Some(entry) => {
                entry.last = event.kind;
                entry.at = event.at;
            }
            None => {
                self.order.push(event.path.clone());
                self.entries.insert(
                    event.path,
                    WindowEntry {
                        first: event.kind,
                        last: event.kind,
                        at: event.at,
                    },
                );
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drains the window. Returns `None` when every path coalesced away.
    pub fn flush(&mut self) -> Option<Observation> {
        let mut entries = std::mem::take(&mut self.entries);
        let events: Vec<ChangeEvent> = std::mem::take(&mut self.order)
            .into_iter()
            .filter_map(|path| {
                let entry = entries.remove(&path)?;
                let kind = match (entry.first, entry.last) {
                    (ChangeKind::Created, ChangeKind::Deleted) => return None,
                    (ChangeKind::Created, ChangeKind::Modified) => ChangeKind::Created,
                    (_, last) => last,
                };
                Some(ChangeEvent {
                    kind,
                    path,
                    at: entry.at,
                })
            })
            .collect();

        if events.is_empty() {
            None
        } else {
            Some(Observation::new(events))
        }
    }
}
