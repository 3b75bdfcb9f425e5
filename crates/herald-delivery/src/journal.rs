//! Delivery journal for surviving restarts.
//!
//! The manager records every pending-state change as a [`JournalEntry`].
//! [`FileJournal`] appends entries as JSON lines and folds them back into the
//! set of unresolved events on replay. [`NoopJournal`] keeps nothing.
//!
//! # File format
//!
//! ```text
//! {"kind":"upsert","event":{...}}
//! {"kind":"resolved","event_id":"acme_1700000000000000000","status":"delivered"}
//! ```
//!
//! Opening a file journal rewrites it to one `upsert` per surviving event.
//! A running journal compacts itself the same way after every
//! [`DEFAULT_COMPACTION_THRESHOLD`] resolved entries.

use std::{
    collections::HashMap,
    future::Future,
    path::{Path, PathBuf},
    pin::Pin,
};

use herald_core::{DeliveryEvent, DeliveryStatus, EventId};
use serde::{Deserialize, Serialize};
use tokio::{fs, io::AsyncWriteExt, sync::Mutex};
use tracing::{debug, info, warn};

use crate::error::{DeliveryError, Result};

/// Resolved entries appended before a running journal is compacted.
pub const DEFAULT_COMPACTION_THRESHOLD: usize = 1000;

/// One journaled state change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JournalEntry {
    /// Full snapshot of a pending event.
    Upsert {
        /// Event snapshot.
        event: DeliveryEvent,
    },
    /// Event left pending tracking.
    Resolved {
        /// Resolved event id.
        event_id: EventId,
        /// Terminal status.
        status: DeliveryStatus,
    },
}

/// Persistence of pending events.
pub trait DeliveryJournal: Send + Sync + 'static {
    /// Appends one entry.
    fn record(&self, entry: JournalEntry) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Returns unresolved events, oldest first.
    fn replay(&self) -> Pin<Box<dyn Future<Output = Result<Vec<DeliveryEvent>>> + Send + '_>>;
}

/// Journal that records nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopJournal;

impl DeliveryJournal for NoopJournal {
    fn record(&self, _entry: JournalEntry) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async { Ok(()) })
    }

    fn replay(&self) -> Pin<Box<dyn Future<Output = Result<Vec<DeliveryEvent>>> + Send + '_>> {
        Box::pin(async { Ok(Vec::new()) })
    }
}

/// Append-only JSON lines journal.
#[derive(Debug)]
pub struct FileJournal {
    path: PathBuf,
    compaction_threshold: usize,
    state: Mutex<JournalFile>,
}

#[derive(Debug)]
struct JournalFile {
    file: fs::File,
    resolved_since_compaction: usize,
}

impl FileJournal {
    /// Opens the journal at `path`, compacting any existing content.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::JournalError` when the file cannot be read,
    /// rewritten or opened for appending.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await?;
        }

        let survivors = read_unresolved(&path).await?;
        let file = rewrite(&path, &survivors).await?;
        info!(path = %path.display(), pending_events = survivors.len(), "opened delivery journal");

        Ok(Self {
            path,
            compaction_threshold: DEFAULT_COMPACTION_THRESHOLD,
            state: Mutex::new(JournalFile { file, resolved_since_compaction: 0 }),
        })
    }

    /// Sets how many resolved entries trigger a compaction. Zero disables
    /// compaction while running.
    #[must_use]
    pub fn with_compaction_threshold(mut self, threshold: usize) -> Self {
        self.compaction_threshold = threshold;
        self
    }

    /// Location of the journal file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Rewrites the file to one `upsert` per unresolved event and returns
    /// how many survived.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::JournalError` when the file cannot be
    /// rewritten.
    pub async fn compact(&self) -> Result<usize> {
        let mut state = self.state.lock().await;
        self.compact_locked(&mut state).await
    }

    async fn compact_locked(&self, state: &mut JournalFile) -> Result<usize> {
        state.file.flush().await?;
        let survivors = read_unresolved(&self.path).await?;
        state.file = rewrite(&self.path, &survivors).await?;
        state.resolved_since_compaction = 0;
        debug!(pending_events = survivors.len(), "compacted delivery journal");
        Ok(survivors.len())
    }
}

impl DeliveryJournal for FileJournal {
    fn record(&self, entry: JournalEntry) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            let mut line = serde_json::to_vec(&entry)
                .map_err(|e| DeliveryError::journal(format!("failed to encode entry: {e}")))?;
            line.push(b'\n');

            let mut state = self.state.lock().await;
            state.file.write_all(&line).await?;
            state.file.flush().await?;

            if matches!(entry, JournalEntry::Resolved { .. }) {
                state.resolved_since_compaction += 1;
                if self.compaction_threshold > 0
                    && state.resolved_since_compaction >= self.compaction_threshold
                {
                    self.compact_locked(&mut state).await?;
                }
            }
            Ok(())
        })
    }

    fn replay(&self) -> Pin<Box<dyn Future<Output = Result<Vec<DeliveryEvent>>> + Send + '_>> {
        Box::pin(async move {
            let _guard = self.state.lock().await;
            read_unresolved(&self.path).await
        })
    }
}

/// Folds journal lines into the unresolved events, oldest first.
///
/// Lines that fail to parse are skipped; a crash can leave a torn last line.
pub fn fold_entries(contents: &str) -> Vec<DeliveryEvent> {
    let mut pending: HashMap<EventId, DeliveryEvent> = HashMap::new();

    for (index, line) in contents.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<JournalEntry>(line) {
            Ok(JournalEntry::Upsert { event }) => {
                pending.insert(event.id.clone(), event);
            },
            Ok(JournalEntry::Resolved { event_id, .. }) => {
                pending.remove(&event_id);
            },
            Err(e) => {
                warn!(line = index + 1, error = %e, "skipping unreadable journal entry");
            },
        }
    }

    let mut events: Vec<_> = pending.into_values().collect();
    events.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
    events
}

async fn read_unresolved(path: &Path) -> Result<Vec<DeliveryEvent>> {
    match fs::read_to_string(path).await {
        Ok(contents) => Ok(fold_entries(&contents)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e.into()),
    }
}

/// Replaces the file with `survivors` and reopens it for appending.
async fn rewrite(path: &Path, survivors: &[DeliveryEvent]) -> Result<fs::File> {
    let mut buffer = Vec::new();
    for event in survivors {
        let entry = JournalEntry::Upsert { event: event.clone() };
        serde_json::to_writer(&mut buffer, &entry)
            .map_err(|e| DeliveryError::journal(format!("failed to encode entry: {e}")))?;
        buffer.push(b'\n');
    }

    let tmp_path = path.with_extension("compact");
    fs::write(&tmp_path, &buffer).await?;
    fs::rename(&tmp_path, path).await?;

    Ok(fs::OpenOptions::new().create(true).append(true).open(path).await?)
}
