//! Append-only write journal
//!
//! The journal is a JSON-lines file. Two kinds of line are written:
//!
//! ```text
//! {"line":"entry",  "seq":1, "key":..., "op":..., "prev_hash":"00..", "hash":"9f.."}
//! {"line":"status", "seq":1, "sync_state":"SYNCED", "attempts":1, ...}
//! ```
//!
//! Entry lines form a SHA-256 hash chain over their immutable fields. Status
//! lines record sync-state changes and are folded into their entry when the
//! file is opened. Nothing is ever rewritten or removed, so the file doubles
//! as the persistent form of the store: replaying the entries in sequence
//! order rebuilds every record.
//!
//! Every line is flushed and fsynced before the call returns. Without a
//! path the journal lives in memory only.

use crate::entry::{
    JournalEntry, JournalLine, JournalOp, Origin, StatusUpdate, SyncState, GENESIS_HASH,
};
use crate::error::{SyncError, SyncResult};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use strata_core::{EntityKey, Stamp};

/// File name of the journal inside a data directory
pub const JOURNAL_FILE: &str = "journal.jsonl";

/// Entry counts by sync state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JournalCounts {
    /// Entries never pushed
    pub pending: usize,
    /// Entries whose last push failed
    pub failed: usize,
    /// Entries confirmed by the remote
    pub synced: usize,
}

#[derive(Debug)]
struct JournalState {
    entries: BTreeMap<u64, JournalEntry>,
    /// Unsynced sequence numbers per key
    unsynced: HashMap<EntityKey, BTreeSet<u64>>,
    last_hash: String,
    in_flight: HashSet<u64>,
    file: Option<File>,
}

impl JournalState {
    fn new(entries: BTreeMap<u64, JournalEntry>, last_hash: String, file: Option<File>) -> Self {
        let mut unsynced: HashMap<EntityKey, BTreeSet<u64>> = HashMap::new();
        for entry in entries.values().filter(|entry| !entry.is_synced()) {
            unsynced
                .entry(entry.key.clone())
                .or_default()
                .insert(entry.seq);
        }
        Self {
            entries,
            unsynced,
            last_hash,
            in_flight: HashSet::new(),
            file,
        }
    }

    fn mark_settled(&mut self, key: &EntityKey, seq: u64) {
        if let Some(seqs) = self.unsynced.get_mut(key) {
            seqs.remove(&seq);
            if seqs.is_empty() {
                self.unsynced.remove(key);
            }
        }
    }

    /// First unsynced entry of `key`
    fn oldest_unsynced(&self, key: &EntityKey) -> Option<u64> {
        self.unsynced.get(key).and_then(|seqs| seqs.first().copied())
    }
}

/// Durable, hash-chained journal of mutations
#[derive(Debug)]
pub struct Journal {
    path: Option<PathBuf>,
    state: Mutex<JournalState>,
}

impl Journal {
    /// Create a journal that is not backed by a file
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            path: None,
            state: Mutex::new(JournalState::new(
                BTreeMap::new(),
                GENESIS_HASH.to_string(),
                None,
            )),
        }
    }

    /// Open (or create) the journal file at `path`, verifying the hash chain
    ///
    /// A final line without a newline that does not parse is the remains of
    /// an append that never returned; it is cut off with a warning.
    ///
    /// # Errors
    /// - `SyncError::Io` if the file cannot be read or opened for append
    /// - `SyncError::Serialization` if a complete line is not valid JSON
    /// - `SyncError::BrokenChain` if sequence numbers or hashes do not line up
    /// - `SyncError::UnknownEntry` if a status line precedes its entry
    pub fn open(path: impl AsRef<Path>) -> SyncResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).map_err(|e| SyncError::io(dir, e))?;
        }

        let mut entries = BTreeMap::new();
        let mut last_hash = GENESIS_HASH.to_string();
        let mut torn_at = None;
        let mut unterminated = false;

        if path.exists() {
            let text = fs::read_to_string(&path)
                .map_err(|e| SyncError::io(&path, e))?;
            let body_len = text.rfind('\n').map_or(0, |i| i + 1);
            let (body, tail) = text.split_at(body_len);

            for line in body.lines().filter(|line| !line.trim().is_empty()) {
                let line = serde_json::from_str::<JournalLine>(line)?;
                fold_line(line, &mut entries, &mut last_hash)?;
            }

            if !tail.trim().is_empty() {
                match serde_json::from_str::<JournalLine>(tail) {
                    Ok(line) => {
                        fold_line(line, &mut entries, &mut last_hash)?;
                        unterminated = true;
                    }
                    Err(e) => {
                        tracing::warn!(
                            path = %path.display(),
                            bytes = tail.len(),
                            error = %e,
                            "dropping torn journal line"
                        );
                        torn_at = Some(body_len as u64);
                    }
                }
            }
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| SyncError::io(&path, e))?;
        if let Some(len) = torn_at {
            file.set_len(len).map_err(|e| SyncError::io(&path, e))?;
            file.sync_data().map_err(|e| SyncError::io(&path, e))?;
        }
        if unterminated {
            file.write_all(b"\n").map_err(|e| SyncError::io(&path, e))?;
            file.sync_data().map_err(|e| SyncError::io(&path, e))?;
        }

        tracing::info!(path = %path.display(), entries = entries.len(), "journal opened");

        Ok(Self {
            path: Some(path),
            state: Mutex::new(JournalState::new(entries, last_hash, Some(file))),
        })
    }

    /// Backing file, if any
    #[inline]
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Append a PENDING entry and make it durable
    ///
    /// # Errors
    /// - `SyncError::Io` if the line cannot be written and synced
    pub fn append(
        &self,
        key: EntityKey,
        op: JournalOp,
        origin: Origin,
        stamp: Stamp,
    ) -> SyncResult<JournalEntry> {
        let mut state = self.state.lock();
        let seq = state.entries.len() as u64 + 1;
        let entry = JournalEntry::new(seq, key, op, origin, stamp, state.last_hash.clone())?;

        self.write_line(&mut state, &JournalLine::Entry(entry.clone()))?;
        state.last_hash.clone_from(&entry.hash);
        state
            .unsynced
            .entry(entry.key.clone())
            .or_default()
            .insert(seq);
        state.entries.insert(seq, entry.clone());

        tracing::debug!(seq, key = %entry.key, op = entry.op.name(), "journal entry appended");
        Ok(entry)
    }

    /// Record a confirmed push
    ///
    /// # Errors
    /// - `SyncError::UnknownEntry` if `seq` is not in the journal
    /// - `SyncError::Io` if the status line cannot be written
    pub fn mark_synced(&self, seq: u64) -> SyncResult<JournalEntry> {
        self.update_status(seq, |entry| {
            entry.sync_state = SyncState::Synced;
            entry.attempts = entry.attempts.saturating_add(1);
            entry.last_error = None;
            entry.next_attempt_at = None;
        })
    }

    /// Record a failed push and when to try again
    ///
    /// # Errors
    /// - `SyncError::UnknownEntry` if `seq` is not in the journal
    /// - `SyncError::Io` if the status line cannot be written
    pub fn mark_failed(
        &self,
        seq: u64,
        error: &str,
        next_attempt_at: DateTime<Utc>,
    ) -> SyncResult<JournalEntry> {
        self.update_status(seq, |entry| {
            entry.sync_state = SyncState::Failed;
            entry.attempts = entry.attempts.saturating_add(1);
            entry.last_error = Some(error.to_string());
            entry.next_attempt_at = Some(next_attempt_at);
        })
    }

    /// Reserve an entry for one push
    ///
    /// False if the entry is synced, already in flight, or an earlier entry
    /// of the same key is not yet synced. Each key therefore reaches the
    /// remote in sequence order.
    #[must_use]
    pub fn claim(&self, seq: u64) -> bool {
        let mut state = self.state.lock();
        let Some(key) = state.entries.get(&seq).map(|entry| entry.key.clone()) else {
            return false;
        };
        if state.oldest_unsynced(&key) != Some(seq) {
            return false;
        }
        state.in_flight.insert(seq)
    }

    /// Release a claim taken with [`Self::claim`]
    pub fn release(&self, seq: u64) {
        self.state.lock().in_flight.remove(&seq);
    }

    /// Check if a push of `seq` is running
    #[must_use]
    pub fn is_in_flight(&self, seq: u64) -> bool {
        self.state.lock().in_flight.contains(&seq)
    }

    /// Next never-pushed entry of the same key as `seq`, if it is now first in line
    #[must_use]
    pub fn next_pending_after(&self, seq: u64) -> Option<u64> {
        let state = self.state.lock();
        let key = &state.entries.get(&seq)?.key;
        let next = state.oldest_unsynced(key)?;
        let entry = state.entries.get(&next)?;
        (next > seq && entry.sync_state == SyncState::Pending).then_some(next)
    }

    /// Get entry by sequence number
    #[must_use]
    pub fn get(&self, seq: u64) -> Option<JournalEntry> {
        self.state.lock().entries.get(&seq).cloned()
    }

    /// All entries in sequence order
    #[must_use]
    pub fn entries(&self) -> Vec<JournalEntry> {
        self.state.lock().entries.values().cloned().collect()
    }

    /// Entries not yet confirmed by the remote, in sequence order
    #[must_use]
    pub fn unsynced(&self) -> Vec<JournalEntry> {
        self.state
            .lock()
            .entries
            .values()
            .filter(|entry| !entry.is_synced())
            .cloned()
            .collect()
    }

    /// Entry counts by sync state
    #[must_use]
    pub fn counts(&self) -> JournalCounts {
        let state = self.state.lock();
        let mut counts = JournalCounts::default();
        for entry in state.entries.values() {
            match entry.sync_state {
                SyncState::Pending => counts.pending += 1,
                SyncState::Failed => counts.failed += 1,
                SyncState::Synced => counts.synced += 1,
            }
        }
        counts
    }

    /// Sequence number of the last entry (0 when empty)
    #[must_use]
    pub fn last_seq(&self) -> u64 {
        self.state.lock().entries.len() as u64
    }

    /// Number of entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// Check if the journal is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.lock().entries.is_empty()
    }

    /// Re-verify the in-memory hash chain
    ///
    /// # Errors
    /// - `SyncError::BrokenChain` at the first entry that does not verify
    pub fn verify(&self) -> SyncResult<()> {
        let state = self.state.lock();
        let mut prev = GENESIS_HASH.to_string();
        for (index, entry) in state.entries.values().enumerate() {
            verify_link(entry, index as u64 + 1, &prev)?;
            prev.clone_from(&entry.hash);
        }
        Ok(())
    }

    fn update_status(
        &self,
        seq: u64,
        change: impl FnOnce(&mut JournalEntry),
    ) -> SyncResult<JournalEntry> {
        let mut state = self.state.lock();
        let mut entry = state
            .entries
            .get(&seq)
            .cloned()
            .ok_or(SyncError::UnknownEntry(seq))?;
        change(&mut entry);

        self.write_line(&mut state, &JournalLine::Status(entry.status()))?;
        if entry.is_synced() {
            state.mark_settled(&entry.key, seq);
        }
        state.entries.insert(seq, entry.clone());
        Ok(entry)
    }

    /// Write one line and fsync it; a failed write is cut off again
    fn write_line(&self, state: &mut JournalState, line: &JournalLine) -> SyncResult<()> {
        let Some(file) = state.file.as_mut() else {
            return Ok(());
        };
        let path = self
            .path
            .as_deref()
            .unwrap_or_else(|| Path::new(JOURNAL_FILE));

        let mut bytes = serde_json::to_vec(line)?;
        bytes.push(b'\n');

        let len = file.metadata().map_err(|e| SyncError::io(path, e))?.len();
        if let Err(e) = file.write_all(&bytes).and_then(|()| file.sync_data()) {
            if let Err(truncate) = file.set_len(len) {
                tracing::error!(
                    path = %path.display(),
                    error = %truncate,
                    "could not cut off failed journal write"
                );
            }
            return Err(SyncError::io(path, e));
        }
        Ok(())
    }
}

impl Default for Journal {
    fn default() -> Self {
        Self::in_memory()
    }
}

/// Fold one parsed line into the entries read so far
fn fold_line(
    line: JournalLine,
    entries: &mut BTreeMap<u64, JournalEntry>,
    last_hash: &mut String,
) -> SyncResult<()> {
    match line {
        JournalLine::Entry(entry) => {
            verify_link(&entry, entries.len() as u64 + 1, last_hash)?;
            last_hash.clone_from(&entry.hash);
            entries.insert(entry.seq, entry);
        }
        JournalLine::Status(status) => {
            entries
                .get_mut(&status.seq)
                .ok_or(SyncError::UnknownEntry(status.seq))?
                .apply_status(&status);
        }
    }
    Ok(())
}

/// Check one entry against the expected sequence number and predecessor hash
fn verify_link(entry: &JournalEntry, expected_seq: u64, prev_hash: &str) -> SyncResult<()> {
    if entry.seq != expected_seq {
        return Err(SyncError::BrokenChain {
            seq: entry.seq,
            reason: format!("expected seq {expected_seq}"),
        });
    }
    if entry.prev_hash != prev_hash {
        return Err(SyncError::BrokenChain {
            seq: entry.seq,
            reason: "prev_hash does not match previous entry".to_string(),
        });
    }
    if entry.compute_hash()? != entry.hash {
        return Err(SyncError::BrokenChain {
            seq: entry.seq,
            reason: "content hash mismatch".to_string(),
        });
    }
    Ok(())
}
