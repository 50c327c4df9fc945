//! Crash-safe record of fetch progress, keyed by a fingerprint of the request.
//!
//! The record is a JSON-lines journal: a header line carrying the fingerprint,
//! then one line per completed segment, appended and synced as segments land.

use std::borrow::Cow;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::{Result, RewindError};

pub const STATE_FILE_NAME: &str = "resume.jsonl";
pub const LOCK_FILE_NAME: &str = "resume.lock";

/// SHA-256 (hex) identifying one resolved fetch request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

#[derive(Serialize)]
struct CanonicalRequest<'a> {
    start: u64,
    end: u64,
    streams: Vec<&'a str>,
    destination: &'a Path,
}

impl Fingerprint {
    /// Fingerprint of a sequence range fetched for `streams` into `destination`.
    pub fn compute(start: u64, end: u64, streams: &[&str], destination: &Path) -> Result<Self> {
        let destination = std::path::absolute(destination)?;
        let mut streams = streams.to_vec();
        streams.sort_unstable();
        streams.dedup();

        let canonical = serde_json::to_vec(&CanonicalRequest {
            start,
            end,
            streams,
            destination: &destination,
        })
        .map_err(|e| RewindError::Internal {
            reason: format!("failed to encode fetch request: {e}"),
        })?;
        Ok(Self(hex::encode(Sha256::digest(&canonical))))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumeState {
    pub fingerprint: Fingerprint,
    pub created_at: DateTime<Utc>,
    /// Completed sequences per stream id.
    pub streams: BTreeMap<String, BTreeSet<u64>>,
}

impl ResumeState {
    pub fn new(fingerprint: Fingerprint) -> Self {
        Self {
            fingerprint,
            created_at: Utc::now(),
            streams: BTreeMap::new(),
        }
    }

    pub fn is_complete(&self, stream: &str, sequence: u64) -> bool {
        self.streams
            .get(stream)
            .is_some_and(|done| done.contains(&sequence))
    }

    pub fn mark_complete(&mut self, stream: &str, sequence: u64) {
        self.streams
            .entry(stream.to_owned())
            .or_default()
            .insert(sequence);
    }

    pub fn completed(&self, stream: &str) -> usize {
        self.streams.get(stream).map_or(0, BTreeSet::len)
    }
}

#[derive(Serialize, Deserialize)]
struct JournalHeader {
    fingerprint: Fingerprint,
    created_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize)]
struct JournalEntry<'a> {
    #[serde(borrow)]
    stream: Cow<'a, str>,
    sequence: u64,
}

fn encode_line(value: &impl Serialize) -> Result<Vec<u8>> {
    let mut line = serde_json::to_vec(value).map_err(|e| RewindError::Internal {
        reason: format!("failed to encode resume state: {e}"),
    })?;
    line.push(b'\n');
    Ok(line)
}

/// Location of the resume journal inside a run directory.
#[derive(Debug, Clone)]
pub struct ResumeStore {
    path: PathBuf,
}

impl ResumeStore {
    pub fn new(run_dir: &Path) -> Self {
        Self {
            path: run_dir.join(STATE_FILE_NAME),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the state recorded for `fingerprint`, or start a fresh one.
    ///
    /// Missing, unreadable and foreign journals all yield a fresh state. A
    /// torn last line left by a crash mid-append is dropped.
    pub async fn load(&self, fingerprint: &Fingerprint) -> ResumeState {
        let content = match tokio::fs::read(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return ResumeState::new(fingerprint.clone());
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Cannot read resume state, starting over");
                return ResumeState::new(fingerprint.clone());
            }
        };

        let mut lines = content.split(|b| *b == b'\n');
        let header = match serde_json::from_slice::<JournalHeader>(lines.next().unwrap_or_default()) {
            Ok(header) => header,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Corrupt resume state, starting over");
                return ResumeState::new(fingerprint.clone());
            }
        };
        if header.fingerprint != *fingerprint {
            warn!(
                path = %self.path.display(),
                found = %header.fingerprint,
                expected = %fingerprint,
                "Resume state belongs to a different request, starting over"
            );
            return ResumeState::new(fingerprint.clone());
        }

        let mut state = ResumeState {
            fingerprint: header.fingerprint,
            created_at: header.created_at,
            streams: BTreeMap::new(),
        };
        let mut lines = lines.filter(|line| !line.is_empty()).peekable();
        while let Some(line) = lines.next() {
            match serde_json::from_slice::<JournalEntry>(line) {
                Ok(entry) => state.mark_complete(&entry.stream, entry.sequence),
                Err(_) if lines.peek().is_none() && !content.ends_with(b"\n") => {
                    debug!(path = %self.path.display(), "Dropping torn resume entry");
                }
                Err(e) => {
                    warn!(path = %self.path.display(), error = %e, "Skipping unreadable resume entry");
                }
            }
        }
        debug!(
            path = %self.path.display(),
            completed = state.streams.values().map(BTreeSet::len).sum::<usize>(),
            "Resuming fetch run"
        );
        state
    }

    /// Rewrite the journal from `state` atomically: write a sibling, fsync, rename.
    pub async fn save(&self, state: &ResumeState) -> Result<()> {
        let mut content = encode_line(&JournalHeader {
            fingerprint: state.fingerprint.clone(),
            created_at: state.created_at,
        })?;
        for (stream, sequences) in &state.streams {
            for &sequence in sequences {
                content.extend(encode_line(&JournalEntry {
                    stream: Cow::Borrowed(stream.as_str()),
                    sequence,
                })?);
            }
        }
        let tmp_path = self.path.with_extension("jsonl.tmp");

        let mut file = File::create(&tmp_path).await?;
        file.write_all(&content).await?;
        file.sync_all().await?;
        drop(file);

        if let Err(e) = tokio::fs::rename(&tmp_path, &self.path).await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn open_journal(&self) -> Result<File> {
        Ok(tokio::fs::OpenOptions::new()
            .append(true)
            .open(&self.path)
            .await?)
    }

    pub async fn remove(&self) -> Result<()> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[derive(Debug)]
struct Journal {
    state: ResumeState,
    file: Option<File>,
}

/// Shared progress of one run. Every completion is synced to the journal
/// before it counts.
#[derive(Debug)]
pub struct ResumeTracker {
    store: ResumeStore,
    journal: Mutex<Journal>,
}

impl ResumeTracker {
    pub fn new(store: ResumeStore, state: ResumeState) -> Self {
        Self {
            store,
            journal: Mutex::new(Journal { state, file: None }),
        }
    }

    pub fn store(&self) -> &ResumeStore {
        &self.store
    }

    pub async fn is_complete(&self, stream: &str, sequence: u64) -> bool {
        self.journal.lock().await.state.is_complete(stream, sequence)
    }

    /// Append one completion to the journal.
    pub async fn mark_complete(&self, stream: &str, sequence: u64) -> Result<()> {
        let mut journal = self.journal.lock().await;
        if journal.state.is_complete(stream, sequence) {
            return Ok(());
        }
        let line = encode_line(&JournalEntry {
            stream: Cow::Borrowed(stream),
            sequence,
        })?;

        let file = match journal.file.take() {
            Some(file) => file,
            None => self.store.open_journal().await?,
        };
        let file = journal.file.insert(file);
        if let Err(e) = append_synced(file, &line).await {
            // Reopen on the next append.
            journal.file = None;
            return Err(e.into());
        }
        journal.state.mark_complete(stream, sequence);
        Ok(())
    }

    /// Compact the journal to the current state and keep it open for appends.
    pub async fn persist(&self) -> Result<()> {
        let mut journal = self.journal.lock().await;
        self.store.save(&journal.state).await?;
        journal.file = Some(self.store.open_journal().await?);
        Ok(())
    }
}

async fn append_synced(file: &mut File, line: &[u8]) -> std::io::Result<()> {
    file.write_all(line).await?;
    file.sync_data().await
}

/// Exclusive claim on a run directory, released on drop.
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
}

impl RunLock {
    /// Take the lock in `run_dir`. With `force`, a leftover lock from a
    /// crashed run is removed first.
    pub fn acquire(run_dir: &Path, force: bool) -> Result<Self> {
        let path = run_dir.join(LOCK_FILE_NAME);
        if force {
            match std::fs::remove_file(&path) {
                Ok(()) => warn!(path = %path.display(), "Removed existing run lock"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }

        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut file) => {
                writeln!(file, "{}", std::process::id())?;
                Ok(Self { path })
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                Err(RewindError::RunLocked { path })
            }
            Err(e) => Err(e.into()),
        }
    }

}

impl Drop for RunLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            debug!(path = %self.path.display(), error = %e, "Failed to remove run lock");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn fingerprint(dir: &Path) -> Fingerprint {
        Fingerprint::compute(10, 20, &["140", "248"], dir).unwrap()
    }

    #[test]
    fn fingerprint_ignores_stream_order() {
        let dir = TempDir::new().unwrap();
        let a = Fingerprint::compute(10, 20, &["248", "140"], dir.path()).unwrap();
        let b = fingerprint(dir.path());
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), 64);

        let other = Fingerprint::compute(10, 21, &["140", "248"], dir.path()).unwrap();
        assert_ne!(a, other);
    }

    #[tokio::test]
    async fn state_survives_save_and_load() {
        let dir = TempDir::new().unwrap();
        let store = ResumeStore::new(dir.path());
        let mut state = ResumeState::new(fingerprint(dir.path()));
        state.mark_complete("140", 11);
        state.mark_complete("140", 12);
        store.save(&state).await.unwrap();

        let loaded = store.load(&fingerprint(dir.path())).await;
        assert_eq!(loaded, state);
        assert!(loaded.is_complete("140", 12));
        assert!(!loaded.is_complete("248", 12));
        assert!(!dir.path().join("resume.jsonl.tmp").exists());
    }

    #[tokio::test]
    async fn mismatched_fingerprint_starts_fresh() {
        let dir = TempDir::new().unwrap();
        let store = ResumeStore::new(dir.path());
        let mut state = ResumeState::new(fingerprint(dir.path()));
        state.mark_complete("140", 11);
        store.save(&state).await.unwrap();

        let other = Fingerprint::compute(0, 5, &["140"], dir.path()).unwrap();
        let loaded = store.load(&other).await;
        assert_eq!(loaded.fingerprint, other);
        assert_eq!(loaded.completed("140"), 0);
    }

    #[tokio::test]
    async fn corrupt_state_is_treated_as_absent() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(STATE_FILE_NAME), b"{ not json").unwrap();
        let loaded = ResumeStore::new(dir.path()).load(&fingerprint(dir.path())).await;
        assert!(loaded.streams.is_empty());
    }

    #[tokio::test]
    async fn tracker_persists_every_completion() {
        let dir = TempDir::new().unwrap();
        let store = ResumeStore::new(dir.path());
        let tracker = ResumeTracker::new(store.clone(), ResumeState::new(fingerprint(dir.path())));
        tracker.persist().await.unwrap();
        tracker.mark_complete("248", 3).await.unwrap();
        assert!(tracker.is_complete("248", 3).await);

        let on_disk = store.load(&fingerprint(dir.path())).await;
        assert!(on_disk.is_complete("248", 3));
    }

    #[tokio::test]
    async fn completions_are_appended_one_line_each() {
        let dir = TempDir::new().unwrap();
        let store = ResumeStore::new(dir.path());
        let tracker = ResumeTracker::new(store.clone(), ResumeState::new(fingerprint(dir.path())));
        tracker.persist().await.unwrap();
        let header_len = std::fs::metadata(store.path()).unwrap().len();

        for sequence in 10..20 {
            tracker.mark_complete("140", sequence).await.unwrap();
        }
        tracker.mark_complete("140", 15).await.unwrap();

        let content = std::fs::read_to_string(store.path()).unwrap();
        assert_eq!(content.lines().count(), 1 + 10);
        let entry = r#"{"stream":"140","sequence":10}"#;
        assert_eq!(
            std::fs::metadata(store.path()).unwrap().len(),
            header_len + 10 * (entry.len() as u64 + 1)
        );
        assert_eq!(store.load(&fingerprint(dir.path())).await.completed("140"), 10);
    }

    #[tokio::test]
    async fn torn_last_entry_is_dropped() {
        let dir = TempDir::new().unwrap();
        let store = ResumeStore::new(dir.path());
        let mut state = ResumeState::new(fingerprint(dir.path()));
        state.mark_complete("140", 11);
        store.save(&state).await.unwrap();

        let mut file = OpenOptions::new().append(true).open(store.path()).unwrap();
        file.write_all(br#"{"stream":"140","seq"#).unwrap();
        drop(file);

        let loaded = store.load(&fingerprint(dir.path())).await;
        assert_eq!(loaded, state);

        // Compacting drops the torn line so later appends stay readable.
        let tracker = ResumeTracker::new(store.clone(), loaded);
        tracker.persist().await.unwrap();
        tracker.mark_complete("140", 12).await.unwrap();
        let reloaded = store.load(&fingerprint(dir.path())).await;
        assert!(reloaded.is_complete("140", 11));
        assert!(reloaded.is_complete("140", 12));
    }

    #[test]
    fn second_lock_is_refused_until_released() {
        let dir = TempDir::new().unwrap();
        let lock = RunLock::acquire(dir.path(), false).unwrap();
        assert!(matches!(
            RunLock::acquire(dir.path(), false),
            Err(RewindError::RunLocked { .. })
        ));
        drop(lock);
        let _again = RunLock::acquire(dir.path(), false).unwrap();
    }

    #[test]
    fn force_removes_leftover_lock() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(LOCK_FILE_NAME), b"12345\n").unwrap();
        assert!(RunLock::acquire(dir.path(), false).is_err());
        let _lock = RunLock::acquire(dir.path(), true).unwrap();
    }
}
