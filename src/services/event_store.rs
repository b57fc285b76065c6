//! Append-only persistent log of control-plane records.
//!
//! The store owns a small set of named streams, each a line-oriented JSON
//! segment file under the data directory with size-based rotation. Appends
//! are serialized per stream by a single writer; reads walk the rotated
//! segments plus the active one without taking the writer lock.
//!
//! On open, a corrupt trailing record (torn write from a crash) is truncated
//! back to the last valid line and reported so the bus can emit
//! `core.storage.repaired`.

use std::collections::HashMap;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Named persistent streams. Partitioning keeps unrelated readers from
/// scanning each other's records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stream {
    Events,
    TestEvents,
    Traces,
    AgentConfigs,
    PlaybookExec,
    Proposals,
    Plans,
    Rollback,
    TaskQueue,
}

impl Stream {
    pub const ALL: [Stream; 9] = [
        Self::Events,
        Self::TestEvents,
        Self::Traces,
        Self::AgentConfigs,
        Self::PlaybookExec,
        Self::Proposals,
        Self::Plans,
        Self::Rollback,
        Self::TaskQueue,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Events => "events",
            Self::TestEvents => "test_events",
            Self::Traces => "traces",
            Self::AgentConfigs => "agent_configs",
            Self::PlaybookExec => "playbook_exec",
            Self::Proposals => "proposals",
            Self::Plans => "plans",
            Self::Rollback => "rollback",
            Self::TaskQueue => "task_queue",
        }
    }

    /// On-disk path stem relative to the store root.
    fn file_stem(&self) -> &'static str {
        match self {
            Self::Events => "events/events",
            Self::TestEvents => "events/test_events",
            Self::Traces => "traces/agent_traces",
            Self::AgentConfigs => "agent_configs.history",
            Self::PlaybookExec => "playbook_exec",
            Self::Proposals => "proposals",
            Self::Plans => "plans",
            Self::Rollback => "rollback/snapshots",
            Self::TaskQueue => "task_queue",
        }
    }
}

impl std::fmt::Display for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error type for store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The disk is full; the emitter must degrade to in-memory operation.
    #[error("storage exhausted")]
    StorageExhausted,

    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

fn map_io(e: std::io::Error) -> StoreError {
    let disk_full = e.raw_os_error() == Some(28)
        || matches!(
            e.kind(),
            std::io::ErrorKind::StorageFull | std::io::ErrorKind::QuotaExceeded
        );
    if disk_full {
        StoreError::StorageExhausted
    } else {
        StoreError::Io(e)
    }
}

/// Report of a truncated trailing record discovered at startup.
#[derive(Debug, Clone)]
pub struct RepairReport {
    pub stream: Stream,
    pub dropped_bytes: u64,
}

/// A record read back from a stream with the offset it was appended at.
#[derive(Debug, Clone)]
pub struct StoredRecord<T> {
    pub offset: u64,
    pub record: T,
}

/// Store tuning knobs.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub root: PathBuf,
    /// Rotate a stream's active segment when it would exceed this size.
    pub max_segment_bytes: u64,
    /// Rotated segments older than this are deleted by `prune`.
    pub retention: Duration,
}

impl StoreConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            max_segment_bytes: 8 * 1024 * 1024,
            retention: Duration::from_secs(7 * 24 * 3600),
        }
    }
}

struct StreamState {
    file: std::fs::File,
    active_path: PathBuf,
    active_bytes: u64,
    /// Next offset to assign; gap-free and monotonic within the stream.
    next_offset: u64,
    /// Highest rotated-segment suffix present (1 is oldest).
    rotated: u32,
}

/// Append-only persistent log, partitioned by stream.
pub struct EventStore {
    config: StoreConfig,
    streams: HashMap<Stream, Mutex<StreamState>>,
}

impl EventStore {
    /// Open (or create) the store under the configured root. Returns repair
    /// reports for any stream whose trailing record had to be truncated.
    pub fn open(config: StoreConfig) -> Result<(Self, Vec<RepairReport>), StoreError> {
        std::fs::create_dir_all(&config.root).map_err(map_io)?;

        let mut streams = HashMap::new();
        let mut repairs = Vec::new();
        for stream in Stream::ALL {
            if let Some(parent) = Self::active_path(&config.root, stream).parent() {
                std::fs::create_dir_all(parent).map_err(map_io)?;
            }
            let (state, repaired) = Self::open_stream(&config.root, stream)?;
            if repaired > 0 {
                repairs.push(RepairReport {
                    stream,
                    dropped_bytes: repaired,
                });
            }
            streams.insert(stream, Mutex::new(state));
        }

        Ok((Self { config, streams }, repairs))
    }

    fn active_path(root: &Path, stream: Stream) -> PathBuf {
        root.join(format!("{}.jsonl", stream.file_stem()))
    }

    fn rotated_path(root: &Path, stream: Stream, idx: u32) -> PathBuf {
        root.join(format!("{}.{}.jsonl", stream.file_stem(), idx))
    }

    fn base_offset_path(root: &Path, stream: Stream) -> PathBuf {
        root.join(format!("{}.base", stream.file_stem()))
    }

    fn read_base_offset(root: &Path, stream: Stream) -> u64 {
        std::fs::read_to_string(Self::base_offset_path(root, stream))
            .ok()
            .and_then(|s| s.trim().parse().ok())
            .unwrap_or(0)
    }

    fn write_base_offset(root: &Path, stream: Stream, base: u64) -> Result<(), StoreError> {
        std::fs::write(Self::base_offset_path(root, stream), base.to_string()).map_err(map_io)
    }

    fn count_lines(path: &Path) -> Result<u64, StoreError> {
        let file = match std::fs::File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(map_io(e)),
        };
        let mut reader = BufReader::new(file);
        let mut count = 0u64;
        let mut buf = Vec::new();
        loop {
            buf.clear();
            let n = reader.read_until(b'\n', &mut buf).map_err(map_io)?;
            if n == 0 {
                break;
            }
            count += 1;
        }
        Ok(count)
    }

    /// Truncate a torn trailing record. Returns the number of bytes dropped.
    fn repair_tail(path: &Path) -> Result<u64, StoreError> {
        let content = match std::fs::read(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(map_io(e)),
        };
        if content.is_empty() {
            return Ok(0);
        }

        // Find the end of the last intact record: the last newline whose
        // preceding line parses as JSON.
        let mut valid_end = 0usize;
        let mut line_start = 0usize;
        for (i, b) in content.iter().enumerate() {
            if *b == b'\n' {
                let line = &content[line_start..i];
                if serde_json::from_slice::<serde_json::Value>(line).is_ok() {
                    valid_end = i + 1;
                } else {
                    break;
                }
                line_start = i + 1;
            }
        }

        let dropped = (content.len() - valid_end) as u64;
        if dropped > 0 {
            let file = std::fs::OpenOptions::new()
                .write(true)
                .open(path)
                .map_err(map_io)?;
            file.set_len(valid_end as u64).map_err(map_io)?;
            file.sync_data().map_err(map_io)?;
            warn!(path = %path.display(), dropped, "truncated corrupt trailing record");
        }
        Ok(dropped)
    }

    fn open_stream(root: &Path, stream: Stream) -> Result<(StreamState, u64), StoreError> {
        let active_path = Self::active_path(root, stream);
        let dropped = Self::repair_tail(&active_path)?;

        // Count records across rotated segments and the active one to
        // reconstruct the next offset.
        let mut rotated = 0u32;
        let mut lines = Self::read_base_offset(root, stream);
        loop {
            let path = Self::rotated_path(root, stream, rotated + 1);
            if !path.exists() {
                break;
            }
            rotated += 1;
            lines += Self::count_lines(&path)?;
        }
        lines += Self::count_lines(&active_path)?;

        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&active_path)
            .map_err(map_io)?;
        let active_bytes = file.metadata().map_err(map_io)?.len();

        Ok((
            StreamState {
                file,
                active_path,
                active_bytes,
                next_offset: lines,
                rotated,
            },
            dropped,
        ))
    }

    fn state(&self, stream: Stream) -> &Mutex<StreamState> {
        // All streams are created eagerly in `open`.
        &self.streams[&stream]
    }

    /// Append one record. Durable appends are flushed to disk before
    /// returning; best-effort appends rely on the OS page cache.
    pub async fn append<T: Serialize>(
        &self,
        stream: Stream,
        record: &T,
        durable: bool,
    ) -> Result<u64, StoreError> {
        let line = serde_json::to_string(record)?;
        let mut state = self.state(stream).lock().await;

        if state.active_bytes > 0
            && state.active_bytes + line.len() as u64 + 1 > self.config.max_segment_bytes
        {
            self.rotate_locked(stream, &mut state)?;
        }

        state
            .file
            .write_all(line.as_bytes())
            .and_then(|()| state.file.write_all(b"\n"))
            .map_err(map_io)?;
        if durable {
            state.file.sync_data().map_err(map_io)?;
        }

        let offset = state.next_offset;
        state.next_offset += 1;
        state.active_bytes += line.len() as u64 + 1;
        Ok(offset)
    }

    fn rotate_locked(&self, stream: Stream, state: &mut StreamState) -> Result<(), StoreError> {
        state.file.sync_data().map_err(map_io)?;
        let next_idx = state.rotated + 1;
        let rotated_path = Self::rotated_path(&self.config.root, stream, next_idx);
        std::fs::rename(&state.active_path, &rotated_path).map_err(map_io)?;
        state.rotated = next_idx;
        state.file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&state.active_path)
            .map_err(map_io)?;
        state.active_bytes = 0;
        debug!(%stream, segment = next_idx, "rotated stream segment");
        Ok(())
    }

    /// Force a rotation of the active segment (size policy is applied
    /// automatically on append).
    pub async fn rotate(&self, stream: Stream) -> Result<(), StoreError> {
        let mut state = self.state(stream).lock().await;
        if state.active_bytes > 0 {
            self.rotate_locked(stream, &mut state)?;
        }
        Ok(())
    }

    /// Read records appended at or after `since_offset`, in append order,
    /// across rotated segments and the active one. Restartable: pass the
    /// last seen offset + 1 to continue.
    pub fn read<T: DeserializeOwned>(
        &self,
        stream: Stream,
        since_offset: u64,
    ) -> Result<Vec<StoredRecord<T>>, StoreError> {
        let root = &self.config.root;
        let base = Self::read_base_offset(root, stream);

        let mut paths = Vec::new();
        let mut idx = 1u32;
        loop {
            let p = Self::rotated_path(root, stream, idx);
            if !p.exists() {
                break;
            }
            paths.push(p);
            idx += 1;
        }
        paths.push(Self::active_path(root, stream));

        let mut out = Vec::new();
        let mut offset = base;
        for path in paths {
            let file = match std::fs::File::open(&path) {
                Ok(f) => f,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(map_io(e)),
            };
            let reader = BufReader::new(file);
            for line in reader.lines() {
                let line = line.map_err(map_io)?;
                let current = offset;
                offset += 1;
                if current < since_offset || line.is_empty() {
                    continue;
                }
                match serde_json::from_str::<T>(&line) {
                    Ok(record) => out.push(StoredRecord {
                        offset: current,
                        record,
                    }),
                    Err(e) => {
                        // Torn or foreign line; restart repair will handle the
                        // tail, mid-stream damage is skipped.
                        warn!(%stream, offset = current, error = %e, "skipping unreadable record");
                    }
                }
            }
        }
        Ok(out)
    }

    /// Read with a caller-supplied filter.
    pub fn read_filtered<T, F>(
        &self,
        stream: Stream,
        since_offset: u64,
        mut filter: F,
    ) -> Result<Vec<StoredRecord<T>>, StoreError>
    where
        T: DeserializeOwned,
        F: FnMut(&T) -> bool,
    {
        let mut records = self.read::<T>(stream, since_offset)?;
        records.retain(|r| filter(&r.record));
        Ok(records)
    }

    /// Next offset that would be assigned on append.
    pub async fn next_offset(&self, stream: Stream) -> u64 {
        self.state(stream).lock().await.next_offset
    }

    /// Delete rotated segments older than the retention horizon. The active
    /// segment is never pruned. Returns the number of segments removed.
    pub async fn prune(&self, stream: Stream, now: SystemTime) -> Result<u64, StoreError> {
        let horizon = now
            .checked_sub(self.config.retention)
            .unwrap_or(SystemTime::UNIX_EPOCH);
        let root = self.config.root.clone();

        let mut state = self.state(stream).lock().await;
        let mut removed = 0u64;
        let mut pruned_lines = 0u64;
        let mut survivors: Vec<(u32, PathBuf)> = Vec::new();

        for idx in 1..=state.rotated {
            let path = Self::rotated_path(&root, stream, idx);
            let Ok(meta) = std::fs::metadata(&path) else {
                continue;
            };
            let expired = meta.modified().map(|m| m < horizon).unwrap_or(false);
            if expired {
                pruned_lines += Self::count_lines(&path)?;
                std::fs::remove_file(&path).map_err(map_io)?;
                removed += 1;
            } else {
                survivors.push((idx, path));
            }
        }

        if removed > 0 {
            // Re-number the surviving segments so rotation indexes stay dense,
            // and advance the base offset past the pruned records.
            for (new_idx, (_, path)) in survivors.iter().enumerate() {
                let target = Self::rotated_path(&root, stream, new_idx as u32 + 1);
                if *path != target {
                    std::fs::rename(path, &target).map_err(map_io)?;
                }
            }
            state.rotated = survivors.len() as u32;
            let base = Self::read_base_offset(&root, stream) + pruned_lines;
            Self::write_base_offset(&root, stream, base)?;
        }
        Ok(removed)
    }

    /// Write a snapshot-replaceable JSON document (not a stream) atomically.
    pub fn write_snapshot<T: Serialize>(&self, name: &str, value: &T) -> Result<(), StoreError> {
        let path = self.config.root.join(format!("{name}.json"));
        let tmp = self.config.root.join(format!("{name}.json.tmp"));
        let body = serde_json::to_vec_pretty(value)?;
        std::fs::write(&tmp, body).map_err(map_io)?;
        std::fs::rename(&tmp, &path).map_err(map_io)?;
        Ok(())
    }

    /// Read back a snapshot document, if present.
    pub fn read_snapshot<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>, StoreError> {
        let path = self.config.root.join(format!("{name}.json"));
        match std::fs::read(&path) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(map_io(e)),
        }
    }

    /// Total bytes used by store files on disk.
    pub fn disk_usage(&self) -> u64 {
        fn dir_size(path: &Path) -> u64 {
            let Ok(entries) = std::fs::read_dir(path) else {
                return 0;
            };
            entries
                .flatten()
                .map(|entry| match entry.metadata() {
                    Ok(meta) if meta.is_file() => meta.len(),
                    Ok(meta) if meta.is_dir() => dir_size(&entry.path()),
                    _ => 0,
                })
                .sum()
        }
        dir_size(&self.config.root)
    }

    /// Check that the store can currently accept writes. Used to clear
    /// degraded mode after a disk-full episode.
    pub fn probe(&self) -> Result<(), StoreError> {
        let path = self.config.root.join(".probe");
        std::fs::write(&path, b"ok").map_err(map_io)?;
        let _ = std::fs::remove_file(&path);
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.config.root
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Rec {
        n: u64,
        body: String,
    }

    fn rec(n: u64) -> Rec {
        Rec {
            n,
            body: format!("record-{n}"),
        }
    }

    fn open_tmp() -> (EventStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let (store, repairs) = EventStore::open(StoreConfig::new(dir.path())).unwrap();
        assert!(repairs.is_empty());
        (store, dir)
    }

    #[tokio::test]
    async fn test_append_then_read_round_trip() {
        let (store, _dir) = open_tmp();

        let o0 = store.append(Stream::Traces, &rec(0), true).await.unwrap();
        let o1 = store.append(Stream::Traces, &rec(1), false).await.unwrap();
        assert_eq!((o0, o1), (0, 1));

        let records = store.read::<Rec>(Stream::Traces, 0).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].record, rec(0));
        assert_eq!(records[1].offset, 1);

        // Restartable from a returned offset
        let tail = store.read::<Rec>(Stream::Traces, 1).unwrap();
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].record, rec(1));
    }

    #[tokio::test]
    async fn test_offsets_are_per_stream_and_gap_free() {
        let (store, _dir) = open_tmp();

        for i in 0..5 {
            let off = store.append(Stream::Events, &rec(i), false).await.unwrap();
            assert_eq!(off, i);
        }
        let off = store.append(Stream::Proposals, &rec(0), false).await.unwrap();
        assert_eq!(off, 0);
    }

    #[tokio::test]
    async fn test_offsets_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let (store, _) = EventStore::open(StoreConfig::new(dir.path())).unwrap();
            store.append(Stream::Events, &rec(0), true).await.unwrap();
            store.append(Stream::Events, &rec(1), true).await.unwrap();
        }
        let (store, repairs) = EventStore::open(StoreConfig::new(dir.path())).unwrap();
        assert!(repairs.is_empty());
        assert_eq!(store.next_offset(Stream::Events).await, 2);
        let off = store.append(Stream::Events, &rec(2), true).await.unwrap();
        assert_eq!(off, 2);
    }

    #[tokio::test]
    async fn test_corrupt_tail_is_repaired() {
        let dir = tempfile::tempdir().unwrap();
        {
            let (store, _) = EventStore::open(StoreConfig::new(dir.path())).unwrap();
            store.append(Stream::Events, &rec(0), true).await.unwrap();
        }
        // Simulate a torn write
        let path = dir.path().join("events/events.jsonl");
        let mut content = std::fs::read(&path).unwrap();
        content.extend_from_slice(b"{\"n\":1,\"body\":\"tru");
        std::fs::write(&path, content).unwrap();

        let (store, repairs) = EventStore::open(StoreConfig::new(dir.path())).unwrap();
        assert_eq!(repairs.len(), 1);
        assert!(repairs[0].dropped_bytes > 0);

        let records = store.read::<Rec>(Stream::Events, 0).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(store.next_offset(Stream::Events).await, 1);
    }

    #[tokio::test]
    async fn test_rotation_preserves_read_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = StoreConfig::new(dir.path());
        config.max_segment_bytes = 64; // force frequent rotation
        let (store, _) = EventStore::open(config).unwrap();

        for i in 0..10 {
            store.append(Stream::Traces, &rec(i), false).await.unwrap();
        }
        let records = store.read::<Rec>(Stream::Traces, 0).unwrap();
        assert_eq!(records.len(), 10);
        for (i, r) in records.iter().enumerate() {
            assert_eq!(r.offset, i as u64);
            assert_eq!(r.record.n, i as u64);
        }
        assert!(dir.path().join("traces/agent_traces.1.jsonl").exists());
    }

    #[tokio::test]
    async fn test_snapshot_write_read() {
        let (store, _dir) = open_tmp();
        store.write_snapshot("agent_configs", &vec![rec(1), rec(2)]).unwrap();
        let back: Option<Vec<Rec>> = store.read_snapshot("agent_configs").unwrap();
        assert_eq!(back.unwrap().len(), 2);

        let missing: Option<Vec<Rec>> = store.read_snapshot("nope").unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn test_filtered_read() {
        let (store, _dir) = open_tmp();
        for i in 0..6 {
            store.append(Stream::Traces, &rec(i), false).await.unwrap();
        }
        let odd = store
            .read_filtered::<Rec, _>(Stream::Traces, 0, |r| r.n % 2 == 1)
            .unwrap();
        assert_eq!(odd.len(), 3);
    }

    #[tokio::test]
    async fn test_probe_and_disk_usage() {
        let (store, _dir) = open_tmp();
        store.probe().unwrap();
        store.append(Stream::Events, &rec(0), true).await.unwrap();
        assert!(store.disk_usage() > 0);
    }
}
