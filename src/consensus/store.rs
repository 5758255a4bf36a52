//! Durable log + snapshot storage backing the consensus node (§4.8/§4.9).
//!
//! `sled` is the embedded store. Snapshots are gzip-compressed via
//! `flate2`, since §4.9 requires compaction but is silent on on-disk
//! format.

use crate::error::{AppError, AppResult};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use super::fsm::Command;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
	pub index: u64,
	pub term: u64,
	pub command: Command,
}

/// Persisted term/vote state, the minimum needed to survive a restart
/// without violating the "never vote twice in a term" invariant.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct HardState {
	pub current_term: u64,
	pub voted_for: Option<u64>,
}

pub struct LogStore {
	db: sled::Db,
	log: sled::Tree,
	meta: sled::Tree,
	snapshot_dir: PathBuf,
}

const HARD_STATE_KEY: &[u8] = b"hard_state";

/// Minimum number of snapshot files kept on disk (§6: "snapshot directory
/// (retention >= 2 snapshots)"). One extra generation survives a crash
/// mid-write of the newest snapshot.
const SNAPSHOT_RETENTION: usize = 2;

impl LogStore {
	pub fn open(data_dir: &Path) -> AppResult<Self> {
		std::fs::create_dir_all(data_dir)
			.map_err(|e| AppError::Other(anyhow::anyhow!("creating data dir: {e}")))?;
		let db = sled::open(data_dir.join("raft.sled"))
			.map_err(|e| AppError::Other(anyhow::anyhow!("opening sled store: {e}")))?;
		let log = db
			.open_tree("log")
			.map_err(|e| AppError::Other(anyhow::anyhow!("opening log tree: {e}")))?;
		let meta = db
			.open_tree("meta")
			.map_err(|e| AppError::Other(anyhow::anyhow!("opening meta tree: {e}")))?;

		let snapshot_dir = data_dir.join("snapshots");
		std::fs::create_dir_all(&snapshot_dir)
			.map_err(|e| AppError::Other(anyhow::anyhow!("creating snapshot dir: {e}")))?;

		Ok(Self {
			db,
			log,
			meta,
			snapshot_dir,
		})
	}

	pub fn append(&self, entry: &LogEntry) -> AppResult<()> {
		let bytes = serde_json::to_vec(entry)
			.map_err(|e| AppError::Serialization(format!("encoding log entry: {e}")))?;
		self.log
			.insert(entry.index.to_be_bytes(), bytes)
			.map_err(|e| AppError::Other(anyhow::anyhow!("appending log entry: {e}")))?;
		Ok(())
	}

	pub fn get(&self, index: u64) -> AppResult<Option<LogEntry>> {
		match self
			.log
			.get(index.to_be_bytes())
			.map_err(|e| AppError::Other(anyhow::anyhow!("reading log entry: {e}")))?
		{
			Some(bytes) => {
				let entry = serde_json::from_slice(&bytes)
					.map_err(|e| AppError::Serialization(format!("decoding log entry: {e}")))?;
				Ok(Some(entry))
			}
			None => Ok(None),
		}
	}

	pub fn last_index(&self) -> u64 {
		self.log
			.last()
			.ok()
			.flatten()
			.map(|(k, _)| u64::from_be_bytes(k.as_ref().try_into().unwrap_or([0; 8])))
			.unwrap_or(0)
	}

	pub fn last_term(&self) -> u64 {
		self.log
			.last()
			.ok()
			.flatten()
			.and_then(|(_, v)| serde_json::from_slice::<LogEntry>(&v).ok())
			.map(|e| e.term)
			.unwrap_or(0)
	}

	/// Remove log entries with index `<= up_to` after a successful snapshot.
	pub fn truncate_prefix(&self, up_to: u64) -> AppResult<()> {
		let keys: Vec<_> = self
			.log
			.range(..=up_to.to_be_bytes())
			.keys()
			.filter_map(|k| k.ok())
			.collect();
		for k in keys {
			self.log
				.remove(k)
				.map_err(|e| AppError::Other(anyhow::anyhow!("truncating log: {e}")))?;
		}
		Ok(())
	}

	pub fn load_hard_state(&self) -> AppResult<HardState> {
		match self
			.meta
			.get(HARD_STATE_KEY)
			.map_err(|e| AppError::Other(anyhow::anyhow!("reading hard state: {e}")))?
		{
			Some(bytes) => serde_json::from_slice(&bytes)
				.map_err(|e| AppError::Serialization(format!("decoding hard state: {e}"))),
			None => Ok(HardState::default()),
		}
	}

	pub fn save_hard_state(&self, state: &HardState) -> AppResult<()> {
		let bytes = serde_json::to_vec(state)
			.map_err(|e| AppError::Serialization(format!("encoding hard state: {e}")))?;
		self.meta
			.insert(HARD_STATE_KEY, bytes)
			.map_err(|e| AppError::Other(anyhow::anyhow!("saving hard state: {e}")))?;
		Ok(())
	}

	fn snapshot_file(&self, last_included_index: u64) -> PathBuf {
		self.snapshot_dir.join(format!("snapshot-{last_included_index:020}.gz"))
	}

	/// List snapshot files in the directory, oldest first, by the index
	/// encoded in their filename (not filesystem mtime, which `tar`/backup
	/// tooling can reorder).
	fn list_snapshots(&self) -> AppResult<Vec<(u64, PathBuf)>> {
		let mut found = Vec::new();
		let entries = std::fs::read_dir(&self.snapshot_dir)
			.map_err(|e| AppError::Other(anyhow::anyhow!("listing snapshot dir: {e}")))?;
		for entry in entries {
			let entry = entry.map_err(|e| AppError::Other(anyhow::anyhow!("reading snapshot dir entry: {e}")))?;
			let path = entry.path();
			let Some(index) = path
				.file_stem()
				.and_then(|s| s.to_str())
				.and_then(|s| s.strip_prefix("snapshot-"))
				.and_then(|s| s.parse::<u64>().ok())
			else {
				continue;
			};
			found.push((index, path));
		}
		found.sort_by_key(|(index, _)| *index);
		Ok(found)
	}

	/// Write a gzip-compressed snapshot of the FSM's key/value map as a new
	/// file in the snapshot directory, then prune down to the retention
	/// floor. The previous newest snapshot is left on disk until the new one
	/// has been fully written, so a crash mid-write never leaves the node
	/// without a loadable snapshot.
	pub fn write_snapshot(&self, map: &BTreeMap<Vec<u8>, Vec<u8>>, last_included_index: u64) -> AppResult<()> {
		let payload = SnapshotPayload {
			last_included_index,
			entries: map.clone(),
		};
		let json = serde_json::to_vec(&payload)
			.map_err(|e| AppError::Serialization(format!("encoding snapshot: {e}")))?;

		let path = self.snapshot_file(last_included_index);
		let file = std::fs::File::create(&path)
			.map_err(|e| AppError::Other(anyhow::anyhow!("creating snapshot file: {e}")))?;
		let mut encoder = GzEncoder::new(file, Compression::default());
		encoder
			.write_all(&json)
			.map_err(|e| AppError::Other(anyhow::anyhow!("writing snapshot: {e}")))?;
		encoder
			.finish()
			.map_err(|e| AppError::Other(anyhow::anyhow!("finishing snapshot gzip stream: {e}")))?;

		self.prune_snapshots()?;
		self.truncate_prefix(last_included_index)
	}

	/// Delete snapshot files beyond `SNAPSHOT_RETENTION`, oldest first.
	fn prune_snapshots(&self) -> AppResult<()> {
		let snapshots = self.list_snapshots()?;
		if snapshots.len() <= SNAPSHOT_RETENTION {
			return Ok(());
		}
		for (_, path) in &snapshots[..snapshots.len() - SNAPSHOT_RETENTION] {
			let _ = std::fs::remove_file(path);
		}
		Ok(())
	}

	/// Load the newest snapshot in the directory, if any.
	pub fn read_snapshot(&self) -> AppResult<Option<(u64, BTreeMap<Vec<u8>, Vec<u8>>)>> {
		let snapshots = self.list_snapshots()?;
		let Some((_, path)) = snapshots.last() else {
			return Ok(None);
		};
		let file = std::fs::File::open(path)
			.map_err(|e| AppError::Other(anyhow::anyhow!("opening snapshot file: {e}")))?;
		let mut decoder = GzDecoder::new(file);
		let mut json = Vec::new();
		decoder
			.read_to_end(&mut json)
			.map_err(|e| AppError::Other(anyhow::anyhow!("reading snapshot gzip stream: {e}")))?;
		let payload: SnapshotPayload = serde_json::from_slice(&json)
			.map_err(|e| AppError::Serialization(format!("decoding snapshot: {e}")))?;
		Ok(Some((payload.last_included_index, payload.entries)))
	}

	pub fn flush(&self) -> AppResult<()> {
		self.db
			.flush()
			.map_err(|e| AppError::Other(anyhow::anyhow!("flushing sled store: {e}")))?;
		Ok(())
	}
}

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotPayload {
	last_included_index: u64,
	entries: BTreeMap<Vec<u8>, Vec<u8>>,
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn append_and_get_roundtrips() {
		let dir = tempfile::tempdir().unwrap();
		let store = LogStore::open(dir.path()).unwrap();
		let entry = LogEntry {
			index: 1,
			term: 1,
			command: Command::Set {
				key: b"k".to_vec(),
				value: b"v".to_vec(),
			},
		};
		store.append(&entry).unwrap();
		let loaded = store.get(1).unwrap().unwrap();
		assert_eq!(loaded.index, 1);
		assert_eq!(loaded.term, 1);
	}

	#[test]
	fn last_index_tracks_highest_appended_entry() {
		let dir = tempfile::tempdir().unwrap();
		let store = LogStore::open(dir.path()).unwrap();
		assert_eq!(store.last_index(), 0);
		for i in 1..=5u64 {
			store
				.append(&LogEntry {
					index: i,
					term: 1,
					command: Command::Delete { key: b"k".to_vec() },
				})
				.unwrap();
		}
		assert_eq!(store.last_index(), 5);
	}

	#[test]
	fn hard_state_persists_across_reopen() {
		let dir = tempfile::tempdir().unwrap();
		{
			let store = LogStore::open(dir.path()).unwrap();
			store
				.save_hard_state(&HardState {
					current_term: 3,
					voted_for: Some(2),
				})
				.unwrap();
			store.flush().unwrap();
		}
		let store = LogStore::open(dir.path()).unwrap();
		let hs = store.load_hard_state().unwrap();
		assert_eq!(hs.current_term, 3);
		assert_eq!(hs.voted_for, Some(2));
	}

	#[test]
	fn snapshot_roundtrips_and_truncates_log() {
		let dir = tempfile::tempdir().unwrap();
		let store = LogStore::open(dir.path()).unwrap();
		for i in 1..=3u64 {
			store
				.append(&LogEntry {
					index: i,
					term: 1,
					command: Command::Set {
						key: format!("k{i}").into_bytes(),
						value: b"v".to_vec(),
					},
				})
				.unwrap();
		}
		let mut map = BTreeMap::new();
		map.insert(b"k1".to_vec(), b"v1".to_vec());
		store.write_snapshot(&map, 3).unwrap();

		assert_eq!(store.last_index(), 0); // truncated below/at 3
		let (idx, restored) = store.read_snapshot().unwrap().unwrap();
		assert_eq!(idx, 3);
		assert_eq!(restored.get(&b"k1".to_vec()), Some(&b"v1".to_vec()));
	}

	#[test]
	fn old_snapshots_are_retained_up_to_the_floor() {
		let dir = tempfile::tempdir().unwrap();
		let store = LogStore::open(dir.path()).unwrap();
		let map = BTreeMap::new();

		for index in [1u64, 2, 3, 4] {
			store.write_snapshot(&map, index).unwrap();
		}

		let remaining = store.list_snapshots().unwrap();
		assert_eq!(remaining.len(), SNAPSHOT_RETENTION);
		assert_eq!(remaining.iter().map(|(i, _)| *i).collect::<Vec<_>>(), vec![3, 4]);

		let (idx, _) = store.read_snapshot().unwrap().unwrap();
		assert_eq!(idx, 4);
	}
}
