//! Replicated FSM (C9): key/value store with prefix iteration and watchers.
//!
//! Grounded on `sync::merge`'s explicit state/command enum style; the
//! watcher fan-out uses bounded channels with non-blocking `try_send` per
//! §4.9's "watchers must be non-blocking" requirement.

use crate::error::{AppError, AppResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::RwLock;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Command {
	Set { key: Vec<u8>, value: Vec<u8> },
	Delete { key: Vec<u8> },
}

#[derive(Debug, Clone)]
pub struct WatchEvent {
	pub key: Vec<u8>,
	pub value: Option<Vec<u8>>,
	pub is_delete: bool,
}

const WATCH_CHANNEL_CAPACITY: usize = 256;

struct Watcher {
	prefix: Vec<u8>,
	sender: mpsc::Sender<WatchEvent>,
}

/// Opaque `bytes -> bytes` map. All mutation goes through `apply`, which the
/// consensus node only calls after local commit on the leader.
pub struct ReplicatedFsm {
	map: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
	watchers: RwLock<Vec<Watcher>>,
}

impl ReplicatedFsm {
	pub fn new() -> Self {
		Self {
			map: RwLock::new(BTreeMap::new()),
			watchers: RwLock::new(Vec::new()),
		}
	}

	pub fn apply(&self, command: &Command) -> AppResult<()> {
		match command {
			Command::Set { key, value } => {
				self.map
					.write()
					.unwrap()
					.insert(key.clone(), value.clone());
				self.notify(key, Some(value.clone()), false);
				Ok(())
			}
			Command::Delete { key } => {
				self.map.write().unwrap().remove(key);
				self.notify(key, None, true);
				Ok(())
			}
		}
	}

	pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
		self.map.read().unwrap().get(key).cloned()
	}

	pub fn list(&self, prefix: &[u8]) -> Vec<(Vec<u8>, Vec<u8>)> {
		self.map
			.read()
			.unwrap()
			.range(prefix.to_vec()..)
			.take_while(|(k, _)| k.starts_with(prefix))
			.map(|(k, v)| (k.clone(), v.clone()))
			.collect()
	}

	pub fn snapshot(&self) -> BTreeMap<Vec<u8>, Vec<u8>> {
		self.map.read().unwrap().clone()
	}

	pub fn restore(&self, map: BTreeMap<Vec<u8>, Vec<u8>>) {
		*self.map.write().unwrap() = map;
	}

	/// Register a watcher for keys under `prefix`. Returns the receiving
	/// end of a bounded channel; a slow consumer drops events rather than
	/// blocking `apply`.
	pub fn watch(&self, prefix: Vec<u8>) -> mpsc::Receiver<WatchEvent> {
		let (tx, rx) = mpsc::channel(WATCH_CHANNEL_CAPACITY);
		self.watchers
			.write()
			.unwrap()
			.push(Watcher { prefix, sender: tx });
		rx
	}

	fn notify(&self, key: &[u8], value: Option<Vec<u8>>, is_delete: bool) {
		let watchers = self.watchers.read().unwrap();
		for w in watchers.iter() {
			if key.starts_with(&w.prefix) {
				let _ = w.sender.try_send(WatchEvent {
					key: key.to_vec(),
					value: value.clone(),
					is_delete,
				});
			}
		}
	}
}

impl Default for ReplicatedFsm {
	fn default() -> Self {
		Self::new()
	}
}

/// Unknown command kinds are a deserialization-time error rather than a
/// runtime one since `Command` is a closed enum; kept for parity with
/// §4.9's "unknown command kinds return an error" contract when the FSM is
/// driven through a generic apply surface.
pub fn decode_command(bytes: &[u8]) -> AppResult<Command> {
	serde_json::from_slice(bytes)
		.map_err(|e| AppError::Serialization(format!("unknown or malformed command: {e}")))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn set_then_get_roundtrips() {
		let fsm = ReplicatedFsm::new();
		fsm.apply(&Command::Set {
			key: b"a".to_vec(),
			value: b"1".to_vec(),
		})
		.unwrap();
		assert_eq!(fsm.get(b"a"), Some(b"1".to_vec()));
	}

	#[test]
	fn delete_removes_key() {
		let fsm = ReplicatedFsm::new();
		fsm.apply(&Command::Set {
			key: b"a".to_vec(),
			value: b"1".to_vec(),
		})
		.unwrap();
		fsm.apply(&Command::Delete { key: b"a".to_vec() }).unwrap();
		assert_eq!(fsm.get(b"a"), None);
	}

	#[test]
	fn list_returns_only_matching_prefix() {
		let fsm = ReplicatedFsm::new();
		fsm.apply(&Command::Set {
			key: b"svc/a".to_vec(),
			value: b"1".to_vec(),
		})
		.unwrap();
		fsm.apply(&Command::Set {
			key: b"svc/b".to_vec(),
			value: b"2".to_vec(),
		})
		.unwrap();
		fsm.apply(&Command::Set {
			key: b"other".to_vec(),
			value: b"3".to_vec(),
		})
		.unwrap();
		let entries = fsm.list(b"svc/");
		assert_eq!(entries.len(), 2);
	}

	#[tokio::test]
	async fn watcher_receives_non_blocking_events_for_matching_prefix() {
		let fsm = ReplicatedFsm::new();
		let mut rx = fsm.watch(b"svc/".to_vec());
		fsm.apply(&Command::Set {
			key: b"svc/a".to_vec(),
			value: b"1".to_vec(),
		})
		.unwrap();
		fsm.apply(&Command::Set {
			key: b"other".to_vec(),
			value: b"2".to_vec(),
		})
		.unwrap();

		let event = rx.try_recv().unwrap();
		assert_eq!(event.key, b"svc/a");
		assert!(rx.try_recv().is_err());
	}

	#[test]
	fn snapshot_and_restore_roundtrip() {
		let fsm = ReplicatedFsm::new();
		fsm.apply(&Command::Set {
			key: b"a".to_vec(),
			value: b"1".to_vec(),
		})
		.unwrap();
		let snap = fsm.snapshot();

		let fsm2 = ReplicatedFsm::new();
		fsm2.restore(snap);
		assert_eq!(fsm2.get(b"a"), Some(b"1".to_vec()));
	}
}
