use std::{collections::HashMap, sync::Mutex};

use tokio::sync::oneshot;

use crate::{ClientError, Result};

struct Waiter {
	generation: u64,
	tx:         oneshot::Sender<Result<String>>,
}

/// Correlation table: command-id → waiter. Reconnect, stop, and kick each
/// drain it so no caller is ever left hanging.
#[derive(Default)]
pub struct InflightTable {
	waiters: Mutex<HashMap<String, Waiter>>,
}

impl InflightTable {
	pub fn register(&self, command_id: &str, generation: u64) -> oneshot::Receiver<Result<String>> {
		let (tx, rx) = oneshot::channel();
		let mut waiters = self.waiters.lock().expect("inflight poisoned");
		waiters.insert(command_id.to_string(), Waiter { generation, tx });
		rx
	}

	/// Deliver a response body (or carried error) to the matching waiter.
	/// Returns false when nothing was waiting, which makes the frame a push.
	pub fn complete(&self, command_id: &str, result: Result<String>) -> bool {
		let waiter = {
			let mut waiters = self.waiters.lock().expect("inflight poisoned");
			waiters.remove(command_id)
		};
		match waiter {
			Some(w) => {
				let _ = w.tx.send(result);
				true
			}
			None => false,
		}
	}

	/// Drop a waiter that timed out locally.
	pub fn forget(&self, command_id: &str) {
		let mut waiters = self.waiters.lock().expect("inflight poisoned");
		waiters.remove(command_id);
	}

	/// Fail every waiter registered at or before `generation`; a reconnect
	/// at gen N+1 must not kill requests already issued on the new link.
	pub fn fail_generation(&self, generation: u64, err: impl Fn() -> ClientError) {
		let stale: Vec<Waiter> = {
			let mut waiters = self.waiters.lock().expect("inflight poisoned");
			let ids: Vec<String> = waiters
				.iter()
				.filter(|(_, w)| w.generation <= generation)
				.map(|(id, _)| id.clone())
				.collect();
			ids.into_iter().filter_map(|id| waiters.remove(&id)).collect()
		};
		for w in stale {
			let _ = w.tx.send(Err(err()));
		}
	}

	pub fn fail_all(&self, err: impl Fn() -> ClientError) {
		let drained: Vec<Waiter> = {
			let mut waiters = self.waiters.lock().expect("inflight poisoned");
			waiters.drain().map(|(_, w)| w).collect()
		};
		for w in drained {
			let _ = w.tx.send(Err(err()));
		}
	}

	pub fn len(&self) -> usize {
		self.waiters.lock().expect("inflight poisoned").len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[tokio::test]
	async fn test_complete_delivers() {
		let table = InflightTable::default();
		let rx = table.register("c1", 1);
		assert!(table.complete("c1", Ok("body".into())));
		assert_eq!(rx.await.unwrap().unwrap(), "body");
		assert!(table.is_empty());
	}

	#[tokio::test]
	async fn test_unknown_id_is_push() {
		let table = InflightTable::default();
		assert!(!table.complete("nobody", Ok(String::new())));
	}

	#[tokio::test]
	async fn test_fail_generation_spares_newer() {
		let table = InflightTable::default();
		let old = table.register("old", 1);
		let new = table.register("new", 2);
		table.fail_generation(1, || ClientError::Reconnected);
		assert!(matches!(old.await.unwrap().unwrap_err(), ClientError::Reconnected));
		assert_eq!(table.len(), 1);
		assert!(table.complete("new", Ok(String::new())));
		assert!(new.await.unwrap().is_ok());
	}
}
