use std::{collections::HashMap, pin::Pin, sync::RwLock};

use tunnox_proto::{Command, CommandKind};

pub type PushFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Handler for a server-originated command. Replies, when the kind expects
/// one, go back through the session reusing the received command id.
pub trait PushHandler: Send + Sync {
	fn handle(&self, command: Command) -> PushFuture;
}

impl<F> PushHandler for F
where
	F: Fn(Command) -> PushFuture + Send + Sync,
{
	fn handle(&self, command: Command) -> PushFuture {
		self(command)
	}
}

/// Kind-keyed handler registry. Installing a second handler for a kind
/// replaces the first; the latest owner wins.
#[derive(Default)]
pub struct PushRegistry {
	handlers: RwLock<HashMap<CommandKind, std::sync::Arc<dyn PushHandler>>>,
}

impl PushRegistry {
	pub fn install(&self, kind: CommandKind, handler: std::sync::Arc<dyn PushHandler>) {
		let mut handlers = self.handlers.write().expect("registry poisoned");
		handlers.insert(kind, handler);
	}

	pub fn get(&self, kind: CommandKind) -> Option<std::sync::Arc<dyn PushHandler>> {
		let handlers = self.handlers.read().expect("registry poisoned");
		handlers.get(&kind).cloned()
	}

	/// Break handler reference cycles on stop.
	pub fn clear(&self) {
		let mut handlers = self.handlers.write().expect("registry poisoned");
		handlers.clear();
	}
}
