//! Public watcher facade.
//!
//! Every watcher created on a thread shares that thread's engine; the first
//! one spawns it. A facade is bound to its construction thread for life:
//! using it from another thread detaches it with a diagnostic rather than
//! corrupting engine state it no longer shares a scheduler with.

use std::cell::{Cell, RefCell};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, ThreadId};
use std::time::SystemTime;

use tokio::sync::{mpsc, oneshot};
use tracing::error;

use crate::config::{Method, WatcherConfig};
use crate::engine::{Engine, EngineCommand};
use crate::entry::ClientId;
use crate::event::{WatchEvent, WatchModes};

static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
	static ENGINE: RefCell<Option<mpsc::UnboundedSender<EngineCommand>>> =
		const { RefCell::new(None) };
}

/// A handle registering interest in paths and receiving change events.
///
/// Must be created inside a Tokio runtime; the engine and its backends run as
/// tasks on it. Multiple watchers on one thread share a single engine, so
/// watching the same path twice costs one kernel watch.
#[derive(Debug)]
pub struct DirWatcher {
	id: ClientId,
	engine: mpsc::UnboundedSender<EngineCommand>,
	events: mpsc::UnboundedReceiver<WatchEvent>,
	origin: ThreadId,
	detached: Cell<bool>,
	stopped: Cell<bool>,
}

impl DirWatcher {
	/// Creates a watcher bound to this thread's engine, reading the engine
	/// configuration from the environment if the engine does not exist yet.
	pub fn new() -> Self {
		Self::with_config(WatcherConfig::from_env())
	}

	/// Like [`DirWatcher::new`] with an explicit configuration. The
	/// configuration only takes effect for the watcher that actually creates
	/// the engine; later watchers on the same thread share it as-is.
	pub fn with_config(config: WatcherConfig) -> Self {
		let engine = ENGINE.with(|slot| {
			let mut slot = slot.borrow_mut();
			match slot.as_ref() {
				Some(tx) if !tx.is_closed() => tx.clone(),
				_ => {
					let tx = Engine::spawn(config);
					*slot = Some(tx.clone());
					tx
				}
			}
		});
		let id = NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed);
		let (events_tx, events_rx) = mpsc::unbounded_channel();
		let _ = engine.send(EngineCommand::Register {
			id,
			events: events_tx,
		});
		Self {
			id,
			engine,
			events: events_rx,
			origin: thread::current().id(),
			detached: Cell::new(false),
			stopped: Cell::new(false),
		}
	}

	/// Thread-affinity check run before every operation. A facade observed on
	/// a foreign thread is detached permanently: it deregisters from its
	/// engine and all further calls become no-ops.
	fn attached(&self) -> bool {
		if self.detached.get() {
			return false;
		}
		if thread::current().id() != self.origin {
			error!(
				"watcher-{} was moved to another thread; this is not supported, \
				 the watcher is detached and will not observe anything anymore",
				self.id
			);
			self.detached.set(true);
			let _ = self.engine.send(EngineCommand::Deregister { id: self.id });
			return false;
		}
		true
	}

	/// Watches a directory. `modes` selects whether events for child files
	/// and subdirectories are wanted as well; repeated registrations of the
	/// same path are counted, not duplicated.
	pub fn add_dir(&self, path: impl AsRef<Path>, modes: WatchModes) {
		if self.attached() {
			let _ = self.engine.send(EngineCommand::AddEntry {
				id: self.id,
				path: path.as_ref().to_path_buf(),
				is_dir: true,
				modes,
			});
		}
	}

	/// Watches a single file, which does not have to exist yet.
	pub fn add_file(&self, path: impl AsRef<Path>) {
		if self.attached() {
			let _ = self.engine.send(EngineCommand::AddEntry {
				id: self.id,
				path: path.as_ref().to_path_buf(),
				is_dir: false,
				modes: WatchModes::empty(),
			});
		}
	}

	/// Balances one `add_dir`; a no-op for paths this watcher never added.
	pub fn remove_dir(&self, path: impl AsRef<Path>) {
		self.remove(path.as_ref());
	}

	/// Balances one `add_file`; a no-op for paths this watcher never added.
	pub fn remove_file(&self, path: impl AsRef<Path>) {
		self.remove(path.as_ref());
	}

	fn remove(&self, path: &Path) {
		if self.attached() {
			let _ = self.engine.send(EngineCommand::RemoveEntry {
				id: self.id,
				path: path.to_path_buf(),
			});
		}
	}

	/// Suspends delivery for this watcher on one directory. Events occurring
	/// while stopped are dropped, not queued.
	pub async fn stop_dir_scan(&self, path: impl AsRef<Path>) -> bool {
		if !self.attached() {
			return false;
		}
		let (reply, response) = oneshot::channel();
		let _ = self.engine.send(EngineCommand::StopDirScan {
			id: self.id,
			path: path.as_ref().to_path_buf(),
			reply,
		});
		response.await.unwrap_or(false)
	}

	/// Resumes delivery on one directory. The watcher adopts the directory's
	/// current state; nothing missed while stopped is delivered.
	pub async fn restart_dir_scan(&self, path: impl AsRef<Path>) -> bool {
		if !self.attached() {
			return false;
		}
		let (reply, response) = oneshot::channel();
		let _ = self.engine.send(EngineCommand::RestartDirScan {
			id: self.id,
			path: path.as_ref().to_path_buf(),
			reply,
		});
		response.await.unwrap_or(false)
	}

	/// Suspends delivery on every path this watcher registered.
	pub fn stop_scan(&self) {
		if self.attached() {
			self.stopped.set(true);
			let _ = self.engine.send(EngineCommand::StopScan { id: self.id });
		}
	}

	/// Resumes delivery on every path. With `notify == false`, pending state
	/// is reset first (`skipped_too` extends the reset to paths other
	/// watchers have stopped) and each path's current state is adopted
	/// silently.
	pub fn start_scan(&self, notify: bool, skipped_too: bool) {
		if self.attached() {
			self.stopped.set(false);
			let _ = self.engine.send(EngineCommand::StartScan {
				id: self.id,
				notify,
				skipped_too,
			});
		}
	}

	/// Whether [`DirWatcher::stop_scan`] is in effect.
	pub fn is_stopped(&self) -> bool {
		self.stopped.get()
	}

	/// Whether this watcher currently has `path` registered.
	pub async fn contains(&self, path: impl AsRef<Path>) -> bool {
		if !self.attached() {
			return false;
		}
		let (reply, response) = oneshot::channel();
		let _ = self.engine.send(EngineCommand::Contains {
			id: self.id,
			path: path.as_ref().to_path_buf(),
			reply,
		});
		response.await.unwrap_or(false)
	}

	/// The most recently observed change timestamp of a watched path, or
	/// `None` while it is unknown or the path does not exist.
	pub async fn ctime(&self, path: impl AsRef<Path>) -> Option<SystemTime> {
		if !self.attached() {
			return None;
		}
		let (reply, response) = oneshot::channel();
		let _ = self.engine.send(EngineCommand::Ctime {
			path: path.as_ref().to_path_buf(),
			reply,
		});
		response.await.unwrap_or(None)
	}

	/// The backend the engine prefers for new local paths, for diagnostics.
	pub async fn internal_method(&self) -> Method {
		if !self.attached() {
			return Method::Stat;
		}
		let (reply, response) = oneshot::channel();
		let _ = self.engine.send(EngineCommand::InternalMethod { reply });
		response.await.unwrap_or(Method::Stat)
	}

	/// The next change notification for this watcher. Returns `None` once
	/// the engine is gone.
	pub async fn next_event(&mut self) -> Option<WatchEvent> {
		if self.detached.get() {
			return None;
		}
		self.events.recv().await
	}
}

impl Default for DirWatcher {
	fn default() -> Self {
		Self::new()
	}
}

impl Drop for DirWatcher {
	fn drop(&mut self) {
		if !self.detached.get() {
			let _ = self.engine.send(EngineCommand::Deregister { id: self.id });
		}
	}
}
