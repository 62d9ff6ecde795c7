//! Generic platform watcher backend.
//!
//! Wraps the `notify` recommended watcher as an unclassified "something about
//! this path changed" source; the engine re-stats on every wake to turn that
//! into a precise event. A single underlying watcher is shared by all
//! generic-mode entries and lives as long as the engine.

use std::path::Path;

use notify::{Config, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::WatcherError;

pub(crate) type RawEvent = notify::Result<notify::Event>;

pub(crate) struct GenericBackend {
	watcher: RecommendedWatcher,
}

impl GenericBackend {
	pub(crate) fn new(tx: mpsc::UnboundedSender<RawEvent>) -> Result<Self, WatcherError> {
		let watcher = RecommendedWatcher::new(
			move |result: RawEvent| {
				let _ = tx.send(result);
			},
			Config::default(),
		)
		.map_err(WatcherError::PlatformInit)?;
		Ok(Self { watcher })
	}

	/// Watching is always non-recursive; recursion is the engine's job.
	/// Re-requesting an already watched path is harmless, which the engine
	/// relies on: the primitive silently drops its watch when the path
	/// vanishes, so watches are re-requested on every observed change.
	pub(crate) fn watch(&mut self, path: &Path) -> Result<(), WatcherError> {
		self.watcher
			.watch(path, RecursiveMode::NonRecursive)
			.map_err(|source| WatcherError::PlatformWatch {
				path: path.to_path_buf(),
				source,
			})
	}

	pub(crate) fn unwatch(&mut self, path: &Path) {
		if let Err(err) = self.watcher.unwatch(path) {
			debug!("failed to unwatch {}: {err}", path.display());
		}
	}
}
