//! Event types delivered to watcher instances, plus the watch-mode flags
//! controlling which directory children a client is interested in.

use std::path::PathBuf;

bitflags::bitflags! {
	/// Controls which events a directory registration receives.
	///
	/// With an empty set only changes to the directory itself are reported.
	#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
	pub struct WatchModes: u8 {
		/// Report creation and deletion of files inside the directory.
		const FILES = 1 << 0;
		/// Watch subdirectories recursively.
		const SUB_DIRS = 1 << 1;
	}
}

bitflags::bitflags! {
	/// Internal event bit set; a single scan can report a combination
	/// (e.g. a delete-and-recreate is `DELETED | CREATED`).
	#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
	pub(crate) struct EventSet: u8 {
		const CHANGED = 1 << 0;
		const CREATED = 1 << 1;
		const DELETED = 1 << 2;
	}
}

/// What happened to a watched path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
	Created,
	Changed,
	Deleted,
}

/// A change notification for a single path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
	pub path: PathBuf,
	pub kind: EventKind,
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn default_watch_modes_are_dir_only() {
		assert!(WatchModes::default().is_empty());
		assert!(!WatchModes::default().contains(WatchModes::FILES));
	}

	#[test]
	fn event_set_combines() {
		let ev = EventSet::DELETED | EventSet::CREATED;
		assert!(ev.contains(EventSet::DELETED));
		assert!(ev.contains(EventSet::CREATED));
		assert!(!ev.contains(EventSet::CHANGED));
	}
}
