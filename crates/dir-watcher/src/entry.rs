//! The canonical per-path record and its client bookkeeping.
//!
//! Entries reference their waiting sub-entries by path, never by pointer;
//! upward traversal goes through [`Path::parent`], so ownership only ever
//! flows parent to child and cannot cycle.

use std::path::{Path, PathBuf};

use crate::backend::BackendKind;
use crate::event::{EventSet, WatchModes};

pub(crate) type ClientId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EntryStatus {
	/// The path existed at the most recent observation.
	Normal,
	/// The path does not exist yet, or no longer exists.
	NonExistent,
}

/// One watcher instance's registered interest in one entry.
#[derive(Debug)]
pub(crate) struct Client {
	pub id: ClientId,
	/// How many times this instance registered the path; removals must balance.
	pub count: u32,
	pub modes: WatchModes,
	pub stopped: bool,
	/// Coalesced bits merged into the next emission; never replayed after a
	/// restart.
	pub pending: EventSet,
}

/// The engine's record for one watched path.
#[derive(Debug)]
pub(crate) struct Entry {
	pub path: PathBuf,
	pub is_dir: bool,
	pub status: EntryStatus,
	pub mode: BackendKind,
	/// Maximum of the change/modify timestamps, in nanoseconds since the
	/// epoch; `None` while the path does not exist.
	pub ctime_ns: Option<i64>,
	pub ino: u64,
	pub nlink: u64,
	pub clients: Vec<Client>,
	/// Non-existent paths waiting for this entry to notice their creation.
	pub sub_entries: Vec<PathBuf>,
	/// A backend saw something; classify on the next rescan.
	pub dirty: bool,
	/// Children with coalesced `Changed` events, flushed per rescan pass.
	pub pending_child_changes: Vec<PathBuf>,
	/// Stat pacing: per-entry poll period and countdown until the next scan.
	pub freq: u64,
	pub ms_left: i64,
}

impl Entry {
	pub fn new(path: PathBuf) -> Self {
		Self {
			path,
			is_dir: false,
			status: EntryStatus::NonExistent,
			mode: BackendKind::Unknown,
			ctime_ns: None,
			ino: 0,
			nlink: 0,
			clients: Vec::new(),
			sub_entries: Vec::new(),
			dirty: false,
			pending_child_changes: Vec::new(),
			freq: 0,
			ms_left: 0,
		}
	}

	/// Registers interest; repeated registrations bump the count and adopt
	/// the new watch modes.
	pub fn add_client(&mut self, id: ClientId, modes: WatchModes) {
		if let Some(client) = self.find_client_mut(id) {
			client.count += 1;
			client.modes = modes;
			return;
		}
		self.clients.push(Client {
			id,
			count: 1,
			modes,
			stopped: false,
			pending: EventSet::empty(),
		});
	}

	pub fn remove_client(&mut self, id: ClientId) {
		if let Some(pos) = self.clients.iter().position(|c| c.id == id) {
			let client = &mut self.clients[pos];
			client.count -= 1;
			if client.count == 0 {
				self.clients.remove(pos);
			}
		}
	}

	pub fn find_client_mut(&mut self, id: ClientId) -> Option<&mut Client> {
		self.clients.iter_mut().find(|c| c.id == id)
	}

	pub fn client_count(&self) -> u32 {
		self.clients.iter().map(|c| c.count).sum()
	}

	/// An entry with neither clients nor waiting sub-entries is torn down.
	pub fn is_valid(&self) -> bool {
		!self.clients.is_empty() || !self.sub_entries.is_empty()
	}

	pub fn add_sub_entry(&mut self, path: &Path) {
		if !self.has_sub_entry(path) {
			self.sub_entries.push(path.to_path_buf());
		}
	}

	pub fn remove_sub_entry(&mut self, path: &Path) {
		self.sub_entries.retain(|p| p != path);
	}

	pub fn has_sub_entry(&self, path: &Path) -> bool {
		self.sub_entries.iter().any(|p| p == path)
	}
}

pub(crate) fn is_root(path: &Path) -> bool {
	path.parent().is_none()
}

/// Resolves against the working directory and strips trailing separators and
/// `.` components. Symlinks are left alone; the engine never follows them.
pub(crate) fn normalize_path(path: &Path) -> PathBuf {
	let absolute = if path.is_absolute() {
		path.to_path_buf()
	} else {
		std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
	};
	absolute.components().collect()
}
