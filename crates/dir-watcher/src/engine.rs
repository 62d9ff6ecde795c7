//! Engine core: entry table ownership, backend selection and fallback,
//! non-existent-path walking, scan classification, event emission and the
//! delayed-removal discipline.
//!
//! All engine state is owned by a single task; watcher facades talk to it
//! over a command channel and receive events over per-instance channels, so
//! client code never runs inside a dispatch pass. One engine serves every
//! watcher created on the same thread.

use std::collections::{HashMap, HashSet};
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, trace, warn};

#[cfg(target_os = "linux")]
use inotify::EventMask;

use crate::backend::generic::{GenericBackend, RawEvent};
use crate::backend::inotify::{InotifyBackend, InotifyItem};
use crate::backend::stat;
use crate::backend::BackendKind;
use crate::config::{Method, WatcherConfig};
use crate::entry::{is_root, normalize_path, ClientId, Entry, EntryStatus};
use crate::event::{EventKind, EventSet, WatchEvent, WatchModes};
use crate::fs_type::{self, FsClass};

/// Upper bound for the global poll cadence while no stat entry asks for less.
const IDLE_FREQ_MS: u64 = 3_600_000;

pub(crate) enum EngineCommand {
	Register {
		id: ClientId,
		events: mpsc::UnboundedSender<WatchEvent>,
	},
	Deregister {
		id: ClientId,
	},
	AddEntry {
		id: ClientId,
		path: PathBuf,
		is_dir: bool,
		modes: WatchModes,
	},
	RemoveEntry {
		id: ClientId,
		path: PathBuf,
	},
	StopDirScan {
		id: ClientId,
		path: PathBuf,
		reply: oneshot::Sender<bool>,
	},
	RestartDirScan {
		id: ClientId,
		path: PathBuf,
		reply: oneshot::Sender<bool>,
	},
	StopScan {
		id: ClientId,
	},
	StartScan {
		id: ClientId,
		notify: bool,
		skipped_too: bool,
	},
	Contains {
		id: ClientId,
		path: PathBuf,
		reply: oneshot::Sender<bool>,
	},
	Ctime {
		path: PathBuf,
		reply: oneshot::Sender<Option<SystemTime>>,
	},
	InternalMethod {
		reply: oneshot::Sender<Method>,
	},
}

struct Instance {
	events: mpsc::UnboundedSender<WatchEvent>,
}

pub(crate) struct Engine {
	config: WatcherConfig,
	entries: HashMap<PathBuf, Entry>,
	instances: HashMap<ClientId, Instance>,
	inotify: Option<InotifyBackend>,
	/// Native setup failed outright; the generic backend shares the same
	/// kernel primitive here and must not be retried.
	inotify_failed: bool,
	generic: Option<GenericBackend>,
	generic_tx: Option<mpsc::UnboundedSender<RawEvent>>,
	/// Global stat cadence, the minimum of the active per-entry frequencies.
	freq_ms: u64,
	stat_entries: usize,
	next_stat_tick: Option<Instant>,
	/// Single-shot rescan requested by an event-driven backend.
	rescan_at: Option<Instant>,
	/// While a rescan pass runs, empty entries go to `remove_list` instead of
	/// being destroyed, keeping them addressable for the rest of the pass.
	delay_remove: bool,
	remove_list: HashSet<PathBuf>,
}

impl Engine {
	fn new(config: WatcherConfig) -> Self {
		Self {
			config,
			entries: HashMap::new(),
			instances: HashMap::new(),
			inotify: None,
			inotify_failed: false,
			generic: None,
			generic_tx: None,
			freq_ms: IDLE_FREQ_MS,
			stat_entries: 0,
			next_stat_tick: None,
			rescan_at: None,
			delay_remove: false,
			remove_list: HashSet::new(),
		}
	}

	/// Spawns the engine task for this thread's watchers.
	pub(crate) fn spawn(config: WatcherConfig) -> mpsc::UnboundedSender<EngineCommand> {
		let (tx, rx) = mpsc::unbounded_channel();
		tokio::spawn(Engine::new(config).run(rx));
		tx
	}

	async fn run(mut self, mut commands: mpsc::UnboundedReceiver<EngineCommand>) {
		let mut inotify_rx = match InotifyBackend::new() {
			Ok((backend, rx)) => {
				self.inotify = Some(backend);
				rx
			}
			Err(err) => {
				debug!("native notification unavailable: {err}");
				self.inotify_failed = true;
				// a closed channel keeps the select arm permanently idle
				let (tx, rx) = mpsc::unbounded_channel();
				drop(tx);
				rx
			}
		};
		let (generic_tx, mut generic_rx) = mpsc::unbounded_channel();
		self.generic_tx = Some(generic_tx);
		debug!(
			"engine started (preferred method {}, nfs {})",
			self.config.preferred_method, self.config.nfs_preferred_method
		);

		loop {
			let stat_at = self.next_stat_tick;
			let rescan_at = self.rescan_at;
			tokio::select! {
				cmd = commands.recv() => match cmd {
					Some(cmd) => self.handle_command(cmd),
					// Every facade and the thread-local handle are gone.
					None => break,
				},
				Some(item) = inotify_rx.recv() => self.on_inotify_item(item),
				Some(raw) = generic_rx.recv() => self.on_generic_result(raw),
				_ = sleep_until(rescan_at.unwrap_or_else(Instant::now)), if rescan_at.is_some() => {
					self.rescan_at = None;
					self.rescan();
				},
				_ = sleep_until(stat_at.unwrap_or_else(Instant::now)), if stat_at.is_some() => {
					self.next_stat_tick =
						Some(Instant::now() + Duration::from_millis(self.freq_ms));
					self.rescan();
				},
			}
		}
		debug!("engine shut down");
	}

	fn handle_command(&mut self, cmd: EngineCommand) {
		match cmd {
			EngineCommand::Register { id, events } => {
				self.instances.insert(id, Instance { events });
			}
			EngineCommand::Deregister { id } => {
				self.remove_entries(id);
				self.instances.remove(&id);
			}
			EngineCommand::AddEntry {
				id,
				path,
				is_dir,
				modes,
			} => self.add_entry(Some(id), &path, None, is_dir, modes),
			EngineCommand::RemoveEntry { id, path } => {
				let path = normalize_path(&path);
				self.remove_entry(Some(id), &path, None);
			}
			EngineCommand::StopDirScan { id, path, reply } => {
				let path = normalize_path(&path);
				let is_dir = self.entries.get(&path).map_or(false, |e| e.is_dir);
				let stopped = is_dir && self.stop_entry_scan(id, &path);
				let _ = reply.send(stopped);
			}
			EngineCommand::RestartDirScan { id, path, reply } => {
				let path = normalize_path(&path);
				let is_dir = self.entries.get(&path).map_or(false, |e| e.is_dir);
				// restart without notifying about pending events
				let restarted = is_dir && self.restart_entry_scan(id, &path, false);
				let _ = reply.send(restarted);
			}
			EngineCommand::StopScan { id } => {
				let paths: Vec<PathBuf> = self.entries.keys().cloned().collect();
				for path in paths {
					self.stop_entry_scan(id, &path);
				}
			}
			EngineCommand::StartScan {
				id,
				notify,
				skipped_too,
			} => {
				if !notify {
					self.reset_list(skipped_too);
				}
				let paths: Vec<PathBuf> = self.entries.keys().cloned().collect();
				for path in paths {
					self.restart_entry_scan(id, &path, notify);
				}
			}
			EngineCommand::Contains { id, path, reply } => {
				let path = normalize_path(&path);
				let contained = self
					.entries
					.get(&path)
					.map_or(false, |e| e.clients.iter().any(|c| c.id == id));
				let _ = reply.send(contained);
			}
			EngineCommand::Ctime { path, reply } => {
				let path = normalize_path(&path);
				let ctime = self.entries.get(&path).and_then(|e| e.ctime_ns).map(|ns| {
					UNIX_EPOCH + Duration::from_nanos(ns.max(0) as u64)
				});
				let _ = reply.send(ctime);
			}
			EngineCommand::InternalMethod { reply } => {
				let _ = reply.send(self.internal_method());
			}
		}
	}

	fn internal_method(&self) -> Method {
		match self.config.preferred_method {
			Method::INotify if self.inotify.is_some() => Method::INotify,
			Method::Generic => Method::Generic,
			Method::Stat => Method::Stat,
			// Native unavailable; the platform watcher is next in line.
			Method::INotify => Method::Generic,
		}
	}

	fn poll_duration(&self) -> Duration {
		Duration::from_millis(self.config.poll_interval_ms)
	}

	fn schedule_rescan(&mut self, delay: Duration) {
		let at = Instant::now() + delay;
		if self.rescan_at.map_or(true, |current| at < current) {
			self.rescan_at = Some(at);
		}
	}

	fn schedule_rescan_if_idle(&mut self, delay: Duration) {
		if self.rescan_at.is_none() {
			self.rescan_at = Some(Instant::now() + delay);
		}
	}

	/// Registers interest in a path, creating the entry if needed and
	/// attaching the best available backend. `sub_entry` marks a dependent
	/// non-existent path waiting for this one to notice its creation.
	fn add_entry(
		&mut self,
		instance: Option<ClientId>,
		path: &Path,
		sub_entry: Option<&Path>,
		is_dir: bool,
		mut modes: WatchModes,
	) {
		if path.to_string_lossy().starts_with(":/") {
			warn!("cannot watch pseudo-resource path {}", path.display());
			return;
		}
		let path = normalize_path(path);
		if path.as_os_str().is_empty() || is_forbidden_path(&path) {
			return;
		}

		if let Some(entry) = self.entries.get_mut(&path) {
			if let Some(sub) = sub_entry {
				entry.add_sub_entry(sub);
				trace!(
					"added already watched entry {} (for {})",
					path.display(),
					sub.display()
				);
			} else if let Some(id) = instance {
				entry.add_client(id, modes);
				trace!(
					"added already watched entry {} (now {} clients)",
					path.display(),
					entry.client_count()
				);
			}
			return;
		}

		let identity = stat::probe(&path);
		let mut entry = Entry::new(path.clone());
		match identity {
			Some(ident) => {
				entry.is_dir = ident.is_dir;
				// Symlinks are never followed; a link to a directory is
				// watched as a file.
				if entry.is_dir && !is_dir && stat::is_symlink(&path) {
					entry.is_dir = false;
				}
				if entry.is_dir && !is_dir {
					warn!("{} is a directory, use add_dir", path.display());
				} else if !entry.is_dir && is_dir {
					warn!("{} is a file, use add_file", path.display());
				}
				if !entry.is_dir && !modes.is_empty() {
					warn!(
						"{} is a file, file and subdirectory watch modes are ignored",
						path.display()
					);
					modes = WatchModes::empty();
				}
				entry.ctime_ns = Some(ident.ctime_ns);
				entry.status = EntryStatus::Normal;
				entry.nlink = ident.nlink;
				entry.ino = ident.ino;
			}
			None => {
				entry.is_dir = is_dir;
				entry.status = EntryStatus::NonExistent;
			}
		}
		if let Some(sub) = sub_entry {
			entry.add_sub_entry(sub);
		} else if let Some(id) = instance {
			entry.add_client(id, modes);
		}
		let exists = identity.is_some();
		let entry_is_dir = entry.is_dir;
		debug!(
			"added {} {}{}",
			if entry_is_dir { "dir" } else { "file" },
			path.display(),
			if exists { "" } else { " (non-existent)" }
		);
		self.entries.insert(path.clone(), entry);

		if path.file_name().map_or(false, is_noisy_file) {
			return;
		}

		if exists && entry_is_dir && !modes.is_empty() {
			// Initial recursive registration. With native notification the
			// directory watch already reports its files, so only
			// subdirectories need entries of their own there.
			let watch_files = modes.contains(WatchModes::FILES)
				&& !(cfg!(target_os = "linux")
					&& self.config.preferred_method == Method::INotify);
			let watch_dirs = modes.contains(WatchModes::SUB_DIRS);
			if let Ok(children) = std::fs::read_dir(&path) {
				for child in children.flatten() {
					let Ok(file_type) = child.file_type() else {
						continue;
					};
					// symlinks are reported as symlinks here, never as dirs
					let child_is_dir = file_type.is_dir();
					if child_is_dir && watch_dirs {
						self.add_entry(instance, &child.path(), None, true, modes);
					} else if !child_is_dir && watch_files {
						self.add_entry(
							instance,
							&child.path(),
							None,
							false,
							WatchModes::empty(),
						);
					}
				}
			}
		}

		self.add_watch(&path);
	}

	/// Picks a backend for the entry: the configured preference (or the
	/// network-mount preference when the path lives on one), then fallback
	/// in the fixed order INotify → Generic → Stat.
	fn add_watch(&mut self, path: &Path) {
		let mut preferred = self.config.preferred_method;
		if self.config.nfs_preferred_method != preferred
			&& fs_type::classify(path) == FsClass::Network
		{
			preferred = self.config.nfs_preferred_method;
		}

		let mut inotify_refused = false;
		let attached = match preferred {
			Method::INotify => {
				let ok = self.use_inotify(path);
				if !ok {
					inotify_refused = true;
				}
				ok
			}
			Method::Generic => self.use_generic(path),
			Method::Stat => self.use_stat(path),
		};
		if attached {
			return;
		}
		if preferred != Method::INotify && self.use_inotify(path) {
			return;
		}
		// On Linux the platform watcher sits on the same kernel primitive as
		// the native backend, so a failed native setup is not retried
		// through it.
		let generic_blocked =
			cfg!(target_os = "linux") && (inotify_refused || self.inotify_failed);
		if preferred != Method::Generic && !generic_blocked && self.use_generic(path) {
			return;
		}
		if preferred != Method::Stat {
			self.use_stat(path);
		}
	}

	fn use_inotify(&mut self, path: &Path) -> bool {
		if self.inotify.is_none() {
			return false;
		}
		{
			let Some(entry) = self.entries.get_mut(path) else {
				return false;
			};
			entry.dirty = false;
			entry.mode = BackendKind::INotify;
			if entry.status == EntryStatus::NonExistent {
				// watch the nearest existing ancestor instead; never walk
				// above the filesystem root
				if is_root(path) {
					return false;
				}
			} else {
				return match self.inotify.as_mut() {
					Some(backend) => backend.add(path).is_ok(),
					None => false,
				};
			}
		}
		if let Some(parent) = path.parent().map(Path::to_path_buf) {
			self.add_entry(None, &parent, Some(path), true, WatchModes::empty());
		}
		true
	}

	fn use_generic(&mut self, path: &Path) -> bool {
		{
			let Some(entry) = self.entries.get_mut(path) else {
				return false;
			};
			entry.dirty = false;
			entry.mode = BackendKind::Generic;
			if entry.status == EntryStatus::NonExistent {
				if is_root(path) {
					return false;
				}
				// fall through to the parent walk below
			} else {
				if self.generic.is_none() {
					let Some(tx) = self.generic_tx.clone() else {
						return false;
					};
					match GenericBackend::new(tx) {
						Ok(backend) => self.generic = Some(backend),
						Err(err) => {
							warn!("{err}");
							return false;
						}
					}
				}
				return match self.generic.as_mut() {
					Some(backend) => match backend.watch(path) {
						Ok(()) => true,
						Err(err) => {
							warn!("{err}");
							false
						}
					},
					None => false,
				};
			}
		}
		if let Some(parent) = path.parent().map(Path::to_path_buf) {
			self.add_entry(None, &parent, Some(path), true, WatchModes::empty());
		}
		true
	}

	fn use_stat(&mut self, path: &Path) -> bool {
		let interval = match fs_type::classify(path) {
			FsClass::Network => self.config.nfs_poll_interval_ms,
			FsClass::Local => self.config.poll_interval_ms,
		};
		self.use_freq(path, interval);
		let Some(entry) = self.entries.get_mut(path) else {
			return false;
		};
		if entry.mode != BackendKind::Stat {
			entry.mode = BackendKind::Stat;
			self.stat_entries += 1;
			if self.stat_entries == 1 {
				self.next_stat_tick =
					Some(Instant::now() + Duration::from_millis(self.freq_ms));
				debug!("started polling timer, every {} ms", self.freq_ms);
			}
		}
		trace!("stat polling every {} ms for {}", interval, path.display());
		true
	}

	/// Sets the per-entry poll period, lowering the global cadence if needed.
	fn use_freq(&mut self, path: &Path, new_freq: u64) {
		let Some(entry) = self.entries.get_mut(path) else {
			return;
		};
		entry.freq = new_freq;
		if new_freq < self.freq_ms {
			self.freq_ms = new_freq;
			if self.next_stat_tick.is_some() {
				self.next_stat_tick = Some(Instant::now() + Duration::from_millis(new_freq));
			}
			debug!("global poll interval is now {} ms", new_freq);
		}
	}

	fn remove_watch(&mut self, path: &Path, mode: BackendKind) {
		match mode {
			BackendKind::INotify => {
				if let Some(backend) = self.inotify.as_mut() {
					backend.remove(path);
				}
			}
			BackendKind::Generic => {
				if let Some(backend) = self.generic.as_mut() {
					backend.unwatch(path);
				}
			}
			BackendKind::Stat | BackendKind::Unknown => {}
		}
	}

	/// Balanced removal. Destroys the entry once it has neither clients nor
	/// sub-entries, deferring destruction while a rescan pass is running.
	fn remove_entry(
		&mut self,
		instance: Option<ClientId>,
		path: &Path,
		sub_entry: Option<&Path>,
	) {
		self.remove_list.remove(path);
		let (valid, status, mode) = {
			let Some(entry) = self.entries.get_mut(path) else {
				return;
			};
			if let Some(sub) = sub_entry {
				entry.remove_sub_entry(sub);
			} else if let Some(id) = instance {
				entry.remove_client(id);
			}
			(entry.is_valid(), entry.status, entry.mode)
		};
		if valid {
			return;
		}
		if self.delay_remove {
			self.remove_list.insert(path.to_path_buf());
			return;
		}

		if status == EntryStatus::Normal {
			self.remove_watch(path, mode);
		} else if let Some(parent) = path.parent().map(Path::to_path_buf) {
			// a non-existent entry only lives in its parent's sub-entry list
			self.remove_entry(None, &parent, Some(path));
		}
		if mode == BackendKind::Stat {
			self.stat_entries -= 1;
			if self.stat_entries == 0 {
				self.next_stat_tick = None;
				debug!("stopped polling timer");
			}
		}
		if let Some(backend) = self.inotify.as_mut() {
			backend.forget(path);
		}
		trace!("removed entry {}", path.display());
		self.entries.remove(path);
	}

	/// Facade teardown: drop `instance` from every entry it registered, then
	/// raise the global poll cadence if the remaining stat entries allow it.
	fn remove_entries(&mut self, instance: ClientId) {
		let mut min_freq = IDLE_FREQ_MS;
		let mut paths = Vec::new();
		for (path, entry) in self.entries.iter_mut() {
			if let Some(client) = entry.find_client_mut(instance) {
				client.count = 1; // force removal regardless of nesting
				paths.push(path.clone());
			} else if entry.mode == BackendKind::Stat && entry.freq < min_freq {
				min_freq = entry.freq;
			}
		}
		for path in paths {
			self.remove_entry(Some(instance), &path, None);
		}
		if min_freq > self.freq_ms {
			self.freq_ms = min_freq;
			if self.next_stat_tick.is_some() {
				self.next_stat_tick = Some(Instant::now() + Duration::from_millis(min_freq));
			}
			debug!("global poll interval raised to {} ms", min_freq);
		}
	}

	fn stop_entry_scan(&mut self, instance: ClientId, path: &Path) -> bool {
		let Some(entry) = self.entries.get_mut(path) else {
			return false;
		};
		let mut still_watching = 0;
		for client in &mut entry.clients {
			if client.id == instance {
				client.stopped = true;
			} else if !client.stopped {
				still_watching += client.count;
			}
		}
		debug!(
			"watcher-{instance} stopped scanning {} ({still_watching} watchers left)",
			path.display()
		);
		if still_watching == 0 {
			// nobody watches, nobody gets told about what happens meanwhile
			entry.ctime_ns = None;
		}
		true
	}

	fn restart_entry_scan(&mut self, instance: ClientId, path: &Path, notify: bool) -> bool {
		let (was_watching, new_watching) = {
			let Some(entry) = self.entries.get_mut(path) else {
				return false;
			};
			let mut was = 0;
			let mut new = 0;
			for client in &mut entry.clients {
				if !client.stopped {
					was += client.count;
				} else if client.id == instance {
					client.stopped = false;
					new += client.count;
				}
			}
			(was, new)
		};
		if new_watching == 0 {
			return false;
		}
		debug!(
			"watcher-{instance} restarted scanning {} ({} watchers)",
			path.display(),
			was_watching + new_watching
		);

		let mut event = EventSet::empty();
		if was_watching == 0 {
			if !notify {
				// adopt the current state so nothing missed gets replayed
				let identity = stat::probe(path);
				if let Some(entry) = self.entries.get_mut(path) {
					match identity {
						Some(ident) => {
							entry.ctime_ns = Some(ident.ctime_ns);
							entry.status = EntryStatus::Normal;
							entry.nlink = ident.nlink;
							entry.ino = ident.ino;
						}
						None => {
							entry.ctime_ns = None;
							entry.status = EntryStatus::NonExistent;
							entry.nlink = 0;
							entry.ino = 0;
						}
					}
				}
				if identity.is_some() {
					// same as in scan_entry: no sub-entry left behind in the
					// parent once the path exists
					if let Some(parent) = path.parent().map(Path::to_path_buf) {
						self.remove_entry(None, &parent, Some(path));
					}
				}
			}
			if let Some(entry) = self.entries.get_mut(path) {
				entry.ms_left = 0;
			}
			event = self.scan_entry(path);
		}
		self.emit_event(path, event, None);
		true
	}

	/// Clears pending bits; stopped clients keep theirs unless `skipped_too`.
	fn reset_list(&mut self, skipped_too: bool) {
		for entry in self.entries.values_mut() {
			for client in &mut entry.clients {
				if !client.stopped || skipped_too {
					client.pending = EventSet::empty();
				}
			}
		}
	}

	/// Classifies what happened to one entry since its last observation.
	fn scan_entry(&mut self, path: &Path) -> EventSet {
		{
			let Some(entry) = self.entries.get_mut(path) else {
				return EventSet::empty();
			};
			match entry.mode {
				BackendKind::Unknown => return EventSet::empty(),
				BackendKind::INotify => {
					// nothing observed, nothing to stat
					if !entry.dirty {
						return EventSet::empty();
					}
					entry.dirty = false;
				}
				BackendKind::Stat => {
					// with a 500 ms global timer an entry polling at 5000 ms
					// is only scanned every tenth tick
					entry.ms_left -= self.freq_ms as i64;
					if entry.ms_left > 0 {
						return EventSet::empty();
					}
					entry.ms_left += entry.freq as i64;
				}
				BackendKind::Generic => {}
			}
		}

		let identity = stat::probe(path);
		let Some(ident) = identity else {
			let Some(entry) = self.entries.get_mut(path) else {
				return EventSet::empty();
			};
			entry.nlink = 0;
			entry.ino = 0;
			entry.status = EntryStatus::NonExistent;
			if entry.ctime_ns.is_none() {
				return EventSet::empty();
			}
			entry.ctime_ns = None;
			return EventSet::DELETED;
		};

		let (was_nonexistent, prev_ctime, prev_ino, prev_nlink, mode) = {
			let Some(entry) = self.entries.get(path) else {
				return EventSet::empty();
			};
			(
				entry.status == EntryStatus::NonExistent,
				entry.ctime_ns,
				entry.ino,
				entry.nlink,
				entry.mode,
			)
		};

		if was_nonexistent {
			if let Some(entry) = self.entries.get_mut(path) {
				entry.ctime_ns = Some(ident.ctime_ns);
				entry.status = EntryStatus::Normal;
				entry.ino = ident.ino;
				entry.nlink = ident.nlink;
			}
			trace!("{} was created", path.display());
			// drop the placeholder from the parent's waiting list
			if let Some(parent) = path.parent().map(Path::to_path_buf) {
				self.remove_entry(None, &parent, Some(path));
			}
			return EventSet::CREATED;
		}

		if prev_ctime.is_some()
			&& (prev_ctime != Some(ident.ctime_ns)
				|| ident.ino != prev_ino
				|| ident.nlink != prev_nlink)
		{
			if let Some(entry) = self.entries.get_mut(path) {
				entry.ctime_ns = Some(ident.ctime_ns);
				entry.nlink = ident.nlink;
			}
			if prev_ino != ident.ino {
				// deleted and recreated under the same name; rebind the watch
				self.remove_watch(path, mode);
				if let Some(entry) = self.entries.get_mut(path) {
					entry.ino = ident.ino;
				}
				self.add_watch(path);
				return EventSet::DELETED | EventSet::CREATED;
			}
			return EventSet::CHANGED;
		}

		EventSet::empty()
	}

	/// Sends the event bits to every non-stopped client of the entry.
	/// Delivery goes through per-instance channels, so handlers run on a
	/// later turn of their own task and can freely add or remove watches.
	fn emit_event(&mut self, path: &Path, event: EventSet, child: Option<&Path>) {
		let Some(entry) = self.entries.get_mut(path) else {
			return;
		};
		let full: PathBuf = match child {
			Some(c) if c.is_absolute() => c.to_path_buf(),
			Some(c) => path.join(c),
			None => path.to_path_buf(),
		};
		for client in &mut entry.clients {
			if client.count == 0 {
				continue;
			}
			if client.stopped {
				// dropped outright: restarting must not replay these
				continue;
			}
			let mut event = event;
			if event.is_empty() || event == EventSet::CHANGED {
				event |= client.pending;
			}
			client.pending = EventSet::empty();
			if event.is_empty() {
				continue;
			}
			let Some(instance) = self.instances.get(&client.id) else {
				continue;
			};
			if event.contains(EventSet::DELETED) {
				let _ = instance.events.send(WatchEvent {
					path: full.clone(),
					kind: EventKind::Deleted,
				});
			}
			if event.contains(EventSet::CREATED) {
				let _ = instance.events.send(WatchEvent {
					path: full.clone(),
					kind: EventKind::Created,
				});
			}
			if event.contains(EventSet::CHANGED) {
				let _ = instance.events.send(WatchEvent {
					path: full.clone(),
					kind: EventKind::Changed,
				});
			}
		}
	}

	/// Scans every entry: the polling pass for stat mode, and the
	/// classification pass event-driven backends request via the single-shot
	/// rescan timer. Entry destruction is deferred for the whole pass.
	fn rescan(&mut self) {
		self.delay_remove = true;
		let paths: Vec<PathBuf> = self.entries.keys().cloned().collect();

		// Entries waiting below a dirty event-driven entry must be scanned
		// too, or their creation would go unnoticed until the next poll.
		for path in &paths {
			let propagate = self.entries.get(path).map_or(false, |e| {
				matches!(e.mode, BackendKind::INotify | BackendKind::Generic) && e.dirty
			});
			if propagate {
				self.propagate_dirty(path);
			}
		}

		let mut created = Vec::new();
		for path in &paths {
			let Some(entry) = self.entries.get(path) else {
				continue;
			};
			// skip entries scheduled for removal
			if !entry.is_valid() {
				continue;
			}
			let mode = entry.mode;
			let is_dir = entry.is_dir;

			let event = self.scan_entry(path);
			match mode {
				BackendKind::INotify => {
					if event == EventSet::DELETED {
						trace!("{} disappeared", path.display());
						// the descriptor no longer names this path
						if let Some(backend) = self.inotify.as_mut() {
							backend.forget(path);
						}
						if !is_root(path) {
							if let Some(parent) = path.parent().map(Path::to_path_buf) {
								self.add_entry(
									None,
									&parent,
									Some(path),
									true,
									WatchModes::empty(),
								);
							}
						}
					} else if event == EventSet::CREATED {
						let unwatched = self
							.inotify
							.as_ref()
							.map_or(true, |b| !b.is_watched(path));
						if unwatched {
							created.push(path.clone());
							self.add_watch(path);
						}
					}
				}
				BackendKind::Generic => {
					if event == EventSet::CREATED {
						self.add_watch(path);
					}
				}
				BackendKind::Stat | BackendKind::Unknown => {}
			}

			if is_dir {
				// flush coalesced child changes, deduplicated by name
				let pending = self
					.entries
					.get_mut(path)
					.map(|e| std::mem::take(&mut e.pending_child_changes))
					.unwrap_or_default();
				let mut seen = HashSet::new();
				for changed in pending {
					if seen.insert(changed.clone()) {
						self.emit_event(path, EventSet::CHANGED, Some(&changed));
					}
				}
			}

			if !event.is_empty() {
				self.emit_event(path, event, None);
			}
		}

		// newly created entries are watched directly now; their parents no
		// longer need to hold them
		for path in created {
			if let Some(parent) = path.parent().map(Path::to_path_buf) {
				self.remove_entry(None, &parent, Some(&path));
			}
		}

		self.delay_remove = false;
		self.flush_removals();
	}

	fn propagate_dirty(&mut self, path: &Path) {
		let subs = self
			.entries
			.get(path)
			.map(|e| e.sub_entries.clone())
			.unwrap_or_default();
		for sub in subs {
			let recurse = match self.entries.get_mut(&sub) {
				Some(entry) if !entry.dirty => {
					entry.dirty = true;
					true
				}
				_ => false,
			};
			if recurse {
				self.propagate_dirty(&sub);
			}
		}
	}

	fn flush_removals(&mut self) {
		// removing one entry can cascade into removing its parent, so drain
		// rather than iterate
		while let Some(path) = self.remove_list.iter().next().cloned() {
			self.remove_entry(None, &path, None);
		}
	}

	#[cfg(target_os = "linux")]
	fn on_inotify_item(&mut self, item: InotifyItem) {
		let event = match item {
			Ok(event) => event,
			Err(err) => {
				warn!("inotify read error: {err}");
				return;
			}
		};
		if event.mask.contains(EventMask::Q_OVERFLOW) {
			// the batch is lost; callers who care must rescan on their own
			warn!("inotify event queue overflowed, raise fs.inotify.max_queued_events");
			return;
		}
		if let Some(name) = &event.name {
			if is_noisy_file(name) {
				return;
			}
		}
		let is_dir_event = event.mask.contains(EventMask::ISDIR);
		let Some(path) = self
			.inotify
			.as_ref()
			.and_then(|b| b.path_for(&event.wd))
			.cloned()
		else {
			return;
		};
		let (was_dirty, entry_is_dir, has_clients) = {
			let Some(entry) = self.entries.get_mut(&path) else {
				return;
			};
			let was_dirty = entry.dirty;
			entry.dirty = true;
			(was_dirty, entry.is_dir, !entry.clients.is_empty())
		};
		let child_path = event.name.as_ref().map(|name| path.join(name));
		trace!(
			"inotify {:?} for {} {:?}",
			event.mask,
			path.display(),
			event.name
		);

		if event.mask.contains(EventMask::DELETE_SELF) {
			if let Some(entry) = self.entries.get_mut(&path) {
				entry.status = EntryStatus::NonExistent;
				entry.ctime_ns = None;
			}
			if let Some(backend) = self.inotify.as_mut() {
				backend.forget(&path);
			}
			self.emit_event(&path, EventSet::DELETED, None);
			// watch the parent so a recreation is noticed; never walk above
			// the filesystem root
			if let Some(parent) = path.parent().map(Path::to_path_buf) {
				if let Some(parent_entry) = self.entries.get_mut(&parent) {
					parent_entry.dirty = true;
				}
				self.add_entry(None, &parent, Some(&path), true, WatchModes::empty());
			}
		}

		if event.mask.intersects(EventMask::CREATE | EventMask::MOVED_TO) {
			if let Some(child) = &child_path {
				let is_sub = self
					.entries
					.get(&path)
					.map_or(false, |e| e.has_sub_entry(child));
				if is_sub {
					// the path we were waiting for appeared; classify right
					// away so it gets its own watch
					if let Some(sub) = self.entries.get_mut(child) {
						sub.dirty = true;
					}
					self.schedule_rescan(Duration::ZERO);
				} else if entry_is_dir && has_clients {
					let flag = if is_dir_event {
						WatchModes::SUB_DIRS
					} else {
						WatchModes::FILES
					};
					let interested: Vec<(ClientId, WatchModes)> = self
						.entries
						.get(&path)
						.map(|e| {
							e.clients
								.iter()
								.filter(|c| c.modes.contains(flag))
								.map(|c| (c.id, c.modes))
								.collect()
						})
						.unwrap_or_default();
					if is_dir_event {
						for (id, modes) in &interested {
							self.add_entry(Some(*id), child, None, true, *modes);
						}
					}
					if !interested.is_empty() {
						self.emit_event(&path, EventSet::CREATED, Some(child));
						trace!(
							"{} client(s) monitoring new {} {}",
							interested.len(),
							if is_dir_event { "dir" } else { "file" },
							child.display()
						);
					}
					// the directory itself changed as well
					if let Some(entry) = self.entries.get_mut(&path) {
						entry.pending_child_changes.push(path.clone());
					}
					self.schedule_rescan_if_idle(self.poll_duration());
				}
			}
		}

		if event.mask.intersects(EventMask::DELETE | EventMask::MOVED_FROM) {
			// a child without its own entry went away; no bookkeeping, just
			// tell whoever asked for child events
			if entry_is_dir && has_clients {
				if let Some(child) = &child_path {
					let flag = if is_dir_event {
						WatchModes::SUB_DIRS
					} else {
						WatchModes::FILES
					};
					let any = self
						.entries
						.get(&path)
						.map_or(false, |e| e.clients.iter().any(|c| c.modes.contains(flag)));
					if any {
						self.emit_event(&path, EventSet::DELETED, Some(child));
					}
				}
			}
		}

		if event.mask.intersects(EventMask::MODIFY | EventMask::ATTRIB) {
			if entry_is_dir && has_clients {
				if let Some(entry) = self.entries.get_mut(&path) {
					match &child_path {
						Some(child) => entry.pending_child_changes.push(child.clone()),
						None => entry.pending_child_changes.push(path.clone()),
					}
					// avoid stat'ing the directory when only a child changed
					entry.dirty = was_dirty
						|| (child_path.is_none() && event.mask.contains(EventMask::ATTRIB));
				}
			}
		}

		self.schedule_rescan_if_idle(self.poll_duration());
	}

	#[cfg(not(target_os = "linux"))]
	fn on_inotify_item(&mut self, item: InotifyItem) {
		match item {}
	}

	fn on_generic_result(&mut self, raw: RawEvent) {
		match raw {
			Ok(event) => {
				for path in &event.paths {
					self.on_generic_path(path);
				}
			}
			Err(err) => warn!("platform watcher error: {err}"),
		}
	}

	fn on_generic_path(&mut self, path: &Path) {
		let path = normalize_path(path);
		if self.entries.contains_key(&path) {
			self.generic_event(&path);
			return;
		}
		// a non-recursive directory watch reports the child path; route the
		// wake to the watched parent
		if let Some(parent) = path.parent().map(Path::to_path_buf) {
			if self.entries.contains_key(&parent) {
				self.generic_event(&parent);
			}
		}
	}

	/// The primitive only says "something changed here"; stat classification
	/// turns that into a precise event.
	fn generic_event(&mut self, path: &Path) {
		let is_dir = {
			let Some(entry) = self.entries.get_mut(path) else {
				return;
			};
			entry.dirty = true;
			entry.is_dir
		};
		let event = self.scan_entry(path);
		if !event.is_empty() {
			self.emit_event(path, event, None);
		}
		if event == EventSet::DELETED {
			if !is_root(path) {
				if let Some(parent) = path.parent().map(Path::to_path_buf) {
					self.add_entry(None, &parent, Some(path), true, WatchModes::empty());
				}
			}
		} else if event == EventSet::CREATED {
			// we were waiting for it; give it its own watch
			self.add_watch(path);
		} else if is_dir {
			// a child we were waiting for may have appeared
			let subs = self
				.entries
				.get(path)
				.map(|e| e.sub_entries.clone())
				.unwrap_or_default();
			for sub in subs {
				self.generic_event(&sub);
			}
		} else {
			// The primitive deletes its watch on its own when the path
			// vanishes, and a modify can really be a delete-and-recreate it
			// already gave up on. Re-request the watch on every wake so the
			// underlying monitor cannot be lost silently.
			if let Some(backend) = self.generic.as_mut() {
				let _ = backend.watch(path);
			}
		}
	}
}

/// Well-known churn generators that would otherwise flood clients.
fn is_noisy_file(name: &OsStr) -> bool {
	let Some(name) = name.to_str() else {
		return false;
	};
	name.starts_with(".X.err")
		|| name.starts_with(".xsession-errors")
		|| name.starts_with(".fonts.cache")
}

/// Device trees generate events no client can meaningfully watch.
#[cfg(unix)]
fn is_forbidden_path(path: &Path) -> bool {
	let path = path.to_string_lossy();
	path == "/dev"
		|| (path.starts_with("/dev/")
			&& !path.starts_with("/dev/.")
			&& !path.starts_with("/dev/shm"))
}

#[cfg(not(unix))]
fn is_forbidden_path(_path: &Path) -> bool {
	false
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn noisy_names_are_filtered() {
		assert!(is_noisy_file(OsStr::new(".X.err")));
		assert!(is_noisy_file(OsStr::new(".xsession-errors-:0")));
		assert!(is_noisy_file(OsStr::new(".fonts.cache-7")));
		assert!(!is_noisy_file(OsStr::new(".bashrc")));
		assert!(!is_noisy_file(OsStr::new("fonts.cache")));
	}

	#[cfg(unix)]
	#[test]
	fn device_trees_are_rejected() {
		assert!(is_forbidden_path(Path::new("/dev")));
		assert!(is_forbidden_path(Path::new("/dev/tty0")));
		assert!(!is_forbidden_path(Path::new("/dev/shm")));
		assert!(!is_forbidden_path(Path::new("/dev/shm/scratch")));
		assert!(!is_forbidden_path(Path::new("/dev/.hidden")));
		assert!(!is_forbidden_path(Path::new("/developers")));
		assert!(!is_forbidden_path(Path::new("/home/dev")));
	}
}
