//! Native inode-notification backend (Linux).
//!
//! One inotify instance serves every native-mode entry. The event stream is
//! drained by a forwarder task and handed to the engine over a channel; the
//! buffered stream reader takes care of partial trailing records across
//! reads. Watch descriptors are owned here, with the reverse descriptor→path
//! map the engine needs to route kernel records back to entries.

#[cfg(target_os = "linux")]
pub(crate) use self::linux::{InotifyBackend, InotifyItem};
#[cfg(not(target_os = "linux"))]
pub(crate) use self::unsupported::{InotifyBackend, InotifyItem};

#[cfg(target_os = "linux")]
mod linux {
	use std::collections::HashMap;
	use std::io;
	use std::path::{Path, PathBuf};

	use futures::StreamExt;
	use inotify::{EventOwned, Inotify, WatchDescriptor, WatchMask, Watches};
	use tokio::sync::mpsc;
	use tracing::{debug, trace, warn};

	use crate::error::WatcherError;

	pub(crate) type InotifyItem = io::Result<EventOwned>;

	pub(crate) struct InotifyBackend {
		watches: Watches,
		wd_to_path: HashMap<WatchDescriptor, PathBuf>,
		path_to_wd: HashMap<PathBuf, WatchDescriptor>,
	}

	impl InotifyBackend {
		/// Initializes inotify and spawns the stream forwarder. Must run
		/// inside a Tokio runtime with I/O enabled.
		pub(crate) fn new(
		) -> Result<(Self, mpsc::UnboundedReceiver<InotifyItem>), WatcherError> {
			let inotify = Inotify::init().map_err(WatcherError::InotifyInit)?;
			let watches = inotify.watches();
			let mut stream = inotify
				.into_event_stream(vec![0u8; 4096])
				.map_err(WatcherError::InotifyInit)?;
			let (tx, rx) = mpsc::unbounded_channel();
			tokio::spawn(async move {
				while let Some(item) = stream.next().await {
					if tx.send(item).is_err() {
						// Engine is gone; dropping the stream closes the fd
						// and releases every kernel watch at once.
						break;
					}
				}
			});
			Ok((
				Self {
					watches,
					wd_to_path: HashMap::new(),
					path_to_wd: HashMap::new(),
				},
				rx,
			))
		}

		pub(crate) fn add(&mut self, path: &Path) -> Result<(), WatcherError> {
			// Register for almost everything; filtering happens per event.
			let mask = WatchMask::CREATE
				| WatchMask::DELETE
				| WatchMask::DELETE_SELF
				| WatchMask::MOVE
				| WatchMask::MOVE_SELF
				| WatchMask::MODIFY
				| WatchMask::ATTRIB
				| WatchMask::DONT_FOLLOW;
			match self.watches.add(path, mask) {
				Ok(wd) => {
					trace!("inotify watching {}", path.display());
					self.wd_to_path.insert(wd.clone(), path.to_path_buf());
					self.path_to_wd.insert(path.to_path_buf(), wd);
					Ok(())
				}
				Err(source) if source.raw_os_error() == Some(libc::ENOSPC) => {
					let err = WatcherError::WatchLimit {
						path: path.to_path_buf(),
						source,
					};
					warn!("{err}");
					Err(err)
				}
				Err(source) => {
					let err = WatcherError::WatchFailed {
						path: path.to_path_buf(),
						source,
					};
					debug!("{err}");
					Err(err)
				}
			}
		}

		pub(crate) fn remove(&mut self, path: &Path) {
			if let Some(wd) = self.path_to_wd.remove(path) {
				self.wd_to_path.remove(&wd);
				if let Err(err) = self.watches.remove(wd) {
					debug!("failed to remove inotify watch for {}: {err}", path.display());
				}
			}
		}

		/// Drops the descriptor bookkeeping without telling the kernel, for
		/// watches the kernel already dropped (`DELETE_SELF`) or that point
		/// at an inode the path no longer names (a move).
		pub(crate) fn forget(&mut self, path: &Path) {
			if let Some(wd) = self.path_to_wd.remove(path) {
				self.wd_to_path.remove(&wd);
			}
		}

		pub(crate) fn is_watched(&self, path: &Path) -> bool {
			self.path_to_wd.contains_key(path)
		}

		pub(crate) fn path_for(&self, wd: &WatchDescriptor) -> Option<&PathBuf> {
			self.wd_to_path.get(wd)
		}
	}
}

#[cfg(not(target_os = "linux"))]
mod unsupported {
	use std::path::Path;

	use tokio::sync::mpsc;

	use crate::error::WatcherError;

	/// Never constructed; lets the engine keep a single event-loop shape.
	pub(crate) enum InotifyItem {}

	pub(crate) struct InotifyBackend;

	impl InotifyBackend {
		pub(crate) fn new(
		) -> Result<(Self, mpsc::UnboundedReceiver<InotifyItem>), WatcherError> {
			Err(WatcherError::InotifyUnsupported)
		}

		pub(crate) fn add(&mut self, _path: &Path) -> Result<(), WatcherError> {
			Err(WatcherError::InotifyUnsupported)
		}

		pub(crate) fn remove(&mut self, _path: &Path) {}

		pub(crate) fn forget(&mut self, _path: &Path) {}

		pub(crate) fn is_watched(&self, _path: &Path) -> bool {
			false
		}
	}
}
