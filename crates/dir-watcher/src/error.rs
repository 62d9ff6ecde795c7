//! Error types for the notification backends.
//!
//! None of these reach the public API as `Result`s: the engine is best-effort
//! and falls back to the next backend when one refuses a path. They exist so
//! the fallback sites can log a precise reason.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while attaching a backend to a path.
#[derive(Debug, Error)]
pub enum WatcherError {
	/// The inotify file descriptor could not be created.
	#[error("failed to initialize inotify: {0}")]
	InotifyInit(#[source] io::Error),

	/// Native inode notification does not exist on this platform.
	#[error("inotify is not supported on this platform")]
	InotifyUnsupported,

	/// The per-user inotify watch limit is exhausted.
	#[error(
		"inotify watch limit reached for {path}: raise fs.inotify.max_user_watches \
		 (e.g. via an fs.inotify.max_user_watches entry in /etc/sysctl.conf)"
	)]
	WatchLimit {
		path: PathBuf,
		#[source]
		source: io::Error,
	},

	/// `inotify_add_watch` failed for a reason other than the watch limit.
	#[error("failed to add inotify watch for {path}: {source}")]
	WatchFailed {
		path: PathBuf,
		#[source]
		source: io::Error,
	},

	/// The platform watcher primitive could not be created.
	#[error("failed to initialize the platform watcher: {0}")]
	PlatformInit(#[source] notify::Error),

	/// The platform watcher refused the path.
	#[error("failed to watch {path} with the platform watcher: {source}")]
	PlatformWatch {
		path: PathBuf,
		#[source]
		source: notify::Error,
	},
}
