//! Stat probing for the polling backend and for scan classification.
//!
//! Timestamps are the maximum of the change and modify times so that every
//! content-affecting change moves the tracked value, regardless of which
//! field a platform updates. Nanosecond precision is kept where the
//! filesystem provides it; second-granularity timestamps would miss rapid
//! rewrite cycles.

use std::fs;
use std::path::Path;

/// The identity of a path at one observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Identity {
	pub ctime_ns: i64,
	pub ino: u64,
	pub nlink: u64,
	pub is_dir: bool,
}

/// Stats the path, following symlinks. `None` means the path is missing or
/// the stat failed transiently; both are treated as non-existent.
pub(crate) fn probe(path: &Path) -> Option<Identity> {
	let meta = fs::metadata(path).ok()?;
	Some(identity_of(&meta))
}

pub(crate) fn is_symlink(path: &Path) -> bool {
	fs::symlink_metadata(path)
		.map(|meta| meta.file_type().is_symlink())
		.unwrap_or(false)
}

#[cfg(unix)]
fn identity_of(meta: &fs::Metadata) -> Identity {
	use std::os::unix::fs::MetadataExt;

	let ctime = meta.ctime() * 1_000_000_000 + meta.ctime_nsec();
	let mtime = meta.mtime() * 1_000_000_000 + meta.mtime_nsec();
	Identity {
		ctime_ns: ctime.max(mtime),
		ino: meta.ino(),
		nlink: meta.nlink(),
		is_dir: meta.is_dir(),
	}
}

#[cfg(not(unix))]
fn identity_of(meta: &fs::Metadata) -> Identity {
	use std::time::UNIX_EPOCH;

	let stamp = |time: std::io::Result<std::time::SystemTime>| {
		time.ok()
			.and_then(|t| t.duration_since(UNIX_EPOCH).ok())
			.map(|d| d.as_nanos() as i64)
			.unwrap_or(0)
	};
	let modified = stamp(meta.modified());
	let created = stamp(meta.created());
	Identity {
		ctime_ns: modified.max(created),
		ino: 0,
		nlink: 0,
		is_dir: meta.is_dir(),
	}
}
