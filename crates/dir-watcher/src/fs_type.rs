//! Filesystem-class probe.
//!
//! Network-mounted paths get a slower poll cadence and may use a different
//! preferred backend, since inode notification cannot see changes made by
//! other machines.

use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FsClass {
	Local,
	Network,
}

#[cfg(target_os = "linux")]
pub(crate) fn classify(path: &Path) -> FsClass {
	use nix::sys::statfs::{statfs, FsType, NFS_SUPER_MAGIC, SMB_SUPER_MAGIC};

	// Not exported by this version of `nix`; value per the Linux kernel's magic.h.
	const CIFS_MAGIC_NUMBER: FsType = FsType(0xFF53_4D42);

	match statfs(path) {
		Ok(fs) => {
			let fs_type = fs.filesystem_type();
			if fs_type == NFS_SUPER_MAGIC
				|| fs_type == SMB_SUPER_MAGIC
				|| fs_type == CIFS_MAGIC_NUMBER
			{
				FsClass::Network
			} else {
				FsClass::Local
			}
		}
		// Non-existent paths are polled at the local cadence until they appear.
		Err(_) => FsClass::Local,
	}
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn classify(_path: &Path) -> FsClass {
	FsClass::Local
}
