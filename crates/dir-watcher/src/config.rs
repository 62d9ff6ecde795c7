//! Engine configuration.
//!
//! An engine reads its configuration from the environment when the first
//! watcher on a thread is created; tests and embedders can pass an explicit
//! [`WatcherConfig`] instead via [`DirWatcher::with_config`].
//!
//! [`DirWatcher::with_config`]: crate::DirWatcher::with_config

use std::env;
use std::fmt;

use tracing::warn;

pub(crate) const ENV_POLL_INTERVAL: &str = "DIR_WATCHER_POLL_INTERVAL";
pub(crate) const ENV_NFS_POLL_INTERVAL: &str = "DIR_WATCHER_NFS_POLL_INTERVAL";
pub(crate) const ENV_METHOD: &str = "DIR_WATCHER_METHOD";
pub(crate) const ENV_NFS_METHOD: &str = "DIR_WATCHER_NFS_METHOD";

const DEFAULT_POLL_INTERVAL_MS: u64 = 500;
const DEFAULT_NFS_POLL_INTERVAL_MS: u64 = 5000;

/// A change-detection strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
	/// Native inode notification (Linux kernel event stream).
	INotify,
	/// The generic platform watcher primitive.
	Generic,
	/// Periodic polling by stat.
	Stat,
}

impl Method {
	/// The best method this build can offer.
	pub(crate) fn default_preferred() -> Self {
		if cfg!(target_os = "linux") {
			Method::INotify
		} else {
			Method::Generic
		}
	}

	fn parse(value: &str) -> Option<Self> {
		match value.to_ascii_lowercase().as_str() {
			"inotify" => Some(Method::INotify),
			"generic" => Some(Method::Generic),
			"stat" => Some(Method::Stat),
			_ => None,
		}
	}
}

impl fmt::Display for Method {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(match self {
			Method::INotify => "INotify",
			Method::Generic => "Generic",
			Method::Stat => "Stat",
		})
	}
}

/// Tunables shared by every watcher bound to one engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatcherConfig {
	/// Stat poll period for local paths, in milliseconds.
	pub poll_interval_ms: u64,
	/// Stat poll period for network-mounted paths, in milliseconds.
	pub nfs_poll_interval_ms: u64,
	/// Preferred backend for local paths.
	pub preferred_method: Method,
	/// Preferred backend for network-mounted paths.
	pub nfs_preferred_method: Method,
}

impl Default for WatcherConfig {
	fn default() -> Self {
		Self {
			poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
			nfs_poll_interval_ms: DEFAULT_NFS_POLL_INTERVAL_MS,
			preferred_method: Method::default_preferred(),
			nfs_preferred_method: Method::Stat,
		}
	}
}

impl WatcherConfig {
	/// Builds a configuration from the `DIR_WATCHER_*` environment variables,
	/// falling back to the defaults for anything unset or unparsable.
	pub fn from_env() -> Self {
		Self {
			poll_interval_ms: ms_from_env(ENV_POLL_INTERVAL, DEFAULT_POLL_INTERVAL_MS),
			nfs_poll_interval_ms: ms_from_env(ENV_NFS_POLL_INTERVAL, DEFAULT_NFS_POLL_INTERVAL_MS),
			preferred_method: method_from_env(ENV_METHOD, Method::default_preferred()),
			nfs_preferred_method: method_from_env(ENV_NFS_METHOD, Method::Stat),
		}
	}
}

fn ms_from_env(name: &str, default: u64) -> u64 {
	match env::var(name) {
		Ok(value) => match value.parse::<u64>() {
			Ok(ms) if ms > 0 => ms,
			_ => {
				warn!("ignoring invalid {name}={value}; using {default} ms");
				default
			}
		},
		Err(_) => default,
	}
}

fn method_from_env(name: &str, default: Method) -> Method {
	match env::var(name) {
		Ok(value) => Method::parse(&value).unwrap_or_else(|| {
			warn!("ignoring unknown {name}={value}; using {default}");
			default
		}),
		Err(_) => default,
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn method_parsing_is_case_insensitive() {
		assert_eq!(Method::parse("Stat"), Some(Method::Stat));
		assert_eq!(Method::parse("inotify"), Some(Method::INotify));
		assert_eq!(Method::parse("GENERIC"), Some(Method::Generic));
		assert_eq!(Method::parse("fam"), None);
	}

	#[test]
	fn env_overrides_are_picked_up() {
		env::set_var(ENV_POLL_INTERVAL, "250");
		env::set_var(ENV_NFS_METHOD, "generic");
		let config = WatcherConfig::from_env();
		assert_eq!(config.poll_interval_ms, 250);
		assert_eq!(config.nfs_preferred_method, Method::Generic);
		env::remove_var(ENV_POLL_INTERVAL);
		env::remove_var(ENV_NFS_METHOD);
	}

	#[test]
	fn invalid_values_fall_back_to_defaults() {
		env::set_var(ENV_NFS_POLL_INTERVAL, "soon");
		let config = WatcherConfig::from_env();
		assert_eq!(config.nfs_poll_interval_ms, DEFAULT_NFS_POLL_INTERVAL_MS);
		env::remove_var(ENV_NFS_POLL_INTERVAL);
	}
}
