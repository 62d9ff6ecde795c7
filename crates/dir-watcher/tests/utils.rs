#![allow(dead_code)]

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::time::Duration;

use dir_watcher::{DirWatcher, EventKind, Method, WatchEvent, WatcherConfig};
use tokio::time::timeout;

/// All tests in one binary must use the same configuration: watchers created
/// on the same thread share one engine, and only the first creation applies
/// its configuration.
pub fn fast_config(preferred: Method) -> WatcherConfig {
	WatcherConfig {
		poll_interval_ms: 100,
		nfs_poll_interval_ms: 5000,
		preferred_method: preferred,
		nfs_preferred_method: Method::Stat,
	}
}

/// Waits until `kind` fires for `path`, skipping unrelated events.
pub async fn expect_event(watcher: &mut DirWatcher, kind: EventKind, path: &Path) {
	loop {
		match timeout(Duration::from_secs(10), watcher.next_event()).await {
			Ok(Some(event)) => {
				if event.kind == kind && event.path == path {
					return;
				}
			}
			Ok(None) => panic!(
				"event channel closed while waiting for {kind:?} on {}",
				path.display()
			),
			Err(_) => panic!("timed out waiting for {kind:?} on {}", path.display()),
		}
	}
}

/// Collects events until the watcher has been quiet for `quiet`.
pub async fn collect_events(watcher: &mut DirWatcher, quiet: Duration) -> Vec<WatchEvent> {
	let mut events = Vec::new();
	while let Ok(Some(event)) = timeout(quiet, watcher.next_event()).await {
		events.push(event);
	}
	events
}

/// Asserts that nothing at all arrives within `window`.
pub async fn assert_quiet(watcher: &mut DirWatcher, window: Duration) {
	if let Ok(Some(event)) = timeout(window, watcher.next_event()).await {
		panic!("expected no events, got {event:?}");
	}
}

/// Appends to a file and syncs, so the change hits the filesystem before the
/// test starts waiting.
pub fn append(path: &Path, data: &[u8]) {
	let mut file = OpenOptions::new()
		.append(true)
		.open(path)
		.expect("failed to open file for append");
	file.write_all(data).expect("failed to append");
	file.sync_all().expect("failed to sync");
}

/// Creates an empty file without writing any content.
pub fn touch(path: &Path) {
	fs::File::create(path).expect("failed to create file");
}
