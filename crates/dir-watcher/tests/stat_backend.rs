//! The same core flows forced onto the polling backend.

use std::fs;
use std::time::Duration;

use dir_watcher::{DirWatcher, EventKind, Method, WatchModes};
use tokio::time::sleep;
use utils::{append, assert_quiet, collect_events, expect_event, fast_config, touch};

mod utils;

fn watcher() -> DirWatcher {
	DirWatcher::with_config(fast_config(Method::Stat))
}

#[tokio::test]
async fn polling_detects_file_changes() {
	let dir = tempfile::tempdir().unwrap();
	let root = dir.path().canonicalize().unwrap();
	let file = root.join("f");
	fs::write(&file, b"one").unwrap();

	let mut watcher = watcher();
	watcher.add_file(&file);
	assert!(watcher.contains(&file).await);

	append(&file, b"two");
	expect_event(&mut watcher, EventKind::Changed, &file).await;
}

#[tokio::test]
async fn polling_detects_identity_change_on_replacement() {
	let dir = tempfile::tempdir().unwrap();
	let root = dir.path().canonicalize().unwrap();
	let file = root.join("f");
	fs::write(&file, b"one").unwrap();

	let mut watcher = watcher();
	watcher.add_file(&file);
	assert!(watcher.contains(&file).await);

	// atomic replacement: the new inode must be noticed even though the
	// name never disappears
	let staging = root.join("f.new");
	fs::write(&staging, b"one").unwrap();
	fs::rename(&staging, &file).unwrap();

	loop {
		let event = tokio::time::timeout(Duration::from_secs(10), watcher.next_event())
			.await
			.expect("timed out waiting for replacement")
			.expect("event channel closed");
		if event.path != file {
			continue;
		}
		match event.kind {
			EventKind::Deleted => continue,
			EventKind::Created | EventKind::Changed => break,
		}
	}

	// modifications of the replacement keep flowing
	let _ = collect_events(&mut watcher, Duration::from_millis(400)).await;
	append(&file, b"three");
	expect_event(&mut watcher, EventKind::Changed, &file).await;
}

#[tokio::test]
async fn polling_promotes_missing_paths() {
	let dir = tempfile::tempdir().unwrap();
	let root = dir.path().canonicalize().unwrap();
	let sub = root.join("sub");

	let mut watcher = watcher();
	watcher.add_dir(&sub, WatchModes::empty());
	assert!(watcher.contains(&sub).await);

	fs::create_dir(&sub).unwrap();
	expect_event(&mut watcher, EventKind::Created, &sub).await;
}

#[tokio::test]
async fn stopped_directory_discards_events() {
	let dir = tempfile::tempdir().unwrap();
	let root = dir.path().canonicalize().unwrap();

	let mut watcher = watcher();
	watcher.add_dir(&root, WatchModes::empty());
	assert!(watcher.contains(&root).await);
	assert!(watcher.stop_dir_scan(&root).await);

	touch(&root.join("x"));
	sleep(Duration::from_millis(400)).await;
	assert_quiet(&mut watcher, Duration::from_millis(300)).await;

	assert!(watcher.restart_dir_scan(&root).await);
	assert_quiet(&mut watcher, Duration::from_millis(300)).await;

	touch(&root.join("y"));
	expect_event(&mut watcher, EventKind::Changed, &root).await;
}

#[tokio::test]
async fn internal_method_reports_polling() {
	let watcher = watcher();
	assert_eq!(watcher.internal_method().await, Method::Stat);
}
