//! End-to-end behavior with the default (native) backend, falling back to
//! the platform watcher where inotify does not exist.

use std::fs;
use std::time::Duration;

use dir_watcher::{DirWatcher, EventKind, Method, WatchModes};
use tokio::time::sleep;
use utils::{append, assert_quiet, collect_events, expect_event, fast_config, touch};

mod utils;

fn watcher() -> DirWatcher {
	DirWatcher::with_config(fast_config(Method::INotify))
}

#[tokio::test]
async fn directory_reports_change_when_file_created() {
	let dir = tempfile::tempdir().unwrap();
	let root = dir.path().canonicalize().unwrap();

	let mut watcher = watcher();
	watcher.add_dir(&root, WatchModes::empty());
	assert!(watcher.contains(&root).await);

	touch(&root.join("a.txt"));
	expect_event(&mut watcher, EventKind::Changed, &root).await;

	// directory-only mode never reports the child itself
	let rest = collect_events(&mut watcher, Duration::from_millis(600)).await;
	assert!(
		rest.iter().all(|e| e.kind != EventKind::Created),
		"unexpected creation events: {rest:?}"
	);
}

#[tokio::test]
async fn modified_file_reports_single_change() {
	let dir = tempfile::tempdir().unwrap();
	let root = dir.path().canonicalize().unwrap();
	let file = root.join("e");
	fs::write(&file, b"foo").unwrap();

	let mut watcher = watcher();
	watcher.add_file(&file);
	assert!(watcher.contains(&file).await);

	append(&file, b"bar");

	let events = collect_events(&mut watcher, Duration::from_millis(800)).await;
	assert_eq!(events.len(), 1, "expected exactly one event: {events:?}");
	assert_eq!(events[0].kind, EventKind::Changed);
	assert_eq!(events[0].path, file);
}

#[tokio::test]
async fn deleted_and_recreated_file_keeps_reporting() {
	let dir = tempfile::tempdir().unwrap();
	let root = dir.path().canonicalize().unwrap();
	fs::create_dir(root.join("s")).unwrap();
	let file = root.join("s").join("1");
	fs::write(&file, b"data").unwrap();

	let mut watcher = watcher();
	watcher.add_file(&file);
	assert!(watcher.contains(&file).await);

	for _ in 0..5 {
		fs::remove_file(&file).unwrap();
		fs::write(&file, b"data").unwrap();

		// each cycle must surface as delete-then-create or as a single change
		loop {
			let event = tokio::time::timeout(Duration::from_secs(10), watcher.next_event())
				.await
				.expect("timed out waiting for recreation cycle")
				.expect("event channel closed");
			if event.path != file {
				continue;
			}
			match event.kind {
				EventKind::Deleted => continue,
				EventKind::Created | EventKind::Changed => break,
			}
		}
	}

	let _ = collect_events(&mut watcher, Duration::from_millis(400)).await;
	append(&file, b"more");
	expect_event(&mut watcher, EventKind::Changed, &file).await;
}

#[tokio::test]
async fn nonexistent_paths_fire_created_on_appearance() {
	let dir = tempfile::tempdir().unwrap();
	let root = dir.path().canonicalize().unwrap();
	let sub = root.join("sub");

	let mut watcher = watcher();
	watcher.add_dir(&sub, WatchModes::empty());
	assert!(watcher.contains(&sub).await);

	fs::create_dir(&sub).unwrap();
	expect_event(&mut watcher, EventKind::Created, &sub).await;

	let file = sub.join("0");
	watcher.add_file(&file);
	assert!(watcher.contains(&file).await);

	touch(&file);
	expect_event(&mut watcher, EventKind::Created, &file).await;

	let _ = collect_events(&mut watcher, Duration::from_millis(400)).await;
	append(&file, b"content");
	expect_event(&mut watcher, EventKind::Changed, &file).await;
}

// The whole-chain promotion within one pass relies on the native backend's
// child-creation events; the generic fallback only notices single levels.
#[cfg(target_os = "linux")]
#[tokio::test]
async fn missing_ancestor_chain_promotes_exactly_once() {
	let dir = tempfile::tempdir().unwrap();
	let root = dir.path().canonicalize().unwrap();
	let leaf = root.join("a").join("b").join("c");

	let mut watcher = watcher();
	watcher.add_file(&leaf);
	assert!(watcher.contains(&leaf).await);

	fs::create_dir_all(root.join("a").join("b")).unwrap();
	fs::write(&leaf, b"x").unwrap();

	expect_event(&mut watcher, EventKind::Created, &leaf).await;
	let rest = collect_events(&mut watcher, Duration::from_millis(800)).await;
	assert!(
		rest.iter()
			.all(|e| !(e.kind == EventKind::Created && e.path == leaf)),
		"leaf creation reported more than once: {rest:?}"
	);
}

#[tokio::test]
async fn atomic_rename_preserves_file_watch() {
	let dir = tempfile::tempdir().unwrap();
	let root = dir.path().canonicalize().unwrap();
	let target = root.join("m");
	fs::write(&target, b"old").unwrap();

	let mut watcher = watcher();
	watcher.add_dir(&root, WatchModes::empty());
	watcher.add_file(&target);
	assert!(watcher.contains(&target).await);

	let staging = root.join("tmp");
	fs::write(&staging, b"new").unwrap();
	fs::remove_file(&target).unwrap();
	fs::rename(&staging, &target).unwrap();

	expect_event(&mut watcher, EventKind::Changed, &root).await;

	// the watch must have survived the swap
	let _ = collect_events(&mut watcher, Duration::from_millis(600)).await;
	append(&target, b"!");
	expect_event(&mut watcher, EventKind::Changed, &target).await;
}

#[tokio::test]
async fn restart_does_not_replay_missed_events() {
	let dir = tempfile::tempdir().unwrap();
	let root = dir.path().canonicalize().unwrap();

	let mut watcher = watcher();
	watcher.add_dir(&root, WatchModes::empty());
	assert!(watcher.contains(&root).await);
	assert!(watcher.stop_dir_scan(&root).await);

	touch(&root.join("2"));
	sleep(Duration::from_millis(300)).await;
	assert_quiet(&mut watcher, Duration::from_millis(300)).await;

	assert!(watcher.restart_dir_scan(&root).await);
	assert_quiet(&mut watcher, Duration::from_millis(300)).await;

	touch(&root.join("3"));
	expect_event(&mut watcher, EventKind::Changed, &root).await;
}

#[tokio::test]
async fn balanced_add_remove_forgets_path() {
	let dir = tempfile::tempdir().unwrap();
	let root = dir.path().canonicalize().unwrap();

	let watcher = watcher();
	for _ in 0..3 {
		watcher.add_dir(&root, WatchModes::empty());
	}
	assert!(watcher.contains(&root).await);

	watcher.remove_dir(&root);
	watcher.remove_dir(&root);
	assert!(watcher.contains(&root).await);

	watcher.remove_dir(&root);
	assert!(!watcher.contains(&root).await);

	// removal is idempotent once the registration is gone
	watcher.remove_dir(&root);
	assert!(!watcher.contains(&root).await);
}

// Child creation events require a backend with child notification.
#[cfg(target_os = "linux")]
#[tokio::test]
async fn watch_modes_route_child_events() {
	let dir = tempfile::tempdir().unwrap();
	let root = dir.path().canonicalize().unwrap();
	let with_files = root.join("with_files");
	let dir_only = root.join("dir_only");
	fs::create_dir(&with_files).unwrap();
	fs::create_dir(&dir_only).unwrap();

	let mut watcher = watcher();
	watcher.add_dir(&with_files, WatchModes::FILES);
	watcher.add_dir(&dir_only, WatchModes::empty());
	assert!(watcher.contains(&dir_only).await);

	let file = with_files.join("f");
	touch(&file);
	expect_event(&mut watcher, EventKind::Created, &file).await;
	expect_event(&mut watcher, EventKind::Changed, &with_files).await;
	let _ = collect_events(&mut watcher, Duration::from_millis(400)).await;

	touch(&dir_only.join("f"));
	let events = collect_events(&mut watcher, Duration::from_millis(600)).await;
	assert!(
		events
			.iter()
			.any(|e| e.kind == EventKind::Changed && e.path == dir_only),
		"missing directory change: {events:?}"
	);
	assert!(
		events
			.iter()
			.all(|e| e.kind == EventKind::Changed && e.path == dir_only),
		"directory-only mode leaked child events: {events:?}"
	);
}

#[tokio::test]
async fn removing_watch_during_dispatch_is_safe() {
	let dir = tempfile::tempdir().unwrap();
	let root = dir.path().canonicalize().unwrap();

	let mut watcher = watcher();
	watcher.add_dir(&root, WatchModes::empty());
	assert!(watcher.contains(&root).await);

	touch(&root.join("first"));
	expect_event(&mut watcher, EventKind::Changed, &root).await;

	// removing the signaled path while handling its event must be safe
	watcher.remove_dir(&root);
	assert!(!watcher.contains(&root).await);

	touch(&root.join("second"));
	assert_quiet(&mut watcher, Duration::from_millis(500)).await;

	// and the engine must still be fully operational afterwards
	watcher.add_dir(&root, WatchModes::empty());
	assert!(watcher.contains(&root).await);
	touch(&root.join("third"));
	expect_event(&mut watcher, EventKind::Changed, &root).await;
}

#[tokio::test]
async fn ctime_reports_known_state_only() {
	let dir = tempfile::tempdir().unwrap();
	let root = dir.path().canonicalize().unwrap();
	let file = root.join("f");
	fs::write(&file, b"x").unwrap();

	let watcher = watcher();
	watcher.add_file(&file);
	assert!(watcher.contains(&file).await);
	assert!(watcher.ctime(&file).await.is_some());
	assert!(watcher.ctime(root.join("unknown")).await.is_none());
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn internal_method_prefers_native_backend() {
	let watcher = watcher();
	assert_eq!(watcher.internal_method().await, Method::INotify);
}
