//! Directory and file change notification.
//!
//! `dir-watcher` lets many independent watcher handles register interest in
//! filesystem paths — files or directories, existing or not yet — and
//! receive `Created`, `Changed` and `Deleted` events for them. Three
//! detection strategies hide behind one contract:
//!
//! - **INotify**: the native inode notification stream (Linux)
//! - **Generic**: the platform watcher primitive, reclassified by stat
//! - **Stat**: periodic polling with per-path cadence and network-mount
//!   pacing
//!
//! # Architecture
//!
//! One engine task per thread owns the entry table and the backends; all
//! watchers created on that thread share it, so registering the same path
//! from several places costs a single kernel watch. Paths that do not exist
//! yet are parked on their nearest existing ancestor and promoted — with a
//! `Created` event — the moment they appear, including across atomic
//! rename-over replacements.
//!
//! # Example
//!
//! ```ignore
//! use dir_watcher::{DirWatcher, EventKind, WatchModes};
//!
//! #[tokio::main]
//! async fn main() {
//!     let mut watcher = DirWatcher::new();
//!     watcher.add_dir("/etc", WatchModes::empty());
//!     watcher.add_file("/etc/hosts");
//!
//!     while let Some(event) = watcher.next_event().await {
//!         match event.kind {
//!             EventKind::Created => println!("created: {}", event.path.display()),
//!             EventKind::Changed => println!("changed: {}", event.path.display()),
//!             EventKind::Deleted => println!("deleted: {}", event.path.display()),
//!         }
//!     }
//! }
//! ```

mod backend;
mod config;
mod engine;
mod entry;
mod error;
mod event;
mod fs_type;
mod watcher;

pub use config::{Method, WatcherConfig};
pub use error::WatcherError;
pub use event::{EventKind, WatchEvent, WatchModes};
pub use watcher::DirWatcher;
