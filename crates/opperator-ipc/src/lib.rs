pub mod client;
pub mod conn;
pub mod registry;
pub mod watcher;

pub use client::{IpcClient, Request, Subscription};
pub use registry::DaemonRegistry;
pub use watcher::{DaemonEvent, DaemonEventKind, MultiDaemonWatcher};
