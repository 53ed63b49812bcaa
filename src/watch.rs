//! Filesystem change fan-out.
//!
//! One recursive watcher feeds a [`WatchHub`], which forwards each event to
//! every subscriber whose path prefix contains the changed path. Dropping a
//! [`Subscription`] detaches it.

use crate::error::Result;
use notify::event::{EventKind, ModifyKind};
use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tracing::{debug, error, info};

/// What happened to a path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsEventKind {
    Created,
    Modified,
    Renamed,
    Removed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FsEvent {
    pub kind: FsEventKind,
    pub path: PathBuf,
}

struct Subscriber {
    id: u64,
    prefix: PathBuf,
    tx: mpsc::UnboundedSender<FsEvent>,
}

/// Publish/subscribe hub for filesystem events
#[derive(Default)]
pub struct WatchHub {
    subscribers: Mutex<Vec<Subscriber>>,
    next_id: AtomicU64,
}

impl WatchHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Receive every event at or below `prefix`
    pub fn subscribe(self: &Arc<Self>, prefix: impl Into<PathBuf>) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.lock().push(Subscriber {
            id,
            prefix: prefix.into(),
            tx,
        });

        Subscription {
            guard: SubscriptionGuard {
                id,
                hub: Arc::downgrade(self),
            },
            rx,
        }
    }

    /// Deliver an event to the interested subscribers
    pub fn publish(&self, event: FsEvent) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|s| !s.tx.is_closed());
        for subscriber in subscribers.iter() {
            if event.path.starts_with(&subscriber.prefix) {
                let _ = subscriber.tx.send(event.clone());
            }
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    fn unsubscribe(&self, id: u64) {
        self.subscribers.lock().retain(|s| s.id != id);
    }
}

/// Handle on a hub registration
pub struct Subscription {
    guard: SubscriptionGuard,
    rx: mpsc::UnboundedReceiver<FsEvent>,
}

impl Subscription {
    /// Next event, or `None` once the hub is gone
    pub async fn recv(&mut self) -> Option<FsEvent> {
        self.rx.recv().await
    }

    /// Separate the registration from the event stream, so the owner can
    /// detach while a task is still reading.
    pub fn split(self) -> (SubscriptionGuard, mpsc::UnboundedReceiver<FsEvent>) {
        (self.guard, self.rx)
    }
}

/// Keeps a subscription registered; dropping it detaches from the hub and
/// closes the event stream.
pub struct SubscriptionGuard {
    id: u64,
    hub: Weak<WatchHub>,
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        if let Some(hub) = self.hub.upgrade() {
            hub.unsubscribe(self.id);
        }
    }
}

fn classify(kind: &EventKind) -> Option<FsEventKind> {
    match kind {
        EventKind::Create(_) => Some(FsEventKind::Created),
        EventKind::Modify(ModifyKind::Name(_)) => Some(FsEventKind::Renamed),
        EventKind::Modify(_) => Some(FsEventKind::Modified),
        EventKind::Remove(_) => Some(FsEventKind::Removed),
        _ => None,
    }
}

/// Watch `root` recursively and publish its events into `hub`.
/// The returned watcher stops when dropped.
pub fn watch_tree(root: &Path, hub: Arc<WatchHub>) -> Result<RecommendedWatcher> {
    let mut watcher = RecommendedWatcher::new(
        move |res: notify::Result<Event>| match res {
            Ok(event) => {
                let Some(kind) = classify(&event.kind) else {
                    return;
                };
                for path in event.paths {
                    debug!(?kind, path = %path.display(), "filesystem event");
                    hub.publish(FsEvent { kind, path });
                }
            }
            Err(e) => error!("Watch error: {:?}", e),
        },
        Config::default(),
    )?;

    watcher.watch(root, RecursiveMode::Recursive)?;
    info!(path = %root.display(), "filesystem watcher started");

    Ok(watcher)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::tempdir;
    use tokio::time::timeout;

    fn event(kind: FsEventKind, path: &str) -> FsEvent {
        FsEvent {
            kind,
            path: PathBuf::from(path),
        }
    }

    #[tokio::test]
    async fn test_publish_by_prefix() {
        let hub = WatchHub::new();
        let mut ssl = hub.subscribe("/data/domains/a.com/ssl");
        let mut domains = hub.subscribe("/data/domains");

        hub.publish(event(FsEventKind::Modified, "/data/domains/a.com/ssl/cert.pem"));
        hub.publish(event(FsEventKind::Created, "/data/domains/b.com"));

        assert_eq!(ssl.recv().await.unwrap().path, PathBuf::from("/data/domains/a.com/ssl/cert.pem"));
        assert_eq!(domains.recv().await.unwrap().kind, FsEventKind::Modified);
        assert_eq!(domains.recv().await.unwrap().path, PathBuf::from("/data/domains/b.com"));

        // b.com is outside the ssl prefix
        assert!(timeout(Duration::from_millis(50), ssl.recv()).await.is_err());
    }

    #[test]
    fn test_prefix_matches_whole_components() {
        let hub = WatchHub::new();
        let mut sub = hub.subscribe("/data/domains/a.com");
        hub.publish(event(FsEventKind::Created, "/data/domains/a.com.evil/file"));
        assert!(sub.rx.try_recv().is_err());
    }

    #[test]
    fn test_drop_unsubscribes() {
        let hub = WatchHub::new();
        let first = hub.subscribe("/x");
        let _second = hub.subscribe("/y");
        assert_eq!(hub.subscriber_count(), 2);

        drop(first);
        assert_eq!(hub.subscriber_count(), 1);
    }

    #[tokio::test]
    async fn test_dropping_guard_closes_stream() {
        let hub = WatchHub::new();
        let (guard, mut rx) = hub.subscribe("/x").split();

        drop(guard);
        assert_eq!(hub.subscriber_count(), 0);
        assert!(rx.recv().await.is_none());
    }

    #[test]
    fn test_classify_events() {
        use notify::event::{CreateKind, DataChange, RemoveKind, RenameMode};

        assert_eq!(classify(&EventKind::Create(CreateKind::Folder)), Some(FsEventKind::Created));
        assert_eq!(
            classify(&EventKind::Modify(ModifyKind::Data(DataChange::Any))),
            Some(FsEventKind::Modified)
        );
        assert_eq!(
            classify(&EventKind::Modify(ModifyKind::Name(RenameMode::From))),
            Some(FsEventKind::Renamed)
        );
        assert_eq!(classify(&EventKind::Remove(RemoveKind::Folder)), Some(FsEventKind::Removed));
        assert_eq!(classify(&EventKind::Access(notify::event::AccessKind::Any)), None);
    }

    #[tokio::test]
    async fn test_watch_tree_publishes_changes() {
        let dir = tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();
        let hub = WatchHub::new();
        let mut sub = hub.subscribe(&root);
        let _watcher = watch_tree(&root, hub.clone()).unwrap();

        std::fs::create_dir(root.join("fresh")).unwrap();

        let event = timeout(Duration::from_secs(5), sub.recv()).await.unwrap().unwrap();
        assert!(event.path.starts_with(&root));
    }
}
