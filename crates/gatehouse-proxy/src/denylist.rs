//! File-backed denylist, re-read on a polling interval.
//!
//! The file is YAML. Each entry denies a single entity, either a client
//! IP or a cluster (tenant id string):
//!
//! ```yaml
//! entries:
//!   - kind: ip
//!     item: "1.2.3.4"
//!     reason: "abuse"
//!   - kind: cluster
//!     item: "42"
//!     reason: "suspended"
//! ```
//!
//! A connection is denied when either its IP or its cluster matches any
//! entry. Live connections register a one-shot callback that fires at
//! most once when a later poll matches their tags. Polling is
//! clock-driven, never file-event driven, which keeps delivery ordering
//! deterministic.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::watch;
use tracing::{debug, warn};

/// Key identifying a connection for denylist purposes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionTags {
    pub ip: String,
    pub cluster: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Ip,
    Cluster,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DenyEntry {
    pub kind: EntityKind,
    pub item: String,
    #[serde(default)]
    pub reason: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct DenyFile {
    #[serde(default)]
    entries: Vec<DenyEntry>,
}

/// The reason a connection was (or is being) denied.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{entity} '{item}' denied: {reason}")]
pub struct Denied {
    pub entity: &'static str,
    pub item: String,
    pub reason: String,
}

/// One-shot notification that a live connection's tags now match.
pub type DeniedCallback = Box<dyn FnOnce(Denied) + Send>;

struct Listener {
    tags: ConnectionTags,
    // Taken on delivery; at most one call per subscription.
    callback: Option<DeniedCallback>,
}

#[derive(Default)]
struct Shared {
    entries: Vec<DenyEntry>,
    listeners: HashMap<u64, Listener>,
    next_id: u64,
}

/// Watches a denylist file and notifies subscribed connections.
#[derive(Clone)]
pub struct Denylist {
    shared: Arc<Mutex<Shared>>,
}

impl Denylist {
    /// A watcher that denies nothing; used when no file is configured.
    pub fn disabled() -> Self {
        Self {
            shared: Arc::new(Mutex::new(Shared::default())),
        }
    }

    /// Watch `path`, re-reading it every `poll_interval` and re-checking
    /// live subscriptions every `validate_interval`. A missing or
    /// malformed file leaves the previous list in place.
    pub fn from_file(
        path: impl Into<PathBuf>,
        poll_interval: Duration,
        validate_interval: Duration,
        mut quiesce: watch::Receiver<bool>,
    ) -> Self {
        let path = path.into();
        let shared = Arc::new(Mutex::new(Shared::default()));

        match load_file(&path) {
            Ok(entries) => shared.lock().unwrap().entries = entries,
            Err(err) => warn!("initial denylist read of {}: {}", path.display(), err),
        }

        let list = Self {
            shared: Arc::clone(&shared),
        };

        // A zero poll interval disables re-reading: the initial list is
        // final.
        if poll_interval.is_zero() {
            return list;
        }
        let validate_interval = if validate_interval.is_zero() {
            poll_interval
        } else {
            validate_interval
        };

        tokio::spawn(async move {
            let mut poll = tokio::time::interval(poll_interval);
            poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            let mut validate = tokio::time::interval(validate_interval);
            validate.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = poll.tick() => {
                        match load_file(&path) {
                            Ok(entries) => {
                                debug!("denylist reloaded, {} entries", entries.len());
                                apply(&shared, Some(entries));
                            }
                            Err(err) => warn!("reading denylist {}: {}", path.display(), err),
                        }
                    }
                    _ = validate.tick() => {
                        // Sweep live subscriptions against the current
                        // list without touching the file.
                        apply(&shared, None);
                    }
                    _ = quiesce.changed() => return,
                }
            }
        });

        list
    }

    /// Register a connection. A synchronous initial match refuses the
    /// connection before any backend work happens; otherwise `on_denied`
    /// fires at most once if a later poll matches.
    pub fn subscribe(
        &self,
        tags: ConnectionTags,
        on_denied: DeniedCallback,
    ) -> Result<Subscription, Denied> {
        let mut shared = self.shared.lock().unwrap();
        if let Some(denied) = match_tags(&shared.entries, &tags) {
            return Err(denied);
        }
        let id = shared.next_id;
        shared.next_id += 1;
        shared.listeners.insert(
            id,
            Listener {
                tags,
                callback: Some(on_denied),
            },
        );
        Ok(Subscription {
            shared: Arc::clone(&self.shared),
            id,
        })
    }

    #[cfg(test)]
    fn install(&self, entries: Vec<DenyEntry>) {
        apply(&self.shared, Some(entries));
    }
}

/// Handle to a registered subscription. Unsubscribing is idempotent and
/// implied by drop.
pub struct Subscription {
    shared: Arc<Mutex<Shared>>,
    id: u64,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

impl Subscription {
    pub fn unsubscribe(&self) {
        self.shared.lock().unwrap().listeners.remove(&self.id);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

/// Swap in a new list (or keep the current one) and fire callbacks for
/// any matching listeners. Callbacks run outside the lock.
fn apply(shared: &Arc<Mutex<Shared>>, entries: Option<Vec<DenyEntry>>) {
    let mut fired: Vec<(DeniedCallback, Denied)> = Vec::new();
    {
        let mut shared = shared.lock().unwrap();
        if let Some(entries) = entries {
            shared.entries = entries;
        }
        let Shared {
            entries, listeners, ..
        } = &mut *shared;
        for listener in listeners.values_mut() {
            if let Some(denied) = match_tags(entries, &listener.tags) {
                if let Some(callback) = listener.callback.take() {
                    fired.push((callback, denied));
                }
            }
        }
    }
    for (callback, denied) in fired {
        callback(denied);
    }
}

fn match_tags(entries: &[DenyEntry], tags: &ConnectionTags) -> Option<Denied> {
    entries.iter().find_map(|entry| match entry.kind {
        EntityKind::Ip if entry.item == tags.ip => Some(Denied {
            entity: "ip",
            item: entry.item.clone(),
            reason: entry.reason.clone(),
        }),
        EntityKind::Cluster if entry.item == tags.cluster => Some(Denied {
            entity: "cluster",
            item: entry.item.clone(),
            reason: entry.reason.clone(),
        }),
        _ => None,
    })
}

fn load_file(path: &PathBuf) -> Result<Vec<DenyEntry>, String> {
    let raw = std::fs::read_to_string(path).map_err(|e| e.to_string())?;
    let file: DenyFile = serde_yaml::from_str(&raw).map_err(|e| e.to_string())?;
    Ok(file.entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn tags(ip: &str, cluster: &str) -> ConnectionTags {
        ConnectionTags {
            ip: ip.into(),
            cluster: cluster.into(),
        }
    }

    fn deny_ip(item: &str) -> DenyEntry {
        DenyEntry {
            kind: EntityKind::Ip,
            item: item.into(),
            reason: "abuse".into(),
        }
    }

    #[test]
    fn test_parse_file_format() {
        let raw = "entries:\n  - kind: ip\n    item: \"1.2.3.4\"\n    reason: abuse\n  - kind: cluster\n    item: \"42\"\n";
        let file: DenyFile = serde_yaml::from_str(raw).unwrap();
        assert_eq!(file.entries.len(), 2);
        assert_eq!(file.entries[0].kind, EntityKind::Ip);
        assert_eq!(file.entries[1].kind, EntityKind::Cluster);
        assert_eq!(file.entries[1].reason, "");
    }

    #[tokio::test]
    async fn test_subscribe_initial_match_is_synchronous() {
        let list = Denylist::disabled();
        list.install(vec![deny_ip("1.2.3.4")]);

        let err = list
            .subscribe(tags("1.2.3.4", "3"), Box::new(|_| panic!("must not fire")))
            .unwrap_err();
        assert_eq!(err.entity, "ip");
        assert!(err.to_string().contains("ip '1.2.3.4' denied: abuse"));
    }

    #[tokio::test]
    async fn test_revocation_fires_at_most_once() {
        let list = Denylist::disabled();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        let sub = list
            .subscribe(
                tags("1.2.3.4", "3"),
                Box::new(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();

        list.install(vec![deny_ip("1.2.3.4")]);
        list.install(vec![deny_ip("1.2.3.4")]);
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        // Unsubscribing after delivery is a no-op, twice over.
        sub.unsubscribe();
        sub.unsubscribe();
    }

    #[tokio::test]
    async fn test_unmatched_listener_does_not_fire() {
        let list = Denylist::disabled();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        let _sub = list
            .subscribe(
                tags("9.9.9.9", "7"),
                Box::new(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();

        list.install(vec![deny_ip("1.2.3.4")]);
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_cluster_match() {
        let list = Denylist::disabled();
        list.install(vec![DenyEntry {
            kind: EntityKind::Cluster,
            item: "3".into(),
            reason: "suspended".into(),
        }]);
        let err = list
            .subscribe(tags("9.9.9.9", "3"), Box::new(|_| {}))
            .unwrap_err();
        assert_eq!(err.entity, "cluster");
    }

    #[tokio::test]
    async fn test_file_poll_picks_up_changes() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "entries: []").unwrap();
        file.flush().unwrap();

        let (_quiesce_tx, quiesce_rx) = watch::channel(false);
        let list = Denylist::from_file(
            file.path(),
            Duration::from_millis(10),
            Duration::from_millis(10),
            quiesce_rx,
        );

        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        let _sub = list
            .subscribe(
                tags("1.2.3.4", "3"),
                Box::new(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();

        std::fs::write(
            file.path(),
            "entries:\n  - kind: ip\n    item: \"1.2.3.4\"\n    reason: abuse\n",
        )
        .unwrap();

        // Within a few poll intervals the revocation must land.
        for _ in 0..50 {
            if fired.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
