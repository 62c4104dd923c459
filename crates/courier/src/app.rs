//! Startup wiring: restore persisted trees and build the shared services.

use std::collections::BTreeMap;
use std::path::PathBuf;

use courier_dispatch::{GlobalRateLimiter, LimiterConfig};
use courier_settings::CourierSettings;
use courier_tree::{ManagerSnapshot, TreeQueueManager};
use serde::Serialize;
use tracing::info;

use crate::errors::Result;
use crate::router::ConversationRouter;
use crate::store::JsonTreeStore;

/// Outcome of [`restore_manager`].
#[derive(Debug)]
pub struct Restored {
    /// Manager holding the persisted trees.
    pub manager: TreeQueueManager,
    /// Nodes failed because they were unfinished when the process stopped.
    pub stale: usize,
}

/// Load the persisted trees, fail nodes that were mid-flight, and write the
/// result back if anything changed. A missing file gives an empty manager.
pub fn restore_manager(store: &JsonTreeStore) -> Result<Restored> {
    let Some(snapshot) = store.load()? else {
        info!(path = %store.path().display(), "starting with no conversation trees");
        return Ok(Restored {
            manager: TreeQueueManager::new(),
            stale: 0,
        });
    };

    let manager = TreeQueueManager::from_snapshot(snapshot)?;
    let stale = manager.cleanup_stale_nodes();
    if stale > 0 {
        store.save(&manager.to_snapshot())?;
    }
    info!(trees = manager.tree_count(), stale, "conversation trees restored");
    Ok(Restored { manager, stale })
}

/// Snapshot store from settings, or an explicit path.
pub fn tree_store(settings: &CourierSettings, path: Option<PathBuf>) -> JsonTreeStore {
    JsonTreeStore::new(path.unwrap_or_else(|| settings.storage.trees_path()))
}

/// Start the process-wide limiter from settings. Needs a Tokio runtime.
pub fn start_limiter(settings: &CourierSettings) -> GlobalRateLimiter {
    GlobalRateLimiter::start(LimiterConfig::from(&settings.messaging))
}

/// Router over `manager` with the configured session limit.
pub fn conversation_router(
    settings: &CourierSettings,
    manager: TreeQueueManager,
) -> ConversationRouter {
    ConversationRouter::new(manager, settings.sessions.max_sessions)
}

/// Counts describing a stored snapshot.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotSummary {
    /// Number of trees.
    pub trees: usize,
    /// Node count per state.
    pub nodes: BTreeMap<String, usize>,
    /// Index entries that are not nodes.
    pub aliases: usize,
}

impl SnapshotSummary {
    /// Summarize `snapshot`.
    pub fn of(snapshot: &ManagerSnapshot) -> Self {
        let mut nodes: BTreeMap<String, usize> = BTreeMap::new();
        let mut node_total = 0;
        for tree in snapshot.trees.values() {
            for node in tree.nodes() {
                *nodes.entry(node.state.to_string()).or_default() += 1;
                node_total += 1;
            }
        }
        Self {
            trees: snapshot.trees.len(),
            nodes,
            aliases: snapshot.node_to_tree.len().saturating_sub(node_total),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use courier_core::{IncomingMessage, NodePayload};
    use courier_dispatch::DispatchError;
    use courier_tree::{LOST_ON_RESTART, MessageState};
    use tokio::time::Instant;

    fn payload(id: &str) -> NodePayload {
        NodePayload::new(IncomingMessage::new("hi", "c", "u", id, "telegram"), format!("s{id}"))
    }

    fn stored_manager(store: &JsonTreeStore) {
        let m = TreeQueueManager::new();
        let _ = m.create_tree("1", payload("1")).unwrap();
        let _ = m.add_to_tree("1", "2", payload("2")).unwrap();
        let _ = m.add_to_tree("1", "3", payload("3")).unwrap();
        m.register_node("s1", "1").unwrap();
        let _ = m.update_node_state("1", MessageState::InProgress, None).unwrap();
        let _ = m.update_node_state("1", MessageState::Completed, None).unwrap();
        let _ = m.update_node_state("2", MessageState::InProgress, None).unwrap();
        store.save(&m.to_snapshot()).unwrap();
    }

    #[test]
    fn restore_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonTreeStore::new(dir.path().join("trees.json"));
        let restored = restore_manager(&store).unwrap();
        assert_eq!(restored.stale, 0);
        assert_eq!(restored.manager.tree_count(), 0);
        assert!(!store.path().exists());
    }

    #[test]
    fn restore_fails_stale_nodes_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonTreeStore::new(dir.path().join("trees.json"));
        stored_manager(&store);

        let restored = restore_manager(&store).unwrap();
        assert_eq!(restored.stale, 2);
        let node = restored.manager.get_node("2").unwrap();
        assert_eq!(node.error_message.as_deref(), Some(LOST_ON_RESTART));

        // Written back, so a second restore has nothing left to fix.
        let again = restore_manager(&store).unwrap();
        assert_eq!(again.stale, 0);
        assert_eq!(again.manager.to_snapshot(), restored.manager.to_snapshot());
    }

    #[test]
    fn summary_counts() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonTreeStore::new(dir.path().join("trees.json"));
        stored_manager(&store);

        let summary = SnapshotSummary::of(&store.load().unwrap().unwrap());
        assert_eq!(summary.trees, 1);
        assert_eq!(summary.aliases, 1);
        assert_eq!(summary.nodes.get("completed"), Some(&1));
        assert_eq!(summary.nodes.get("in_progress"), Some(&1));
        assert_eq!(summary.nodes.get("pending"), Some(&1));
    }

    #[tokio::test(start_paused = true)]
    async fn limiter_uses_configured_flood_wait() {
        let mut settings = CourierSettings::default();
        settings.messaging.rate_limit = 5;
        settings.messaging.default_flood_wait_secs = 4;
        let limiter = start_limiter(&settings);

        let attempts = Arc::new(AtomicUsize::new(0));
        let a = Arc::clone(&attempts);
        let start = Instant::now();
        let sent: &str = limiter
            .enqueue(
                move || {
                    let a = Arc::clone(&a);
                    async move {
                        if a.fetch_add(1, Ordering::SeqCst) == 0 {
                            return Err(DispatchError::failed("Flood control exceeded"));
                        }
                        Ok("sent")
                    }
                },
                None,
            )
            .await
            .unwrap();

        assert_eq!(sent, "sent");
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert!(start.elapsed() >= Duration::from_secs(4));
        limiter.shutdown().await;
    }

    #[test]
    fn router_takes_session_limit_from_settings() {
        let mut settings = CourierSettings::default();
        settings.sessions.max_sessions = 3;
        let router = conversation_router(&settings, TreeQueueManager::new());
        assert!(router.stats_text().contains("Max: 3"));
    }

    #[test]
    fn store_path_override() {
        let settings = CourierSettings::default();
        let store = tree_store(&settings, Some(PathBuf::from("/tmp/x.json")));
        assert_eq!(store.path(), std::path::Path::new("/tmp/x.json"));
        assert!(tree_store(&settings, None).path().ends_with("trees.json"));
    }
}
