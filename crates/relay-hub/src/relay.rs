use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

pub const VIEWER_CHANNEL_CAPACITY: usize = 256;

/// Handle under which an attached viewer is tracked.
pub type ViewerId = u64;

struct RunSession {
    task_id: String,
    viewers: HashMap<ViewerId, mpsc::Sender<Value>>,
}

/// Maps a workflow run id to its currently attached live viewers.
/// Owns every run session; attach/detach/dispatch on the same run are
/// serialized through the table lock. Nothing is replayed: a frame
/// dispatched before a viewer attaches is gone.
pub struct RelayTable {
    viewer_counter: AtomicU64,
    runs: RwLock<HashMap<String, RunSession>>,
}

impl RelayTable {
    pub fn new() -> Self {
        Self {
            viewer_counter: AtomicU64::new(0),
            runs: RwLock::new(HashMap::new()),
        }
    }

    /// Create the session for a freshly started run. Idempotent: a
    /// duplicate start event keeps the existing viewer set.
    pub async fn register_run(&self, run_id: &str, task_id: &str) {
        let mut runs = self.runs.write().await;
        runs.entry(run_id.to_string()).or_insert_with(|| {
            info!(event = "run_registered", run_id = run_id, task_id = task_id);
            RunSession {
                task_id: task_id.to_string(),
                viewers: HashMap::new(),
            }
        });
    }

    /// Attach a viewer to a registered run. Returns `None` when the
    /// run is unknown; the caller should close the connection.
    pub async fn attach(&self, run_id: &str, sender: mpsc::Sender<Value>) -> Option<ViewerId> {
        let mut runs = self.runs.write().await;
        let Some(session) = runs.get_mut(run_id) else {
            debug!(event = "attach_unknown_run", run_id = run_id);
            return None;
        };
        let viewer_id = self.viewer_counter.fetch_add(1, Ordering::SeqCst) + 1;
        session.viewers.insert(viewer_id, sender);
        info!(
            event = "viewer_attached",
            run_id = run_id,
            viewer_id = viewer_id,
            viewers = session.viewers.len()
        );
        Some(viewer_id)
    }

    /// Remove a viewer; an emptied viewer set removes the session.
    /// Detaching from an unknown run or with a stale id is a no-op.
    pub async fn detach(&self, run_id: &str, viewer_id: ViewerId) {
        let mut runs = self.runs.write().await;
        let Some(session) = runs.get_mut(run_id) else {
            return;
        };
        if session.viewers.remove(&viewer_id).is_none() {
            return;
        }
        info!(
            event = "viewer_detached",
            run_id = run_id,
            viewer_id = viewer_id,
            viewers = session.viewers.len()
        );
        if session.viewers.is_empty() {
            runs.remove(run_id);
            info!(event = "run_removed", run_id = run_id, reason = "no_viewers");
        }
    }

    /// Fan one frame out to every attached viewer. Unknown run ids
    /// are a silent no-op. A viewer whose channel is gone is detached.
    pub async fn dispatch(&self, run_id: &str, frame: &Value) {
        let targets: Vec<(ViewerId, mpsc::Sender<Value>)> = {
            let runs = self.runs.read().await;
            match runs.get(run_id) {
                Some(session) => session
                    .viewers
                    .iter()
                    .map(|(id, sender)| (*id, sender.clone()))
                    .collect(),
                None => return,
            }
        };
        for (viewer_id, sender) in targets {
            if sender.send(frame.clone()).await.is_err() {
                warn!(event = "viewer_send_error", run_id = run_id, viewer_id = viewer_id);
                self.detach(run_id, viewer_id).await;
            }
        }
    }

    /// Dispatch a terminal frame, then tear the session down. Dropping
    /// the viewer senders ends every attached connection.
    pub async fn finish_run(&self, run_id: &str, frame: &Value) {
        self.dispatch(run_id, frame).await;
        let removed = self.runs.write().await.remove(run_id);
        if let Some(session) = removed {
            info!(
                event = "run_removed",
                run_id = run_id,
                reason = "terminal",
                viewers = session.viewers.len()
            );
        }
    }

    pub async fn run_exists(&self, run_id: &str) -> bool {
        self.runs.read().await.contains_key(run_id)
    }

    pub async fn task_id(&self, run_id: &str) -> Option<String> {
        self.runs
            .read()
            .await
            .get(run_id)
            .map(|session| session.task_id.clone())
    }

    pub async fn run_count(&self) -> usize {
        self.runs.read().await.len()
    }
}

impl Default for RelayTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn dispatch_to_unknown_run_is_a_no_op() {
        let table = RelayTable::new();
        table.dispatch("missing", &json!({"event": "ping"})).await;
        assert_eq!(table.run_count().await, 0);
    }

    #[tokio::test]
    async fn attach_to_unknown_run_returns_none() {
        let table = RelayTable::new();
        let (tx, _rx) = mpsc::channel(VIEWER_CHANNEL_CAPACITY);
        assert!(table.attach("missing", tx).await.is_none());
    }

    #[tokio::test]
    async fn attached_viewer_receives_dispatched_frames() {
        let table = RelayTable::new();
        table.register_run("r1", "t1").await;
        let (tx, mut rx) = mpsc::channel(VIEWER_CHANNEL_CAPACITY);
        table.attach("r1", tx).await.unwrap();

        let frame = json!({"event": "node_finished", "data": {"index": 1}});
        table.dispatch("r1", &frame).await;
        assert_eq!(rx.recv().await.unwrap(), frame);
    }

    #[tokio::test]
    async fn empty_viewer_set_removes_the_session() {
        let table = RelayTable::new();
        table.register_run("r1", "t1").await;
        let (tx, _rx) = mpsc::channel(VIEWER_CHANNEL_CAPACITY);
        let viewer = table.attach("r1", tx).await.unwrap();

        table.detach("r1", viewer).await;
        assert!(!table.run_exists("r1").await);

        // Later dispatch is a no-op, not a crash.
        table.dispatch("r1", &json!({"event": "ping"})).await;
    }

    #[tokio::test]
    async fn detach_with_stale_id_is_safe() {
        let table = RelayTable::new();
        table.register_run("r1", "t1").await;
        table.detach("r1", 999).await;
        table.detach("missing", 1).await;
        // A stale detach never tears down a session still waiting for
        // its first viewer.
        assert!(table.run_exists("r1").await);
    }

    #[tokio::test]
    async fn finish_run_delivers_terminal_frame_and_closes_viewers() {
        let table = RelayTable::new();
        table.register_run("r1", "t1").await;
        let (tx, mut rx) = mpsc::channel(VIEWER_CHANNEL_CAPACITY);
        table.attach("r1", tx).await.unwrap();

        let terminal = json!({"event": "workflow_finished", "data": {"status": "succeeded"}});
        table.finish_run("r1", &terminal).await;

        assert_eq!(rx.recv().await.unwrap(), terminal);
        // Channel closes once the session drops its senders.
        assert!(rx.recv().await.is_none());
        assert!(!table.run_exists("r1").await);
    }

    #[tokio::test]
    async fn dropped_viewer_is_detached_on_next_dispatch() {
        let table = RelayTable::new();
        table.register_run("r1", "t1").await;
        let (tx, rx) = mpsc::channel(VIEWER_CHANNEL_CAPACITY);
        table.attach("r1", tx).await.unwrap();
        drop(rx);

        table.dispatch("r1", &json!({"event": "ping"})).await;
        assert!(!table.run_exists("r1").await);
    }

    #[tokio::test]
    async fn register_run_is_idempotent() {
        let table = RelayTable::new();
        table.register_run("r1", "t1").await;
        let (tx, _rx) = mpsc::channel(VIEWER_CHANNEL_CAPACITY);
        table.attach("r1", tx).await.unwrap();
        table.register_run("r1", "t1").await;
        assert_eq!(table.task_id("r1").await.as_deref(), Some("t1"));
        assert_eq!(table.run_count().await, 1);
    }
}
