use crate::config_store::ConfigStore;
use crate::msglog::MessageLog;
use crate::relay::RelayTable;
use anyhow::Result;
use relay_core::{CanonicalMessage, MessageBuffer, UpdateCursor};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::RwLock;
use tracing::info;

#[derive(Clone, Debug)]
pub struct HubConfig {
    pub addr: String,
    pub upstream_url: String,
    pub config_path: PathBuf,
    pub message_log_path: PathBuf,
    pub log_dir: String,
    pub debug: bool,
}

/// Process-wide state shared between the poll loop, the bridge, and
/// the request handlers. The cursor and buffer are single-writer by
/// construction: only the poll loop and the token-switch handler ever
/// take their write locks.
pub struct HubState {
    pub config: HubConfig,
    pub cursor: RwLock<UpdateCursor>,
    pub buffer: RwLock<MessageBuffer>,
    pub relay: RelayTable,
    pub store: ConfigStore,
    pub message_log: MessageLog,
    pub http: reqwest::Client,
    pub poll_in_flight: AtomicBool,
    /// Bumped on every ingest reset. A poll cycle captures the value
    /// before its long-poll request and discards the batch if it
    /// changed underneath it, so a cycle still in flight on the old
    /// token cannot repopulate the cleared state.
    pub ingest_generation: AtomicU64,
}

impl HubState {
    pub fn new(config: HubConfig) -> Result<Self> {
        let store = ConfigStore::load(config.config_path.clone())?;
        let message_log = MessageLog::open(&config.message_log_path)?;
        // No client-wide timeout: long-poll and streaming calls both
        // block well past any sane default. Timeouts are per-request.
        let http = reqwest::Client::builder().build()?;
        Ok(Self {
            config,
            cursor: RwLock::new(UpdateCursor::new()),
            buffer: RwLock::new(MessageBuffer::default()),
            relay: RelayTable::new(),
            store,
            message_log,
            http,
            poll_in_flight: AtomicBool::new(false),
            ingest_generation: AtomicU64::new(0),
        })
    }

    /// Hard restart of ingestion sequencing: cursor back to its
    /// initial value, buffer emptied. In-flight relay sessions are
    /// deliberately left alone.
    pub async fn reset_ingest(&self) {
        self.cursor.write().await.reset();
        self.buffer.write().await.clear();
        self.ingest_generation.fetch_add(1, Ordering::SeqCst);
        // Release a held cycle flag so the next poll proceeds
        // immediately; the generation bump invalidates whatever the
        // old cycle brings back.
        self.poll_in_flight.store(false, Ordering::SeqCst);
        info!(event = "ingest_reset");
    }

    /// Record one accepted update: durable log line, then buffer
    /// append (with FIFO eviction).
    pub async fn record_message(&self, message: CanonicalMessage) {
        self.message_log.append(&message.log_line());
        self.buffer.write().await.push(message);
    }
}
