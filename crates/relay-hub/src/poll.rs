use crate::bridge::{self, ForwardRequest};
use crate::config_store::AutoForward;
use crate::state::HubState;
use relay_core::{strip_forward_keyword, CanonicalMessage, Update, UpdateBatch};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// How long the upstream holds the long-poll open.
pub const LONG_POLL_WAIT_SECS: u64 = 30;
/// Fixed scheduling delay between cycle attempts, success or failure.
/// This is the sole retry mechanism: no backoff, no retry cap.
pub const RESCHEDULE_DELAY: Duration = Duration::from_secs(1);

const HTTP_CONFLICT: u16 = 409;

/// Run the ingestion scheduler until process shutdown. Every tick
/// attempts one cycle; the in-flight flag enforces at-most-one
/// concurrent long-poll request, so a tick that lands while a cycle
/// is still running is skipped, not queued.
pub fn spawn(hub: Arc<HubState>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(RESCHEDULE_DELAY);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            tokio::spawn(run_guarded_cycle(hub.clone()));
        }
    })
}

/// Admission control for one cycle attempt. Returns whether the cycle
/// actually ran. The flag is released only if no ingest reset happened
/// underneath the cycle: a reset already released it, and a successor
/// cycle may hold it again by the time the stale cycle finishes.
async fn run_guarded_cycle(hub: Arc<HubState>) -> bool {
    if hub
        .poll_in_flight
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_err()
    {
        debug!(event = "poll_skipped", reason = "cycle_in_flight");
        return false;
    }
    let generation = hub.ingest_generation.load(Ordering::SeqCst);
    if let Err(err) = poll_cycle(&hub, generation).await {
        warn!(event = "poll_error", error = %err);
    }
    if hub.ingest_generation.load(Ordering::SeqCst) == generation {
        hub.poll_in_flight.store(false, Ordering::SeqCst);
    }
    true
}

async fn poll_cycle(hub: &Arc<HubState>, generation: u64) -> anyhow::Result<()> {
    let Some(token) = hub.store.active_token().await else {
        debug!(event = "poll_idle", reason = "no_active_token");
        return Ok(());
    };

    let offset = hub.cursor.read().await.next_offset();
    debug!(event = "poll_request", offset = offset);

    let url = format!(
        "{}/bot{}/getUpdates",
        hub.config.upstream_url.trim_end_matches('/'),
        token
    );
    let response = hub
        .http
        .get(&url)
        .query(&[
            ("offset", offset.to_string()),
            ("timeout", LONG_POLL_WAIT_SECS.to_string()),
        ])
        .timeout(Duration::from_secs(LONG_POLL_WAIT_SECS + 10))
        .send()
        .await?;

    if response.status().as_u16() == HTTP_CONFLICT {
        // Another poller holds the long-poll slot. Recognized and
        // non-fatal; the fixed delay retries it.
        warn!(event = "poll_conflict", offset = offset);
        return Ok(());
    }

    let batch: UpdateBatch = response.error_for_status()?.json().await?;
    if !batch.ok {
        warn!(event = "poll_rejected", offset = offset);
        return Ok(());
    }
    if batch.result.is_empty() {
        debug!(event = "poll_empty");
        return Ok(());
    }

    info!(event = "poll_updates", count = batch.result.len());
    let auto = hub.store.auto_forward().await;
    apply_batch(hub, generation, &batch.result, &auto, &token).await;
    Ok(())
}

/// Run one returned batch through the cursor and the buffer. A batch
/// whose cycle started before an ingest reset is discarded wholesale:
/// the long poll was issued with the old token's offset, so its
/// updates must not advance the fresh cursor or repopulate the
/// cleared buffer. Returns whether the batch was applied.
async fn apply_batch(
    hub: &Arc<HubState>,
    generation: u64,
    updates: &[Update],
    auto: &AutoForward,
    token: &str,
) -> bool {
    if hub.ingest_generation.load(Ordering::SeqCst) != generation {
        info!(
            event = "poll_discarded",
            reason = "ingest_reset",
            count = updates.len()
        );
        return false;
    }
    for update in updates {
        {
            let mut cursor = hub.cursor.write().await;
            if !cursor.accepts(update.update_id) {
                continue;
            }
            cursor.advance_past(update.update_id);
        }
        process_update(hub, update, auto, token).await;
    }
    true
}

/// Canonicalize one accepted update, decide auto-forwarding, and
/// record it (durable log line + buffer append).
async fn process_update(hub: &Arc<HubState>, update: &Update, auto: &AutoForward, token: &str) {
    let Some(mut message) = CanonicalMessage::from_update(update, false) else {
        debug!(event = "update_skipped", update_id = update.update_id);
        return;
    };

    if auto.enabled {
        if let Some(stripped) = strip_forward_keyword(&message.text, &auto.keyword) {
            // Tagged as auto-sent whether or not the forward succeeds;
            // a failed attempt is visible only in the diagnostic log.
            message.auto_sent = true;
            let request = ForwardRequest {
                content: stripped.to_string(),
                chat_id: message.chat_id.clone(),
                credential_token: token.to_string(),
                display_name: message.from.clone(),
            };
            info!(event = "auto_forward", update_id = message.id, chat_id = %message.chat_id);
            tokio::spawn(bridge::forward_auto(hub.clone(), request));
        }
    }

    hub.record_message(message).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::HubConfig;
    use tempfile::{tempdir, TempDir};

    fn test_hub() -> (Arc<HubState>, TempDir) {
        let dir = tempdir().unwrap();
        let config = HubConfig {
            addr: "127.0.0.1:0".to_string(),
            upstream_url: "http://127.0.0.1:9".to_string(),
            config_path: dir.path().join("config.json"),
            message_log_path: dir.path().join("messages.log"),
            log_dir: String::new(),
            debug: false,
        };
        (Arc::new(HubState::new(config).unwrap()), dir)
    }

    fn update(id: i64, text: &str) -> Update {
        serde_json::from_value(serde_json::json!({
            "update_id": id,
            "message": {
                "from": {"first_name": "Ada"},
                "chat": {"id": 42},
                "text": text,
                "date": 1_700_000_000u32,
            },
        }))
        .unwrap()
    }

    fn ask_settings(enabled: bool) -> AutoForward {
        AutoForward {
            enabled,
            keyword: "/ask".to_string(),
        }
    }

    #[tokio::test]
    async fn keyword_match_tags_message_auto_sent() {
        let (hub, _dir) = test_hub();
        let update = update(1, "/ask what's the weather");
        process_update(&hub, &update, &ask_settings(true), "tok").await;

        let snapshot = hub.buffer.read().await.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert!(snapshot[0].auto_sent);
        // The displayed text keeps the keyword; only the forwarded
        // content is stripped.
        assert_eq!(snapshot[0].text, "/ask what's the weather");
    }

    #[tokio::test]
    async fn no_keyword_match_leaves_auto_sent_false() {
        let (hub, _dir) = test_hub();
        let update = update(2, "what's the weather");
        process_update(&hub, &update, &ask_settings(true), "tok").await;

        let snapshot = hub.buffer.read().await.snapshot();
        assert!(!snapshot[0].auto_sent);
    }

    #[tokio::test]
    async fn disabled_auto_forward_never_triggers() {
        let (hub, _dir) = test_hub();
        let update = update(3, "/ask anything");
        process_update(&hub, &update, &ask_settings(false), "tok").await;

        let snapshot = hub.buffer.read().await.snapshot();
        assert!(!snapshot[0].auto_sent);
    }

    #[tokio::test]
    async fn accepted_update_is_appended_to_the_message_log() {
        let (hub, dir) = test_hub();
        let update = update(4, "hello");
        process_update(&hub, &update, &ask_settings(false), "tok").await;

        let content = std::fs::read_to_string(dir.path().join("messages.log")).unwrap();
        assert!(content.contains("[UpdateID: 4] [ChatID: 42] Ada: hello"));
    }

    #[tokio::test]
    async fn payloadless_update_is_skipped() {
        let (hub, _dir) = test_hub();
        let update: Update =
            serde_json::from_value(serde_json::json!({"update_id": 5})).unwrap();
        process_update(&hub, &update, &ask_settings(true), "tok").await;
        assert!(hub.buffer.read().await.is_empty());
    }

    #[tokio::test]
    async fn current_batch_advances_cursor_and_buffer() {
        let (hub, _dir) = test_hub();
        let generation = hub.ingest_generation.load(Ordering::SeqCst);
        let updates = vec![update(100, "hello")];

        assert!(apply_batch(&hub, generation, &updates, &ask_settings(false), "tok").await);
        assert_eq!(hub.cursor.read().await.next_offset(), 101);
        assert_eq!(hub.buffer.read().await.len(), 1);
    }

    #[tokio::test]
    async fn batch_from_before_a_token_switch_is_discarded() {
        let (hub, _dir) = test_hub();
        // Cycle starts: generation captured, long poll goes out on the
        // old token.
        let generation = hub.ingest_generation.load(Ordering::SeqCst);
        let updates = vec![update(100, "old token msg")];

        // Token switch lands while the request is still being held
        // open upstream.
        hub.reset_ingest().await;

        // The stale batch must not repopulate the cleared state.
        assert!(!apply_batch(&hub, generation, &updates, &ask_settings(false), "old-token").await);
        assert!(hub.buffer.read().await.is_empty());
        assert_eq!(hub.cursor.read().await.next_offset(), 0);
    }

    #[tokio::test]
    async fn held_flag_skips_the_cycle() {
        let (hub, _dir) = test_hub();
        hub.poll_in_flight.store(true, Ordering::SeqCst);
        assert!(!run_guarded_cycle(hub.clone()).await);
        // Skipped, not queued: the holder's flag is untouched.
        assert!(hub.poll_in_flight.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn token_switch_releases_a_held_cycle_flag() {
        let (hub, _dir) = test_hub();
        hub.poll_in_flight.store(true, Ordering::SeqCst);
        hub.reset_ingest().await;
        assert!(!hub.poll_in_flight.load(Ordering::SeqCst));
        // The next cycle proceeds without waiting for the old one.
        assert!(run_guarded_cycle(hub.clone()).await);
        assert!(!hub.poll_in_flight.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn idle_cycle_runs_and_releases_the_flag() {
        let (hub, _dir) = test_hub();
        assert!(run_guarded_cycle(hub.clone()).await);
        assert!(!hub.poll_in_flight.load(Ordering::SeqCst));
    }
}
