use crate::{
    metrics,
    models::{ImagePayload, ResultEntry},
    pipeline::{Pipeline, RunOutcome, RunPhase, RunUpdate, UPDATE_BUFFER, apply_update},
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::{collections::HashMap, sync::Arc, time::Duration};
use thiserror::Error;
use tokio::{
    sync::{Mutex, mpsc},
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// A session nobody has submitted to or polled for this long is dropped
    /// and its run cancelled.
    pub idle_ttl: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_ttl: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("session not found")]
    NotFound,
}

/// One result gallery per viewer. Each session shows at most one run; a new
/// submission replaces the gallery and aborts whatever was still running.
#[derive(Clone)]
pub struct SessionBoard {
    pipeline: Pipeline,
    idle_ttl: Duration,
    sessions: Arc<Mutex<HashMap<Uuid, Session>>>,
}

struct Session {
    run_id: Option<Uuid>,
    phase: RunPhase,
    started_at: Option<DateTime<Utc>>,
    last_seen: Instant,
    entries: Vec<ResultEntry>,
    task: Option<JoinHandle<()>>,
}

impl Session {
    fn new() -> Self {
        Self {
            run_id: None,
            phase: RunPhase::Idle,
            started_at: None,
            last_seen: Instant::now(),
            entries: Vec::new(),
            task: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub session_id: String,
    pub run_id: Option<String>,
    pub phase: RunPhase,
    pub busy: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub entries: Vec<ResultEntry>,
}

impl SessionBoard {
    pub fn new(pipeline: Pipeline, config: &SessionConfig) -> Self {
        Self {
            pipeline,
            idle_ttl: config.idle_ttl,
            sessions: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub async fn open(&self) -> Uuid {
        let id = Uuid::new_v4();
        self.sessions.lock().await.insert(id, Session::new());
        debug!(target = "outfit.sessions", session_id = %id, "session_opened");
        id
    }

    /// Starts a run for `image`, replacing the session's current one.
    pub async fn submit(&self, session_id: Uuid, image: ImagePayload) -> Result<Uuid, SessionError> {
        let run_id = Uuid::new_v4();
        let mut guard = self.sessions.lock().await;
        let session = guard.get_mut(&session_id).ok_or(SessionError::NotFound)?;

        if let Some(previous) = session.task.take() {
            previous.abort();
            info!(
                target = "outfit.sessions",
                session_id = %session_id,
                run_id = ?session.run_id,
                "run_replaced"
            );
        }
        session.run_id = Some(run_id);
        session.phase = RunPhase::Decomposing;
        session.started_at = Some(Utc::now());
        session.last_seen = Instant::now();
        // A poll that lands before the task is scheduled must already see
        // the echo; `apply` drops the run's own copy.
        session.entries = vec![ResultEntry::echo(&image)];

        let board = self.clone();
        session.task = Some(tokio::spawn(async move {
            board.drive(session_id, run_id, image).await;
        }));
        Ok(run_id)
    }

    /// Current view of the session. Counts as activity for idle expiry.
    pub async fn snapshot(&self, session_id: Uuid) -> Option<SessionSnapshot> {
        let mut guard = self.sessions.lock().await;
        let session = guard.get_mut(&session_id)?;
        session.last_seen = Instant::now();
        Some(SessionSnapshot {
            session_id: session_id.to_string(),
            run_id: session.run_id.map(|id| id.to_string()),
            phase: session.phase,
            busy: session.phase.is_busy(),
            started_at: session.started_at,
            entries: session.entries.clone(),
        })
    }

    /// Forgets the session and cancels its run, if any.
    pub async fn close(&self, session_id: Uuid) -> Result<(), SessionError> {
        let session = self
            .sessions
            .lock()
            .await
            .remove(&session_id)
            .ok_or(SessionError::NotFound)?;
        if let Some(task) = session.task {
            task.abort();
        }
        debug!(target = "outfit.sessions", session_id = %session_id, "session_closed");
        Ok(())
    }

    /// Drops every session idle for at least the configured TTL and aborts
    /// its run. Returns how many were dropped.
    pub async fn sweep_idle(&self) -> usize {
        let mut guard = self.sessions.lock().await;
        let before = guard.len();
        let ttl = self.idle_ttl;
        guard.retain(|session_id, session| {
            if session.last_seen.elapsed() < ttl {
                return true;
            }
            if let Some(task) = session.task.take() {
                task.abort();
            }
            debug!(target = "outfit.sessions", session_id = %session_id, "session_expired");
            false
        });
        let expired = before - guard.len();
        if expired > 0 {
            info!(
                target = "outfit.sessions",
                expired,
                remaining = guard.len(),
                "idle_sessions_swept"
            );
            metrics::sessions_expired(expired, guard.len());
        }
        expired
    }

    /// Sweeps idle sessions every half TTL for as long as the runtime lives.
    pub fn spawn_sweeper(&self) -> JoinHandle<()> {
        let board = self.clone();
        let period = (self.idle_ttl / 2).max(Duration::from_millis(10));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                board.sweep_idle().await;
            }
        })
    }

    async fn drive(&self, session_id: Uuid, run_id: Uuid, image: ImagePayload) {
        let (tx, mut rx) = mpsc::channel(UPDATE_BUFFER);
        let apply = async {
            while let Some(update) = rx.recv().await {
                self.apply(session_id, run_id, update).await;
            }
        };
        let (outcome, ()) = tokio::join!(self.pipeline.run_into(image, tx), apply);

        let mut guard = self.sessions.lock().await;
        if let Some(session) = guard.get_mut(&session_id)
            && session.run_id == Some(run_id)
        {
            session.task = None;
            if outcome == RunOutcome::Abandoned && session.phase.is_busy() {
                session.phase = RunPhase::Idle;
            }
        }
        debug!(target = "outfit.sessions", session_id = %session_id, run_id = %run_id, ?outcome, "run_settled");
    }

    async fn apply(&self, session_id: Uuid, run_id: Uuid, update: RunUpdate) {
        let mut guard = self.sessions.lock().await;
        let Some(session) = guard.get_mut(&session_id) else {
            return;
        };
        if session.run_id != Some(run_id) {
            debug!(target = "outfit.sessions", session_id = %session_id, run_id = %run_id, "stale_update_discarded");
            return;
        }
        match update {
            RunUpdate::Phase(phase) => session.phase = phase,
            RunUpdate::Append(ResultEntry::Echo { .. }) => {}
            other => apply_update(&mut session.entries, other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ScriptedMetadata, ScriptedVision, pipeline, sample_image};

    fn board(pipeline: Pipeline) -> SessionBoard {
        SessionBoard::new(pipeline, &SessionConfig::default())
    }

    fn board_with_ttl(pipeline: Pipeline, idle_ttl: Duration) -> SessionBoard {
        SessionBoard::new(pipeline, &SessionConfig { idle_ttl })
    }

    fn echo_count(entries: &[ResultEntry]) -> usize {
        entries
            .iter()
            .filter(|entry| matches!(entry, ResultEntry::Echo { .. }))
            .count()
    }

    async fn wait_until_settled(board: &SessionBoard, session_id: Uuid) -> SessionSnapshot {
        for _ in 0..200 {
            let snapshot = board.snapshot(session_id).await.expect("session");
            if !snapshot.busy {
                return snapshot;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("run did not settle");
    }

    #[tokio::test]
    async fn submit_runs_to_completion_and_clears_busy() {
        let board = board(pipeline(
            ScriptedVision::replying("Blue denim jacket\nWhite sneakers"),
            Some(ScriptedMetadata::live()),
            1,
        ));
        let session_id = board.open().await;
        let run_id = board.submit(session_id, sample_image()).await.expect("submit");

        let busy = board.snapshot(session_id).await.expect("session");
        assert!(busy.busy);
        assert_eq!(busy.run_id, Some(run_id.to_string()));

        let done = wait_until_settled(&board, session_id).await;
        assert_eq!(done.phase, RunPhase::Done);
        assert_eq!(done.entries.len(), 7);
        assert!(matches!(done.entries[0], ResultEntry::Echo { .. }));
    }

    #[tokio::test]
    async fn failed_analysis_clears_busy_with_one_failure() {
        let board = board(pipeline(ScriptedVision::failing(401), None, 1));
        let session_id = board.open().await;
        board.submit(session_id, sample_image()).await.expect("submit");

        let done = wait_until_settled(&board, session_id).await;
        assert_eq!(done.phase, RunPhase::Failed);
        assert_eq!(done.entries.len(), 1);
        assert!(matches!(done.entries[0], ResultEntry::Failure { .. }));
    }

    #[tokio::test]
    async fn resubmission_never_interleaves_runs() {
        let metadata = ScriptedMetadata::live().with_delay(|_| Duration::from_millis(15));
        let board = board(pipeline(
            ScriptedVision::replying("Linen shirt\nChinos"),
            Some(metadata),
            1,
        ));
        let session_id = board.open().await;
        let first = board.submit(session_id, sample_image()).await.expect("first");

        // Let the first run get into preview resolution.
        tokio::time::sleep(Duration::from_millis(20)).await;
        let second_image = ImagePayload::from_bytes(b"second photo", None)
            .expect("payload")
            .with_display_uri("file:///photos/second.jpg");
        let second = board.submit(session_id, second_image).await.expect("second");
        assert_ne!(first, second);

        let done = wait_until_settled(&board, session_id).await;
        assert_eq!(done.run_id, Some(second.to_string()));
        assert_eq!(done.entries.len(), 7);
        assert_eq!(
            done.entries[0],
            ResultEntry::Echo {
                image_uri: Some("file:///photos/second.jpg".into()),
                message: "Analyzing outfit...".into(),
            }
        );
        assert_eq!(echo_count(&done.entries), 1);
    }

    #[tokio::test]
    async fn slow_analysis_can_be_replaced_before_it_answers() {
        let board = board(pipeline(
            ScriptedVision::replying("Red scarf").with_delay(Duration::from_millis(30)),
            None,
            1,
        ));
        let session_id = board.open().await;
        board.submit(session_id, sample_image()).await.expect("first");
        tokio::time::sleep(Duration::from_millis(5)).await;
        let second = board.submit(session_id, sample_image()).await.expect("second");

        let done = wait_until_settled(&board, session_id).await;
        assert_eq!(done.run_id, Some(second.to_string()));
        assert_eq!(done.entries.len(), 4);
        let products = done
            .entries
            .iter()
            .filter(|e| matches!(e, ResultEntry::Product { .. }))
            .count();
        assert_eq!(products, 3);
    }

    #[tokio::test]
    async fn unknown_and_closed_sessions() {
        let board = board(pipeline(ScriptedVision::replying("Hat"), None, 1));
        let missing = Uuid::new_v4();
        assert_eq!(
            board.submit(missing, sample_image()).await.unwrap_err(),
            SessionError::NotFound
        );
        assert!(board.snapshot(missing).await.is_none());

        let session_id = board.open().await;
        board.close(session_id).await.expect("close");
        assert!(board.snapshot(session_id).await.is_none());
        assert_eq!(board.close(session_id).await.unwrap_err(), SessionError::NotFound);
    }

    #[tokio::test]
    async fn echo_is_visible_as_soon_as_submit_returns() {
        let board = board(pipeline(
            ScriptedVision::replying("Red scarf").with_delay(Duration::from_millis(30)),
            None,
            1,
        ));
        let session_id = board.open().await;
        board.submit(session_id, sample_image()).await.expect("submit");

        let early = board.snapshot(session_id).await.expect("session");
        assert!(early.busy);
        assert_eq!(early.entries, vec![ResultEntry::echo(&sample_image())]);

        let done = wait_until_settled(&board, session_id).await;
        assert_eq!(done.entries.len(), 4);
        assert_eq!(done.entries[0], ResultEntry::echo(&sample_image()));
        assert_eq!(echo_count(&done.entries), 1);
    }

    #[tokio::test]
    async fn idle_sessions_are_dropped_and_their_runs_cancelled() {
        let metadata = ScriptedMetadata::live();
        let board = board_with_ttl(
            pipeline(
                ScriptedVision::replying("Hat").with_delay(Duration::from_millis(80)),
                Some(metadata.clone()),
                1,
            ),
            Duration::from_millis(30),
        );
        let abandoned = board.open().await;
        let watched = board.open().await;
        board.submit(abandoned, sample_image()).await.expect("submit");

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(board.snapshot(watched).await.is_some());
        assert_eq!(board.sweep_idle().await, 1);

        assert!(board.snapshot(abandoned).await.is_none());
        assert!(board.snapshot(watched).await.is_some());

        // The aborted run never reaches preview resolution.
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(metadata.calls(), 0);
    }

    #[tokio::test]
    async fn polling_keeps_a_session_alive() {
        let board = board_with_ttl(
            pipeline(ScriptedVision::replying("Hat"), None, 1),
            Duration::from_millis(40),
        );
        let session_id = board.open().await;
        for _ in 0..4 {
            tokio::time::sleep(Duration::from_millis(15)).await;
            assert!(board.snapshot(session_id).await.is_some());
            assert_eq!(board.sweep_idle().await, 0);
        }
    }

    #[tokio::test]
    async fn sweeper_evicts_forgotten_sessions_on_its_own() {
        let board = board_with_ttl(
            pipeline(ScriptedVision::replying("Hat"), None, 1),
            Duration::from_millis(20),
        );
        let sweeper = board.spawn_sweeper();
        let mut ids = Vec::new();
        for _ in 0..50 {
            ids.push(board.open().await);
        }

        tokio::time::sleep(Duration::from_millis(100)).await;
        for id in ids {
            assert!(board.snapshot(id).await.is_none());
        }
        sweeper.abort();
    }
}
