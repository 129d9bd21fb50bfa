//! One player's live session with the server.
//!
//! The session owns the player's move sequence counter and a cached copy of
//! the last snapshot. Both sit behind one mutex that is never shared with
//! another session.
//!
//! Moves are numbered before they are sent. When a call fails in transit the
//! *same* numbered move is resent, so the server can tell a retransmission
//! from a new move and apply each at most once. A move whose retries run out
//! is dropped; the next move carries a larger number anyway.
//!
//! Polling runs as a background task until the session closes or too many
//! polls in a row fail, at which point the session is flagged
//! [`PollStatus::Desynchronized`] and the cache simply stops changing.

use crate::config::{PollConfig, SessionConfig};
use crate::network::{RpcClient, Transport};
use log::{error, info, warn};
use shared::{GameSnapshot, Packet, PlayerState};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

/// What happened to a submitted move.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveOutcome {
    /// The server answered. `applied == false` means it already had this move.
    Accepted { applied: bool },
    /// The server refused the arguments; the move was not retried.
    Rejected,
    /// Every attempt failed in transit; the move was given up.
    Lost,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollStatus {
    /// Polling has not been started.
    Idle,
    Running,
    /// Polling gave up after repeated failures.
    Desynchronized,
    /// Polling was stopped on purpose.
    Stopped,
}

#[derive(Debug, thiserror::Error)]
pub enum RegisterError {
    #[error("could not register {player_id} after {attempts} attempts: {reason}")]
    Exhausted {
        player_id: String,
        attempts: u32,
        reason: String,
    },
}

#[derive(Debug, Default)]
struct SessionState {
    seq: u64,
    cache: GameSnapshot,
}

struct Poller {
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

pub struct Session<T: Transport = RpcClient> {
    player_id: String,
    transport: Arc<T>,
    config: SessionConfig,
    state: Arc<Mutex<SessionState>>,
    status_tx: Option<watch::Sender<PollStatus>>,
    status_rx: watch::Receiver<PollStatus>,
    poller: Option<Poller>,
}

impl<T: Transport> std::fmt::Debug for Session<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("player_id", &self.player_id)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<T: Transport> Session<T> {
    pub fn new(player_id: impl Into<String>, transport: T, config: SessionConfig) -> Self {
        let (status_tx, status_rx) = watch::channel(PollStatus::Idle);
        Self {
            player_id: player_id.into(),
            transport: Arc::new(transport),
            config,
            state: Arc::new(Mutex::new(SessionState::default())),
            status_tx: Some(status_tx),
            status_rx,
            poller: None,
        }
    }

    pub fn player_id(&self) -> &str {
        &self.player_id
    }

    /// Registers the player, retrying on failure or refusal.
    ///
    /// On success the sequence counter is raised to the server's last
    /// accepted number, so a restarted client reusing an id is not mistaken
    /// for a stream of duplicates.
    pub async fn register(&self) -> Result<(), RegisterError> {
        let policy = &self.config.register;
        let mut reason = String::from("no attempt made");

        for attempt in 1..=policy.max_attempts {
            let request = Packet::RegisterPlayer {
                player_id: self.player_id.clone(),
            };

            reason = match self.transport.call(request).await {
                Ok(Packet::RegisterReply { ok: true, last_seq }) => {
                    let mut state = self.state.lock().await;
                    state.seq = state.seq.max(last_seq);
                    info!("Player {} registered", self.player_id);
                    return Ok(());
                }
                Ok(Packet::RegisterReply { ok: false, .. }) => "server refused".to_string(),
                Ok(Packet::Error { code, message }) => format!("{}: {}", code, message),
                Ok(other) => format!("unexpected reply {}", other.name()),
                Err(e) => e.to_string(),
            };

            warn!(
                "Registering {} failed (attempt {}/{}): {}",
                self.player_id, attempt, policy.max_attempts, reason
            );
            if attempt < policy.max_attempts {
                tokio::time::sleep(policy.delay).await;
            }
        }

        Err(RegisterError::Exhausted {
            player_id: self.player_id.clone(),
            attempts: policy.max_attempts,
            reason,
        })
    }

    /// Sends the player's new position.
    ///
    /// Never fails: a lost or refused move is logged and reported through
    /// the returned [`MoveOutcome`].
    pub async fn submit_move(&self, row: i32, col: i32) -> MoveOutcome {
        let seq = {
            let mut state = self.state.lock().await;
            state.seq += 1;
            state.seq
        };
        let request = Packet::UpdatePlayerState {
            player_id: self.player_id.clone(),
            row,
            col,
            seq_num: seq,
        };

        let policy = &self.config.moves;
        for attempt in 1..=policy.max_attempts {
            let failure = match self.transport.call(request.clone()).await {
                Ok(Packet::MoveReply { applied }) => return MoveOutcome::Accepted { applied },
                Ok(Packet::Error { code, message }) => {
                    warn!("Move seq={} rejected ({}): {}", seq, code, message);
                    return MoveOutcome::Rejected;
                }
                Ok(other) => format!("unexpected reply {}", other.name()),
                Err(e) => e.to_string(),
            };

            warn!(
                "Move seq={} failed (attempt {}/{}): {}",
                seq, attempt, policy.max_attempts, failure
            );
            if attempt < policy.max_attempts {
                tokio::time::sleep(policy.delay).await;
            }
        }

        warn!(
            "Giving up on move to ({},{}) after {} attempts (seq={})",
            row, col, policy.max_attempts, seq
        );
        MoveOutcome::Lost
    }

    /// Starts the background polling task. Calling it again is a no-op.
    pub fn start_polling(&mut self) {
        let Some(status_tx) = self.status_tx.take() else {
            return;
        };

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(poll_loop(
            Arc::clone(&self.transport),
            Arc::clone(&self.state),
            self.config.poll.clone(),
            status_tx,
            shutdown_rx,
        ));
        self.poller = Some(Poller { shutdown_tx, task });
    }

    /// Stops the polling task and waits for it to finish.
    pub async fn stop_polling(&mut self) {
        if let Some(poller) = self.poller.take() {
            let _ = poller.shutdown_tx.send(true);
            if let Err(e) = poller.task.await {
                error!("Polling task panicked: {}", e);
            }
        }
    }

    pub fn poll_status(&self) -> PollStatus {
        *self.status_rx.borrow()
    }

    pub fn subscribe_poll_status(&self) -> watch::Receiver<PollStatus> {
        self.status_rx.clone()
    }

    pub fn is_desynchronized(&self) -> bool {
        self.poll_status() == PollStatus::Desynchronized
    }

    /// Copy of the last snapshot received, own player included.
    pub async fn snapshot(&self) -> GameSnapshot {
        self.state.lock().await.cache.clone()
    }

    /// Copy of every other player's last known state.
    pub async fn remote_players(&self) -> HashMap<String, PlayerState> {
        let state = self.state.lock().await;
        state
            .cache
            .players
            .iter()
            .filter(|(id, _)| **id != self.player_id)
            .map(|(id, player)| (id.clone(), player.clone()))
            .collect()
    }

    /// Last sequence number handed out.
    pub async fn current_seq(&self) -> u64 {
        self.state.lock().await.seq
    }

    /// Ends the session: stops polling, tells the server the player left,
    /// then releases the connection. A failed unregister is only logged.
    pub async fn close(mut self) {
        self.stop_polling().await;

        let request = Packet::UnregisterPlayer {
            player_id: self.player_id.clone(),
        };
        match self.transport.call(request).await {
            Ok(Packet::UnregisterReply) => info!("Player {} unregistered", self.player_id),
            Ok(other) => warn!(
                "Unexpected reply {} while unregistering {}",
                other.name(),
                self.player_id
            ),
            Err(e) => warn!("Could not unregister {}: {}", self.player_id, e),
        }

        self.transport.close().await;
    }

    /// Releases the connection without unregistering.
    pub async fn abandon(mut self) {
        self.stop_polling().await;
        self.transport.close().await;
    }
}

async fn poll_loop<T: Transport>(
    transport: Arc<T>,
    state: Arc<Mutex<SessionState>>,
    config: PollConfig,
    status: watch::Sender<PollStatus>,
    mut shutdown: watch::Receiver<bool>,
) {
    status.send_replace(PollStatus::Running);
    let mut failures: u32 = 0;

    loop {
        let result = tokio::select! {
            result = transport.call(Packet::GetGameState) => result,
            _ = shutdown.changed() => break,
        };

        let outcome = match result {
            Ok(Packet::GameState { players }) => Ok(players),
            Ok(other) => Err(format!("unexpected reply {}", other.name())),
            Err(e) => Err(e.to_string()),
        };

        let delay = match outcome {
            Ok(players) => {
                state.lock().await.cache = GameSnapshot::new(players);
                if failures > 0 {
                    info!("Polling recovered after {} failed attempts", failures);
                    failures = 0;
                }
                config.interval
            }
            Err(reason) => {
                failures += 1;
                warn!(
                    "Polling failed ({}/{}): {}",
                    failures, config.max_consecutive_failures, reason
                );
                if failures >= config.max_consecutive_failures {
                    error!(
                        "Polling stopped after {} consecutive failures; other players will no longer update",
                        failures
                    );
                    status.send_replace(PollStatus::Desynchronized);
                    return;
                }
                config.failure_delay(failures)
            }
        };

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.changed() => break,
        }
    }

    status.send_replace(PollStatus::Stopped);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryPolicy;
    use crate::network::RpcError;
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    /// Scripted transport: pops one canned result per call and records requests.
    #[derive(Default)]
    struct ScriptedTransport {
        script: StdMutex<VecDeque<Result<Packet, RpcError>>>,
        requests: StdMutex<Vec<Packet>>,
        fallback: Option<Packet>,
        closed: StdMutex<bool>,
    }

    impl ScriptedTransport {
        fn new(script: Vec<Result<Packet, RpcError>>) -> Self {
            Self {
                script: StdMutex::new(script.into()),
                ..Self::default()
            }
        }

        /// Answers with `fallback` once the script runs out.
        fn with_fallback(mut self, fallback: Packet) -> Self {
            self.fallback = Some(fallback);
            self
        }
    }

    impl Transport for ScriptedTransport {
        async fn call(&self, request: Packet) -> Result<Packet, RpcError> {
            self.requests.lock().unwrap().push(request);
            let next = self.script.lock().unwrap().pop_front();
            match next {
                Some(result) => result,
                None => self.fallback.clone().ok_or(RpcError::ConnectionClosed),
            }
        }

        async fn close(&self) {
            *self.closed.lock().unwrap() = true;
        }
    }

    fn fast_config() -> SessionConfig {
        let quick = RetryPolicy {
            max_attempts: 3,
            delay: Duration::from_millis(1),
        };
        SessionConfig {
            register: quick.clone(),
            moves: quick,
            poll: PollConfig {
                interval: Duration::from_millis(5),
                failure_backoff: Duration::from_millis(1),
                max_consecutive_failures: 3,
            },
        }
    }

    fn seq_of(request: &Packet) -> u64 {
        match request {
            Packet::UpdatePlayerState { seq_num, .. } => *seq_num,
            other => panic!("Expected a move, got {:?}", other),
        }
    }

    fn game_state(players: &[(&str, i32, i32)]) -> Packet {
        Packet::GameState {
            players: players
                .iter()
                .map(|(id, row, col)| (id.to_string(), PlayerState::at(*id, *row, *col)))
                .collect(),
        }
    }

    async fn wait_for_status(session: &Session<ScriptedTransport>, wanted: PollStatus) {
        let mut status = session.subscribe_poll_status();
        tokio::time::timeout(Duration::from_secs(2), status.wait_for(|s| *s == wanted))
            .await
            .expect("poll status never changed")
            .unwrap();
    }

    #[tokio::test]
    async fn test_resend_reuses_sequence_number() {
        let transport = ScriptedTransport::new(vec![
            Err(RpcError::ConnectionClosed),
            Err(RpcError::ConnectionClosed),
            Ok(Packet::MoveReply { applied: true }),
        ]);
        let session = Session::new("alice", transport, fast_config());

        let outcome = session.submit_move(3, 4).await;
        assert_eq!(outcome, MoveOutcome::Accepted { applied: true });

        let requests = session.transport.requests.lock().unwrap().clone();
        assert_eq!(requests.len(), 3);
        assert!(requests.iter().all(|r| *r == requests[0]));
        assert_eq!(seq_of(&requests[0]), 1);
    }

    #[tokio::test]
    async fn test_each_move_gets_a_fresh_number() {
        let transport = ScriptedTransport::new(vec![])
            .with_fallback(Packet::MoveReply { applied: true });
        let session = Session::new("alice", transport, fast_config());

        session.submit_move(1, 0).await;
        session.submit_move(2, 0).await;
        session.submit_move(3, 0).await;

        let requests = session.transport.requests.lock().unwrap().clone();
        let seqs: Vec<u64> = requests.iter().map(seq_of).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
        assert_eq!(session.current_seq().await, 3);
    }

    #[tokio::test]
    async fn test_duplicate_reply_is_normal_return() {
        let transport =
            ScriptedTransport::new(vec![Ok(Packet::MoveReply { applied: false })]);
        let session = Session::new("alice", transport, fast_config());

        assert_eq!(
            session.submit_move(3, 4).await,
            MoveOutcome::Accepted { applied: false }
        );
        assert_eq!(session.transport.requests.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_exhausted_move_is_lost_and_next_move_moves_on() {
        let transport = ScriptedTransport::new(vec![
            Err(RpcError::ConnectionClosed),
            Err(RpcError::ConnectionClosed),
            Err(RpcError::ConnectionClosed),
            Ok(Packet::MoveReply { applied: true }),
        ]);
        let session = Session::new("alice", transport, fast_config());

        assert_eq!(session.submit_move(1, 1).await, MoveOutcome::Lost);
        assert_eq!(
            session.submit_move(2, 2).await,
            MoveOutcome::Accepted { applied: true }
        );

        let requests = session.transport.requests.lock().unwrap().clone();
        let seqs: Vec<u64> = requests.iter().map(seq_of).collect();
        assert_eq!(seqs, vec![1, 1, 1, 2]);
    }

    #[tokio::test]
    async fn test_invalid_argument_is_not_retried() {
        let transport = ScriptedTransport::new(vec![Ok(Packet::Error {
            code: shared::ErrorCode::InvalidArgument,
            message: "empty player id".to_string(),
        })]);
        let session = Session::new("", transport, fast_config());

        assert_eq!(session.submit_move(1, 1).await, MoveOutcome::Rejected);
        assert_eq!(session.transport.requests.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_register_retries_then_succeeds() {
        let transport = ScriptedTransport::new(vec![
            Err(RpcError::ConnectionClosed),
            Ok(Packet::RegisterReply {
                ok: false,
                last_seq: 0,
            }),
            Ok(Packet::RegisterReply {
                ok: true,
                last_seq: 0,
            }),
        ]);
        let session = Session::new("alice", transport, fast_config());

        tokio_test::assert_ok!(session.register().await);
        assert_eq!(session.transport.requests.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_register_exhaustion_reports_last_reason() {
        let transport = ScriptedTransport::new(vec![])
            .with_fallback(Packet::Error {
                code: shared::ErrorCode::InvalidArgument,
                message: "empty player id".to_string(),
            });
        let session = Session::new("", transport, fast_config());

        let err = tokio_test::assert_err!(session.register().await);
        let RegisterError::Exhausted {
            attempts, reason, ..
        } = err;
        assert_eq!(attempts, 3);
        assert!(reason.contains("empty player id"));
    }

    #[tokio::test]
    async fn test_register_resumes_from_server_sequence() {
        let transport = ScriptedTransport::new(vec![Ok(Packet::RegisterReply {
            ok: true,
            last_seq: 41,
        })])
        .with_fallback(Packet::MoveReply { applied: true });
        let session = Session::new("alice", transport, fast_config());

        session.register().await.unwrap();
        session.submit_move(1, 1).await;

        let requests = session.transport.requests.lock().unwrap().clone();
        assert_eq!(seq_of(&requests[1]), 42);
    }

    #[tokio::test]
    async fn test_polling_replaces_cache_wholesale() {
        let transport = ScriptedTransport::new(vec![
            Ok(game_state(&[("alice", 0, 0), ("bob", 1, 1), ("carol", 2, 2)])),
        ])
        .with_fallback(game_state(&[("alice", 0, 0), ("bob", 5, 5)]));
        let mut session = Session::new("alice", transport, fast_config());
        session.start_polling();

        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                let remote = session.remote_players().await;
                if remote.len() == 1 && remote["bob"].position() == (5, 5) {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("cache never caught up");

        assert!(session.snapshot().await.get("carol").is_none());
        assert!(session.snapshot().await.get("alice").is_some());
        session.stop_polling().await;
        assert_eq!(session.poll_status(), PollStatus::Stopped);
    }

    #[tokio::test]
    async fn test_polling_gives_up_after_consecutive_failures() {
        let transport = ScriptedTransport::new(vec![
            Ok(game_state(&[("bob", 1, 1)])),
            Err(RpcError::ConnectionClosed),
        ]);
        let mut session = Session::new("alice", transport, fast_config());
        session.start_polling();

        wait_for_status(&session, PollStatus::Desynchronized).await;
        assert!(session.is_desynchronized());

        // The cache keeps the last good snapshot.
        assert_eq!(session.remote_players().await["bob"].position(), (1, 1));
        // 1 success + 3 failures, then nothing more.
        let calls = session.transport.requests.lock().unwrap().len();
        assert_eq!(calls, 4);
    }

    #[tokio::test]
    async fn test_poll_success_resets_failure_count() {
        // Two failures, a success, two more failures: never three in a row.
        let transport = ScriptedTransport::new(vec![
            Err(RpcError::ConnectionClosed),
            Err(RpcError::ConnectionClosed),
            Ok(game_state(&[("bob", 1, 1)])),
            Err(RpcError::ConnectionClosed),
            Err(RpcError::ConnectionClosed),
        ])
        .with_fallback(game_state(&[("bob", 2, 2)]));
        let mut session = Session::new("alice", transport, fast_config());
        session.start_polling();

        tokio::time::timeout(Duration::from_secs(2), async {
            while session.transport.requests.lock().unwrap().len() < 7 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("polling stalled");

        assert_eq!(session.poll_status(), PollStatus::Running);
        session.stop_polling().await;
    }

    #[tokio::test]
    async fn test_moves_unaffected_by_desynchronized_polling() {
        let transport = ScriptedTransport::new(vec![
            Err(RpcError::ConnectionClosed),
            Err(RpcError::ConnectionClosed),
            Err(RpcError::ConnectionClosed),
        ])
        .with_fallback(Packet::MoveReply { applied: true });
        let mut session = Session::new("alice", transport, fast_config());
        session.start_polling();
        wait_for_status(&session, PollStatus::Desynchronized).await;

        assert_eq!(
            session.submit_move(1, 2).await,
            MoveOutcome::Accepted { applied: true }
        );
    }

    #[tokio::test]
    async fn test_close_unregisters_then_closes() {
        let transport = ScriptedTransport::new(vec![Ok(Packet::UnregisterReply)]);
        let session = Session::new("alice", transport, fast_config());
        let transport = Arc::clone(&session.transport);

        session.close().await;

        let requests = transport.requests.lock().unwrap().clone();
        assert_eq!(
            requests,
            vec![Packet::UnregisterPlayer {
                player_id: "alice".to_string()
            }]
        );
        assert!(*transport.closed.lock().unwrap());
    }

    #[tokio::test]
    async fn test_close_tolerates_failed_unregister() {
        let transport = ScriptedTransport::new(vec![Err(RpcError::ConnectionClosed)]);
        let session = Session::new("alice", transport, fast_config());
        let transport = Arc::clone(&session.transport);

        session.close().await;
        assert!(*transport.closed.lock().unwrap());
    }
}
