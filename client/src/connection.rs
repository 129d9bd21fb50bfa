//! Getting from "no connection" to a registered, polling session.
//!
//! [`ConnectionManager::establish`] dials the server with exponential backoff,
//! registers the player, and hands back a [`Session`] with polling running.
//! If registration keeps failing on one connection it drops that connection
//! and starts over on a fresh one, a bounded number of times.

use crate::config::{BackoffConfig, ClientConfig};
use crate::network::{RpcClient, RpcError};
use crate::session::{RegisterError, Session};
use log::{error, info, warn};
use rand::Rng;
use shared::DEFAULT_PORT;
use std::net::Ipv6Addr;
use std::time::Duration;
use tokio::sync::{broadcast, watch};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Registering,
    /// Registered and polling.
    Active,
    /// Gave up. Terminal.
    Failed,
}

/// Exponential backoff with optional jitter and a bounded number of retries.
pub struct Backoff {
    config: BackoffConfig,
    retries: u32,
    current_delay: Duration,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        let base = config.base_delay;
        Self {
            config,
            retries: 0,
            current_delay: base,
        }
    }

    /// Delay before the next retry, or `None` once retries are used up.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.retries >= self.config.max_retries {
            return None;
        }

        let base = self.current_delay;
        self.retries += 1;

        let jittered = if self.config.jitter > 0.0 {
            let spread = self.config.jitter.min(1.0);
            let factor = rand::thread_rng().gen_range((1.0 - spread)..=(1.0 + spread));
            base.mul_f64(factor)
        } else {
            base
        };

        self.current_delay = self
            .current_delay
            .mul_f64(self.config.multiplier)
            .min(self.config.max_delay);

        Some(jittered.min(self.config.max_delay))
    }

    pub fn reset(&mut self) {
        self.retries = 0;
        self.current_delay = self.config.base_delay;
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("server {addr} unreachable after {attempts} attempts")]
    Unreachable {
        addr: String,
        attempts: u32,
        #[source]
        source: RpcError,
    },

    #[error("registration of {player_id} failed on {rounds} connections")]
    RegistrationExhausted {
        player_id: String,
        rounds: u32,
        #[source]
        source: RegisterError,
    },
}

/// Appends the default port to `addr` unless it already names one.
pub fn with_default_port(addr: &str) -> String {
    let addr = addr.trim();

    if addr.starts_with('[') {
        return if addr.ends_with(']') {
            format!("{}:{}", addr, DEFAULT_PORT)
        } else {
            addr.to_string()
        };
    }
    if addr.parse::<Ipv6Addr>().is_ok() {
        return format!("[{}]:{}", addr, DEFAULT_PORT);
    }
    match addr.rsplit_once(':') {
        Some((_, port)) if port.parse::<u16>().is_ok() => addr.to_string(),
        _ => format!("{}:{}", addr, DEFAULT_PORT),
    }
}

pub struct ConnectionManager {
    addr: String,
    player_id: String,
    config: ClientConfig,
    state_tx: watch::Sender<ConnectionState>,
    /// Every transition in order; the watch above only keeps the latest.
    event_tx: broadcast::Sender<ConnectionState>,
}

impl ConnectionManager {
    pub fn new(addr: &str, player_id: impl Into<String>, config: ClientConfig) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (event_tx, _) = broadcast::channel(64);
        Self {
            addr: with_default_port(addr),
            player_id: player_id.into(),
            config,
            state_tx,
            event_tx,
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Stream of state transitions, starting with the next one.
    pub fn transitions(&self) -> broadcast::Receiver<ConnectionState> {
        self.event_tx.subscribe()
    }

    fn set_state(&self, state: ConnectionState) {
        self.state_tx.send_replace(state);
        // No subscribers is fine.
        let _ = self.event_tx.send(state);
    }

    /// Connects, registers and starts polling.
    ///
    /// Fails only once every connection attempt, or every registration round,
    /// has been used up. The state is then [`ConnectionState::Failed`].
    pub async fn establish(&self) -> Result<Session<RpcClient>, ConnectError> {
        let rounds = self.config.registration_rounds.max(1);
        let mut round = 1;
        let mut backoff = Backoff::new(self.config.connect.clone());

        loop {
            let client = match self.connect(&mut backoff).await {
                Ok(client) => client,
                Err(e) => {
                    error!("{}", e);
                    self.set_state(ConnectionState::Failed);
                    return Err(e);
                }
            };

            self.set_state(ConnectionState::Registering);
            let mut session =
                Session::new(self.player_id.clone(), client, self.config.session.clone());

            match session.register().await {
                Ok(()) => {
                    session.start_polling();
                    self.set_state(ConnectionState::Active);
                    return Ok(session);
                }
                Err(e) if round < rounds => {
                    warn!("{}; reconnecting (round {}/{})", e, round, rounds);
                    session.abandon().await;
                    round += 1;
                }
                Err(e) => {
                    session.abandon().await;
                    self.set_state(ConnectionState::Failed);
                    let err = ConnectError::RegistrationExhausted {
                        player_id: self.player_id.clone(),
                        rounds,
                        source: e,
                    };
                    error!("{}", err);
                    return Err(err);
                }
            }
        }
    }

    /// Dials until connected or `backoff` runs out. A success resets it for
    /// the next round.
    async fn connect(&self, backoff: &mut Backoff) -> Result<RpcClient, ConnectError> {
        self.set_state(ConnectionState::Connecting);

        loop {
            match RpcClient::connect(&self.addr, self.config.frame.clone()).await {
                Ok(client) => {
                    info!(
                        "Connected to {} after {} retries",
                        client.peer_addr(),
                        backoff.retries()
                    );
                    backoff.reset();
                    self.set_state(ConnectionState::Connected);
                    return Ok(client);
                }
                Err(e) => match backoff.next_delay() {
                    Some(delay) => {
                        warn!(
                            "Connection attempt {} failed: {}; retrying in {:?}",
                            backoff.retries(),
                            e,
                            delay
                        );
                        tokio::time::sleep(delay).await;
                    }
                    None => {
                        return Err(ConnectError::Unreachable {
                            addr: self.addr.clone(),
                            attempts: backoff.retries() + 1,
                            source: e,
                        });
                    }
                },
            }
        }
    }
}
