// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Session lifecycle with the collector.
//!
//! State changes go through a single transition table keyed by
//! `(state, event)`. Entering a state publishes the new state on a watch
//! channel and a [`ConnectionNotice`] on the notice channel; neither drives
//! the machine. At most one retry timer is armed at a time.

use crate::collector::backoff::Backoff;
use crate::collector::{AppInfo, CollectorApi, ConnectResponse};
use crate::errors::{CollectorError, ConnectionError};
use derive_more::Display;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Clone, Copy, Debug, Display, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Retrying,
    /// Terminal. Only a restart of the process leaves this state.
    Failed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connect,
    HandshakeSucceeded,
    ConnectionFailed,
    RetryBudgetExhausted,
    /// The collector asked for a new session.
    Restart,
    ForceDisconnect,
    Shutdown,
}

impl ConnectionState {
    /// The transition table. `None` means the event is not valid in this state.
    pub fn next(self, event: ConnectionEvent) -> Option<ConnectionState> {
        use ConnectionEvent as E;
        use ConnectionState as S;
        match (self, event) {
            (S::Disconnected | S::Retrying, E::Connect) => Some(S::Connecting),
            (S::Connecting, E::HandshakeSucceeded) => Some(S::Connected),
            (S::Connecting | S::Connected, E::ConnectionFailed) => Some(S::Retrying),
            (S::Connected, E::Restart) => Some(S::Retrying),
            (S::Retrying, E::RetryBudgetExhausted) => Some(S::Failed),
            (S::Connecting | S::Connected | S::Retrying, E::ForceDisconnect) => Some(S::Failed),
            (S::Connecting | S::Connected | S::Retrying, E::Shutdown) => Some(S::Disconnected),
            _ => None,
        }
    }
}

/// Published on every state entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnectionNotice {
    Connecting,
    Connected { run_id: String },
    Retrying { backoff: Backoff },
    Failed,
    Disconnected,
}

/// An armed retry timer. Dropping it does not cancel the task; `cancel` does.
#[derive(Debug)]
struct RetryTimer {
    generation: u64,
    cancel: CancellationToken,
}

pub struct CollectorConnection {
    api: Arc<dyn CollectorApi>,
    app: AppInfo,
    state: watch::Sender<ConnectionState>,
    notices: Option<mpsc::Sender<ConnectionNotice>>,
    failures: u32,
    backoff: Option<Backoff>,
    run_id: Option<String>,
    retry: Option<RetryTimer>,
    generation: u64,
    retry_tx: mpsc::Sender<u64>,
    retry_rx: mpsc::Receiver<u64>,
}

impl CollectorConnection {
    pub fn new(api: Arc<dyn CollectorApi>, app: AppInfo) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (retry_tx, retry_rx) = mpsc::channel(1);
        Self {
            api,
            app,
            state,
            notices: None,
            failures: 0,
            backoff: None,
            run_id: None,
            retry: None,
            generation: 0,
            retry_tx,
            retry_rx,
        }
    }

    #[must_use]
    pub fn with_notices(mut self, notices: mpsc::Sender<ConnectionNotice>) -> Self {
        self.set_notices(notices);
        self
    }

    pub fn set_notices(&mut self, notices: mpsc::Sender<ConnectionNotice>) {
        self.notices = Some(notices);
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn api(&self) -> &Arc<dyn CollectorApi> {
        &self.api
    }

    /// Session token of the current connection.
    pub fn run_id(&self) -> Option<&str> {
        self.run_id.as_deref()
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Backoff computed for the last failure, cleared on a successful connect.
    pub fn backoff(&self) -> Option<Backoff> {
        self.backoff
    }

    pub fn has_pending_retry(&self) -> bool {
        self.retry.is_some()
    }

    /// Performs the handshake. On failure the machine moves to Retrying with
    /// a retry timer armed, or to Failed once the retry budget is spent.
    pub async fn connect(&mut self) -> Result<ConnectResponse, ConnectionError> {
        if !self.transition(ConnectionEvent::Connect) {
            return Err(ConnectionError::InvalidState(self.state()));
        }
        self.cancel_retry();

        match self.api.connect(&self.app).await {
            Ok(response) => {
                self.failures = 0;
                self.backoff = None;
                self.run_id = Some(response.agent_run_id.clone());
                self.transition(ConnectionEvent::HandshakeSucceeded);
                info!("Connected to collector with run id {}", response.agent_run_id);
                Ok(response)
            }
            Err(CollectorError::ForceDisconnect(message)) => {
                self.force_disconnect();
                Err(ConnectionError::Handshake(CollectorError::ForceDisconnect(
                    message,
                )))
            }
            Err(err) => {
                warn!("Failed to connect to collector: {err}");
                let backoff = self.handle_failure();
                if backoff.error {
                    Err(ConnectionError::RetryBudgetExhausted(self.failures))
                } else {
                    Err(ConnectionError::Handshake(err))
                }
            }
        }
    }

    /// Records a connection error and schedules the next attempt.
    pub fn handle_failure(&mut self) -> Backoff {
        if self.state().next(ConnectionEvent::ConnectionFailed).is_none() {
            debug!("Ignoring connection failure while {}", self.state());
            return self.backoff.unwrap_or(Backoff::ZERO);
        }
        let backoff = Backoff::for_failures(self.failures);
        self.failures = self.failures.saturating_add(1);
        self.backoff = Some(backoff);
        self.run_id = None;
        self.transition(ConnectionEvent::ConnectionFailed);

        if backoff.error {
            error!(
                "Giving up on the collector after {} consecutive failures",
                self.failures
            );
            self.cancel_retry();
            self.transition(ConnectionEvent::RetryBudgetExhausted);
        } else {
            if backoff.warn {
                warn!(
                    "Collector unreachable after {} attempts, retrying in {:?}",
                    self.failures, backoff.interval
                );
            } else {
                info!("Retrying collector connection in {:?}", backoff.interval);
            }
            self.schedule_retry(backoff.interval);
        }
        backoff
    }

    /// Drops the session and reconnects immediately. The failure counter is
    /// left untouched.
    pub fn restart(&mut self) {
        self.run_id = None;
        self.backoff = Some(Backoff::ZERO);
        if self.transition(ConnectionEvent::Restart) {
            info!("Collector requested a restart, reconnecting");
            self.schedule_retry(Duration::ZERO);
        }
    }

    pub fn force_disconnect(&mut self) {
        self.run_id = None;
        self.cancel_retry();
        if self.transition(ConnectionEvent::ForceDisconnect) {
            error!("Collector requested a disconnect, no longer reporting");
        }
    }

    /// Sends the shutdown notice when connected, then closes the session.
    pub async fn shutdown(&mut self) {
        self.cancel_retry();
        if let Some(run_id) = self.run_id.take() {
            if let Err(err) = self.api.shutdown(&run_id).await {
                warn!("Failed to send shutdown notice: {err}");
            }
        }
        self.transition(ConnectionEvent::Shutdown);
    }

    /// Resolves when the armed retry timer fires. Pending forever when none
    /// is armed, so it can sit in a `select!` loop.
    pub async fn retry_due(&mut self) {
        loop {
            match self.retry_rx.recv().await {
                Some(generation) if self.retry_is(generation) => {
                    self.retry = None;
                    return;
                }
                Some(stale) => debug!("Ignoring stale retry timer {stale}"),
                None => std::future::pending::<()>().await,
            }
        }
    }

    fn retry_is(&self, generation: u64) -> bool {
        self.retry
            .as_ref()
            .is_some_and(|retry| retry.generation == generation)
    }

    fn schedule_retry(&mut self, delay: Duration) {
        self.cancel_retry();
        self.generation = self.generation.wrapping_add(1);
        let generation = self.generation;
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let tx = self.retry_tx.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = token.cancelled() => {}
                () = tokio::time::sleep(delay) => {
                    let _ = tx.send(generation).await;
                }
            }
        });
        self.retry = Some(RetryTimer { generation, cancel });
    }

    fn cancel_retry(&mut self) {
        if let Some(retry) = self.retry.take() {
            retry.cancel.cancel();
        }
    }

    fn transition(&mut self, event: ConnectionEvent) -> bool {
        let current = self.state();
        let Some(next) = current.next(event) else {
            debug!("Ignoring {event:?} while {current}");
            return false;
        };
        self.state.send_replace(next);
        self.publish(next);
        true
    }

    fn publish(&self, state: ConnectionState) {
        let Some(notices) = &self.notices else {
            return;
        };
        let notice = match state {
            ConnectionState::Disconnected => ConnectionNotice::Disconnected,
            ConnectionState::Connecting => ConnectionNotice::Connecting,
            ConnectionState::Connected => ConnectionNotice::Connected {
                run_id: self.run_id.clone().unwrap_or_default(),
            },
            ConnectionState::Retrying => ConnectionNotice::Retrying {
                backoff: self.backoff.unwrap_or(Backoff::ZERO),
            },
            ConnectionState::Failed => ConnectionNotice::Failed,
        };
        if let Err(err) = notices.try_send(notice) {
            warn!("Dropping connection notice: {err}");
        }
    }
}

impl Drop for CollectorConnection {
    fn drop(&mut self) {
        self.cancel_retry();
    }
}
