// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Agent orchestration: transaction intake, server-pushed settings and the
//! harvest cycle.
//!
//! [`AgentHandle`] is the synchronous side used by instrumentation. Finished
//! transactions are merged straight into the live metrics under a lock, so a
//! transaction lands either entirely before or entirely after a harvest swap.
//! [`AgentService`] owns the collector connection and runs the harvest timer.

use crate::collector::connection::{CollectorConnection, ConnectionNotice, ConnectionState};
use crate::collector::{AppInfo, CollectorApi, ConnectResponse, MetricDataPayload};
use crate::config::Config;
use crate::constants::{NOTICE_CHANNEL_SIZE, UNKNOWN_SCOPE};
use crate::error_aggregator::{ErrorAggregator, NoticedError, TracedError};
use crate::errors::{CollectorError, ConnectionError, HarvestError, RuleError};
use crate::mapper::MetricMapper;
use crate::metric::{ApdexStats, Stats};
use crate::metrics::Metrics;
use crate::normalizer::{MetricNormalizer, Normalized};
use crate::trace_aggregator::TraceAggregator;
use crate::transaction::{Transaction, TransactionContext, TransactionKind};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::{Duration, SystemTime};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Settings the collector can push while a session is up.
#[derive(Clone, Debug, PartialEq)]
pub enum ServerEvent {
    ApdexT(f64),
    /// A full URL rule list, replacing the active one.
    NormalizationRules(Value),
    /// A partial name to id mapping, merged into the current one.
    MetricIds(Value),
}

#[derive(Debug)]
pub enum AgentCommand {
    HarvestNow(oneshot::Sender<Result<(), HarvestError>>),
    Shutdown(oneshot::Sender<()>),
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct AgentShared {
    config: Config,
    metrics: Mutex<Metrics>,
    errors: Mutex<ErrorAggregator>,
    traces: Mutex<TraceAggregator>,
    mapper: Mutex<MetricMapper>,
    normalizer: RwLock<Arc<MetricNormalizer>>,
    next_id: AtomicU64,
    /// Set once the connection is Failed; intake stops.
    disabled: AtomicBool,
}

impl AgentShared {
    fn new(config: Config) -> Self {
        Self {
            metrics: Mutex::new(Metrics::new(config.apdex_t)),
            errors: Mutex::new(ErrorAggregator::new(config.max_traced_errors)),
            traces: Mutex::new(TraceAggregator::new(
                config.top_n_traces,
                config.trace_threshold,
            )),
            mapper: Mutex::new(MetricMapper::default()),
            normalizer: RwLock::new(Arc::new(MetricNormalizer::default())),
            next_id: AtomicU64::new(1),
            disabled: AtomicBool::new(false),
            config,
        }
    }

    fn normalizer(&self) -> Arc<MetricNormalizer> {
        Arc::clone(&self.normalizer.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Replaces the live collection with an empty one and returns the old one.
    fn swap_metrics(&self) -> Metrics {
        let mut live = lock(&self.metrics);
        let fresh = Metrics::new(live.apdex_t());
        std::mem::replace(&mut *live, fresh)
    }

    fn apply(&self, event: ServerEvent) {
        match event {
            ServerEvent::ApdexT(apdex_t) if apdex_t.is_finite() && apdex_t > 0.0 => {
                lock(&self.metrics).set_apdex_t(apdex_t);
                info!("apdexT set to {apdex_t}");
            }
            ServerEvent::ApdexT(apdex_t) => warn!("Ignoring invalid apdexT {apdex_t}"),
            ServerEvent::NormalizationRules(rules) => match MetricNormalizer::from_value(&rules) {
                Ok(normalizer) => {
                    info!("Loaded {} url rules", normalizer.len());
                    *self
                        .normalizer
                        .write()
                        .unwrap_or_else(PoisonError::into_inner) = Arc::new(normalizer);
                }
                Err(RuleError::Null) => debug!("Received null url rules, keeping active rules"),
                Err(err) => warn!("Ignoring url rules: {err}"),
            },
            ServerEvent::MetricIds(ids) => match lock(&self.mapper).load(&ids) {
                Ok(_) => {}
                Err(RuleError::Null) => debug!("Received null metric ids"),
                Err(err) => warn!("Ignoring metric ids: {err}"),
            },
        }
    }

    fn apply_connect_response(&self, response: ConnectResponse) {
        if let Some(apdex_t) = response.apdex_t {
            self.apply(ServerEvent::ApdexT(apdex_t));
        }
        if let Some(rules) = response.url_rules {
            self.apply(ServerEvent::NormalizationRules(rules));
        }
        if let Some(ids) = response.metric_id_rules {
            self.apply(ServerEvent::MetricIds(ids));
        }
    }

    fn finish(&self, mut transaction: Transaction) {
        if self.disabled.load(Ordering::Relaxed) {
            return;
        }
        if !transaction.is_ended() {
            transaction.end();
        }
        let Some(scope) = transaction_scope(&transaction, &self.normalizer()) else {
            debug!("Ignoring transaction {}", transaction.name());
            return;
        };

        let mut scoped = Metrics::new(0.0);
        transaction.record_metrics(Some(&scope), &mut scoped);
        let apdex_t = {
            let mut live = lock(&self.metrics);
            live.merge(&scoped);
            transaction.record_apdex(&scope, &mut live);
            live.apdex_t()
        };

        if self.config.transaction_tracer_enabled {
            lock(&self.traces).offer(&transaction, &scope, apdex_t);
        }
        if self.config.error_collector_enabled {
            self.collect_errors(&mut transaction, &scope);
        }
    }

    fn collect_errors(&self, transaction: &mut Transaction, scope: &str) {
        let mut errors = transaction.take_errors();
        // With the noticed errors taken, only the response status is left.
        if errors.is_empty() && transaction.is_error() {
            if let Some(status) = transaction.status_code() {
                errors.push(NoticedError::new(format!("HttpError {status}"), "HttpError"));
            }
        }
        if errors.is_empty() {
            return;
        }
        let mut aggregator = lock(&self.errors);
        for error in errors {
            let traced = TracedError::new(scope, error);
            let traced = if transaction.is_web() {
                traced.with_request_uri(transaction.path())
            } else {
                traced
            };
            aggregator.add(traced);
        }
    }
}

/// Metric name of a finished transaction, or `None` when a rule ignores it.
fn transaction_scope(transaction: &Transaction, normalizer: &MetricNormalizer) -> Option<String> {
    match transaction.kind() {
        TransactionKind::Web => {
            let path = transaction.path();
            let path = if path.starts_with('/') {
                path.to_string()
            } else {
                format!("/{path}")
            };
            match normalizer.normalize(&path) {
                Normalized::Unchanged(path) => Some(format!("WebTransaction/Uri{path}")),
                Normalized::Renamed(path) => Some(format!("WebTransaction/NormalizedUri{path}")),
                Normalized::Ignored => None,
            }
        }
        TransactionKind::Background => normalizer
            .normalize(transaction.name())
            .name()
            .map(|name| format!("OtherTransaction/{name}")),
    }
}

/// Cheaply cloneable entry point for instrumentation.
#[derive(Clone)]
pub struct AgentHandle {
    shared: Arc<AgentShared>,
    tx: mpsc::UnboundedSender<AgentCommand>,
    state: watch::Receiver<ConnectionState>,
}

impl AgentHandle {
    /// Starts a transaction and returns the context that carries it.
    pub fn create_transaction(
        &self,
        kind: TransactionKind,
        name: impl Into<String>,
    ) -> TransactionContext {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        TransactionContext::new(Transaction::new(id, kind, name))
    }

    pub fn web_transaction(&self, url: impl Into<String>) -> TransactionContext {
        self.create_transaction(TransactionKind::Web, url)
    }

    pub fn background_transaction(&self, name: impl Into<String>) -> TransactionContext {
        self.create_transaction(TransactionKind::Background, name)
    }

    /// Rolls a finished transaction into the live metrics, trace and error
    /// aggregators. Never fails.
    pub fn transaction_finished(&self, transaction: Transaction) {
        self.shared.finish(transaction);
    }

    /// Ends the context's transaction, if any, and hands it to the agent.
    pub fn finish(&self, context: &mut TransactionContext) {
        if let Some(transaction) = context.finish() {
            self.transaction_finished(transaction);
        }
    }

    /// Records an error raised outside of any transaction.
    pub fn notice_error(&self, error: NoticedError) {
        let shared = &self.shared;
        if shared.disabled.load(Ordering::Relaxed) || !shared.config.error_collector_enabled {
            return;
        }
        lock(&shared.errors).add(TracedError::new(UNKNOWN_SCOPE, error));
    }

    pub fn apply_server_event(&self, event: ServerEvent) {
        self.shared.apply(event);
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    pub fn apdex_t(&self) -> f64 {
        lock(&self.shared.metrics).apdex_t()
    }

    /// Aggregate recorded in the current harvest window.
    pub fn live_stats(&self, name: &str, scope: Option<&str>) -> Option<Stats> {
        lock(&self.shared.metrics).get(name, scope).copied()
    }

    pub fn live_apdex(&self, name: &str) -> Option<ApdexStats> {
        lock(&self.shared.metrics).get_apdex(name).copied()
    }

    pub fn pending_errors(&self) -> usize {
        lock(&self.shared.errors).len()
    }

    pub async fn harvest_now(&self) -> Result<(), HarvestError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.tx
            .send(AgentCommand::HarvestNow(response_tx))
            .map_err(|_| HarvestError::Stopped)?;
        response_rx.await.map_err(|_| HarvestError::Stopped)?
    }

    /// Runs a final harvest, sends the shutdown notice and stops the
    /// service. Returns immediately when the service already stopped.
    pub async fn shutdown(&self) {
        let (response_tx, response_rx) = oneshot::channel();
        if self.tx.send(AgentCommand::Shutdown(response_tx)).is_err() {
            return;
        }
        if response_rx.await.is_err() {
            debug!("Agent service stopped before acknowledging shutdown");
        }
    }
}

pub struct AgentService {
    shared: Arc<AgentShared>,
    connection: CollectorConnection,
    rx: mpsc::UnboundedReceiver<AgentCommand>,
    cancel: CancellationToken,
}

impl AgentService {
    pub fn new(config: Config, api: Arc<dyn CollectorApi>) -> (Self, AgentHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let connection = CollectorConnection::new(api, AppInfo::from_config(&config));
        let shared = Arc::new(AgentShared::new(config));

        let handle = AgentHandle {
            shared: Arc::clone(&shared),
            tx,
            state: connection.subscribe(),
        };
        let service = Self {
            shared,
            connection,
            rx,
            cancel: CancellationToken::new(),
        };
        (service, handle)
    }

    /// Receives a notice on every connection state change.
    pub fn notices(&mut self) -> mpsc::Receiver<ConnectionNotice> {
        let (tx, rx) = mpsc::channel(NOTICE_CHANNEL_SIZE);
        self.connection.set_notices(tx);
        rx
    }

    /// Cancelling the token shuts the service down like
    /// [`AgentHandle::shutdown`].
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn run(mut self) {
        debug!("Agent service started");
        self.connect().await;

        // A zero period would make the interval panic.
        let period = self.shared.config.harvest_interval.max(Duration::from_millis(1));
        let mut harvest = interval(period);
        harvest.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        harvest.tick().await;

        loop {
            if self.connection.state() == ConnectionState::Failed {
                error!("Collector connection failed, the agent stopped reporting");
                self.shared.disabled.store(true, Ordering::Relaxed);
                break;
            }
            tokio::select! {
                _ = harvest.tick() => match self.harvest().await {
                    Ok(()) => {}
                    Err(HarvestError::NotConnected) => debug!("Skipping harvest, not connected"),
                    Err(err) => warn!("Harvest failed: {err}"),
                },
                () = self.connection.retry_due() => self.connect().await,
                () = self.cancel.cancelled() => {
                    self.shutdown().await;
                    break;
                }
                command = self.rx.recv() => match command {
                    Some(AgentCommand::HarvestNow(response_tx)) => {
                        let result = self.harvest().await;
                        if response_tx.send(result).is_err() {
                            debug!("Harvest requester went away");
                        }
                    }
                    Some(AgentCommand::Shutdown(response_tx)) => {
                        self.shutdown().await;
                        let _ = response_tx.send(());
                        break;
                    }
                    None => {
                        self.shutdown().await;
                        break;
                    }
                },
            }
        }
        debug!("Agent service stopped");
    }

    async fn connect(&mut self) {
        match self.connection.connect().await {
            Ok(response) => self.shared.apply_connect_response(response),
            Err(ConnectionError::InvalidState(state)) => debug!("Not connecting while {state}"),
            Err(err) => debug!("Connect attempt failed: {err}"),
        }
    }

    /// Ships the current window. Whatever fails to send is dropped.
    async fn harvest(&mut self) -> Result<(), HarvestError> {
        let Some(run_id) = self.connection.run_id().map(str::to_string) else {
            return Err(HarvestError::NotConnected);
        };

        let metrics = self.shared.swap_metrics();
        let errors = lock(&self.shared.errors).take();
        let traces = lock(&self.shared.traces).take();
        let payload =
            MetricDataPayload::new(&metrics, SystemTime::now(), &lock(&self.shared.mapper));
        debug!(
            "Harvesting {} metrics, {} errors, {} traces",
            payload.entries.len(),
            errors.len(),
            traces.len()
        );

        let api = Arc::clone(self.connection.api());
        if !payload.is_empty() {
            match api.send_metric_data(&run_id, &payload).await {
                Ok(Some(ids)) => self.shared.apply(ServerEvent::MetricIds(ids)),
                Ok(None) => {}
                Err(source) => return Err(self.harvest_failed("metric_data", source)),
            }
        }
        if !errors.is_empty() {
            if let Err(source) = api.send_traced_errors(&run_id, &errors).await {
                return Err(self.harvest_failed("error_data", source));
            }
        }
        if !traces.is_empty() {
            if let Err(source) = api.send_transaction_traces(&run_id, &traces).await {
                return Err(self.harvest_failed("transaction_sample_data", source));
            }
        }
        Ok(())
    }

    fn harvest_failed(&mut self, endpoint: &'static str, source: CollectorError) -> HarvestError {
        match source {
            CollectorError::ForceRestart(_) => self.connection.restart(),
            CollectorError::ForceDisconnect(_) => {
                self.connection.force_disconnect();
                self.shared.disabled.store(true, Ordering::Relaxed);
            }
            _ => {}
        }
        HarvestError::Transport { endpoint, source }
    }

    async fn shutdown(&mut self) {
        info!("Shutting down agent");
        match self.harvest().await {
            Ok(()) | Err(HarvestError::NotConnected) => {}
            Err(err) => warn!("Final harvest failed: {err}"),
        }
        self.connection.shutdown().await;
    }
}
