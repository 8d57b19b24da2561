//! Ships configurations to a data-plane worker.
//!
//! A [`Distributor`] is a handle to a task that owns the worker connection. The task is the only
//! writer to the stream; [`Distributor::apply`] hands it a configuration and waits for the task
//! to either write it or queue it. Failures that happen asynchronously (stream errors, rejected
//! envelopes, staleness) are reported on the error channel returned by [`Distributor::spawn`].
//!
//! The connection moves between three states:
//!
//! ```text
//! Disconnected --(connect ok)--> Connected --(stream error, send failure)--> Disconnected
//!       \--(repeated authentication failure)--> Closed --(reset)--> Disconnected
//! ```
//!
//! While disconnected, exactly one connection attempt is in flight. Updates applied in the
//! meantime are folded into the current configuration, and every new connection starts with a
//! single `FullConfig` envelope carrying it.

use crate::{
    connect::{Connect, FeedbackStream},
    metrics::DistributorMetrics,
    proto,
};
use futures::{future, prelude::*};
use ingress_controller_core::{
    endpoint_changes, ChangeClass, Configuration, DynamicOp, EnvelopeKind, StreamEnvelope,
};
use std::{collections::VecDeque, pin::Pin, sync::Arc, time::Duration};
use tokio::{
    sync::{mpsc, oneshot},
    time::{self, Instant},
};
use tonic::{Code, Status};
use tracing::{debug, info, warn};


/// The number of sent envelopes remembered for matching peer feedback.
const SENT_HISTORY: usize = 64;

/// A handle to the distributor task.
#[derive(Clone, Debug)]
pub struct Distributor {
    commands: mpsc::Sender<Command>,
}

#[derive(Clone, Debug)]
pub struct Config {
    /// Names this controller to the worker.
    pub worker: String,

    /// Bounds how long a connection attempt may wait for the worker to answer.
    pub connect_timeout: Duration,

    /// Bounds how long a write may wait for stream capacity.
    pub send_timeout: Duration,

    pub backoff: Backoff,

    /// How long an update may remain undelivered before `Stale` is reported.
    pub max_staleness: Duration,

    /// Consecutive authentication failures after which the distributor closes.
    pub max_auth_failures: u32,

    /// The number of envelopes buffered in front of the stream.
    pub buffer: usize,
}

/// Exponential reconnect backoff.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Backoff {
    pub min: Duration,
    pub max: Duration,
}

/// Applies configurations that the stream cannot deliver, such as files on disk.
#[async_trait::async_trait]
pub trait Reload: Send + Sync + 'static {
    async fn reload(&self, config: Arc<Configuration>) -> anyhow::Result<()>;
}

/// A [`Reload`] that does nothing.
#[derive(Copy, Clone, Debug, Default)]
pub struct NoReload;

/// The outcome of an accepted [`Distributor::apply`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ApplyStatus {
    /// Nothing needed to be sent.
    Unchanged,

    /// The envelope was written to the stream.
    Sent { version: u64 },

    /// The worker is unreachable; the configuration is sent in full once it reconnects.
    Queued,
}

#[derive(Debug, thiserror::Error)]
pub enum ApplyError {
    #[error("distributor is closed")]
    Closed,

    #[error("failed to encode envelope: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Failures reported on the error channel.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum DistributorError {
    #[error("failed to connect: {0}")]
    ConnectFailed(String),

    #[error("send did not complete within {0:?}")]
    SendTimeout(Duration),

    #[error("stream closed: {0}")]
    StreamClosed(String),

    #[error("worker rejected {kind} envelope {version}: {reason}")]
    RejectedByPeer {
        version: u64,
        kind: EnvelopeKind,
        reason: String,
    },

    #[error("authentication failed {attempts} consecutive times: {message}")]
    AuthenticationFailed { attempts: u32, message: String },

    #[error("configuration has not been delivered for {0:?}")]
    Stale(Duration),

    #[error("local reload failed: {0}")]
    ReloadFailed(String),

    /// The final report before the distributor stops.
    #[error("distributor closed")]
    Closed,
}

enum Command {
    Apply {
        change: ChangeClass,
        config: Arc<Configuration>,
        rsp: oneshot::Sender<Result<ApplyStatus, ApplyError>>,
    },
    Reset {
        rsp: oneshot::Sender<()>,
    },
}

type Connecting = Pin<Box<dyn Future<Output = Result<Connection, Status>> + Send>>;

struct Connection {
    envelopes: mpsc::Sender<proto::Envelope>,
    feedback: FeedbackStream,
}

enum State {
    Disconnected { connecting: Connecting },
    Connected(Connection),
    Closed,
}

enum Event {
    Shutdown,
    Command(Command),
    Connected(Result<Connection, Status>),
    Feedback(Option<Result<proto::Feedback, Status>>),
    Stale,
}

struct Task<C, R> {
    config: Config,
    connector: Arc<C>,
    reload: R,
    metrics: DistributorMetrics,
    errors: mpsc::UnboundedSender<DistributorError>,

    state: State,
    attempt: u32,
    auth_failures: u32,

    /// The latest configuration, including updates that have not been delivered.
    current: Option<Arc<Configuration>>,

    /// A configuration the worker refused as a `FullConfig`. It is not sent again.
    rejected: Option<Arc<Configuration>>,

    /// When the oldest undelivered update was applied.
    undelivered_since: Option<Instant>,
    stale_reported: bool,

    next_version: u64,
    sent: VecDeque<(u64, EnvelopeKind)>,
}

// === impl Distributor ===

impl Distributor {
    /// Spawns the distributor task.
    ///
    /// The task runs until `shutdown` is signaled or every handle is dropped. On shutdown it
    /// closes the stream and reports [`DistributorError::Closed`] as its final error.
    pub fn spawn<C, R>(
        config: Config,
        connector: C,
        reload: R,
        metrics: DistributorMetrics,
        shutdown: drain::Watch,
    ) -> (Self, mpsc::UnboundedReceiver<DistributorError>)
    where
        C: Connect,
        R: Reload,
    {
        let (commands, rx) = mpsc::channel(1);
        let (errors, errors_rx) = mpsc::unbounded_channel();
        let connector = Arc::new(connector);
        let connecting = connect(connector.clone(), &config, Duration::ZERO);
        let task = Task {
            config,
            connector,
            reload,
            metrics,
            errors,
            state: State::Disconnected { connecting },
            attempt: 0,
            auth_failures: 0,
            current: None,
            rejected: None,
            undelivered_since: None,
            stale_reported: false,
            next_version: 1,
            sent: VecDeque::with_capacity(SENT_HISTORY),
        };
        tokio::spawn(task.run(rx, shutdown));
        (Self { commands }, errors_rx)
    }

    /// Applies `next`, which differs from the previously applied configuration by `change`.
    ///
    /// Returns once the envelope has been written to the stream or queued for the next
    /// connection. Fails with [`ApplyError::Closed`] after a terminal error until
    /// [`Distributor::reset`] is called, and permanently after shutdown.
    pub async fn apply(
        &self,
        change: ChangeClass,
        next: Arc<Configuration>,
    ) -> Result<ApplyStatus, ApplyError> {
        let (rsp, rx) = oneshot::channel();
        self.commands
            .send(Command::Apply {
                change,
                config: next,
                rsp,
            })
            .await
            .map_err(|_| ApplyError::Closed)?;
        rx.await.map_err(|_| ApplyError::Closed)?
    }

    /// Clears a terminal condition and starts connecting again.
    pub async fn reset(&self) -> Result<(), ApplyError> {
        let (rsp, rx) = oneshot::channel();
        self.commands
            .send(Command::Reset { rsp })
            .await
            .map_err(|_| ApplyError::Closed)?;
        rx.await.map_err(|_| ApplyError::Closed)
    }
}

// === impl Backoff ===

impl Backoff {
    /// The delay before connection attempt `attempt`; the first attempt is immediate.
    pub fn delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let factor = 1u32.checked_shl(attempt - 1).unwrap_or(u32::MAX);
        self.min.saturating_mul(factor).min(self.max)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            min: Duration::from_millis(500),
            max: Duration::from_secs(30),
        }
    }
}

// === impl NoReload ===

#[async_trait::async_trait]
impl Reload for NoReload {
    async fn reload(&self, _: Arc<Configuration>) -> anyhow::Result<()> {
        Ok(())
    }
}

#[async_trait::async_trait]
impl<R: Reload + ?Sized> Reload for Arc<R> {
    async fn reload(&self, config: Arc<Configuration>) -> anyhow::Result<()> {
        (**self).reload(config).await
    }
}

// === impl DistributorError ===

impl DistributorError {
    /// Returns true if the distributor has stopped sending until it is reset.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::AuthenticationFailed { .. } | Self::Closed)
    }

    pub(crate) fn as_label(&self) -> &'static str {
        match self {
            Self::ConnectFailed(_) => "connect_failed",
            Self::SendTimeout(_) => "send_timeout",
            Self::StreamClosed(_) => "stream_closed",
            Self::RejectedByPeer { .. } => "rejected_by_peer",
            Self::AuthenticationFailed { .. } => "authentication_failed",
            Self::Stale(_) => "stale",
            Self::ReloadFailed(_) => "reload_failed",
            Self::Closed => "closed",
        }
    }
}

// === impl Task ===

impl<C: Connect, R: Reload> Task<C, R> {
    async fn run(mut self, mut commands: mpsc::Receiver<Command>, shutdown: drain::Watch) {
        tokio::pin! {
            let shutdown = shutdown.signaled();
        }

        let release = loop {
            let stale_at = self.stale_deadline();
            let event = tokio::select! {
                biased;

                release = &mut shutdown => break Some(release),

                // Connection changes are observed before the commands that follow them.
                event = connection_event(&mut self.state) => event,

                cmd = commands.recv() => match cmd {
                    Some(cmd) => Event::Command(cmd),
                    None => Event::Shutdown,
                },

                () = stale(stale_at) => Event::Stale,
            };

            if let Event::Shutdown = event {
                break None;
            }

            // Shutdown cancels a send or reload in progress.
            tokio::select! {
                biased;

                release = &mut shutdown => break Some(release),

                () = self.handle(event) => {}
            }
        };

        info!("Distributor shutting down");
        self.state = State::Closed;
        self.metrics.set_connected(false);
        let _ = self.errors.send(DistributorError::Closed);
        drop(release);
    }

    async fn handle(&mut self, event: Event) {
        match event {
            Event::Shutdown => {}
            Event::Command(Command::Apply {
                change,
                config,
                rsp,
            }) => {
                let res = self.apply(change, config).await;
                let _ = rsp.send(res);
            }
            Event::Command(Command::Reset { rsp }) => {
                self.reset();
                let _ = rsp.send(());
            }
            Event::Connected(res) => self.connected(res).await,
            Event::Feedback(msg) => self.feedback(msg).await,
            Event::Stale => self.stale(),
        }
    }

    async fn apply(
        &mut self,
        change: ChangeClass,
        next: Arc<Configuration>,
    ) -> Result<ApplyStatus, ApplyError> {
        if matches!(self.state, State::Closed) {
            return Err(ApplyError::Closed);
        }

        match change {
            ChangeClass::NoChange => {
                self.current = Some(next);
                Ok(ApplyStatus::Unchanged)
            }

            ChangeClass::Dynamic => {
                let prev = self.current.replace(next.clone());
                if !matches!(self.state, State::Connected(_)) {
                    return Ok(self.queued());
                }
                match prev {
                    Some(prev) if self.rejected.is_none() => {
                        let op = DynamicOp::UpdateEndpoints {
                            backends: endpoint_changes(&prev, &next),
                        };
                        self.send(|version| StreamEnvelope::Incremental { version, op })
                            .await
                    }
                    // The worker doesn't have a base to apply an increment to.
                    _ => self.send_full(next).await,
                }
            }

            ChangeClass::FullReload => {
                self.current = Some(next.clone());
                self.rejected = None;
                if let Err(error) = self.reload.reload(next.clone()).await {
                    warn!(%error, "Local reload failed");
                    self.report(DistributorError::ReloadFailed(error.to_string()));
                }
                if matches!(self.state, State::Connected(_)) {
                    self.send_full(next).await
                } else {
                    Ok(self.queued())
                }
            }
        }
    }

    fn reset(&mut self) {
        info!("Resetting distributor");
        self.auth_failures = 0;
        self.rejected = None;
        if !matches!(self.state, State::Connected(_)) {
            self.attempt = 0;
            self.state = State::Disconnected {
                connecting: connect(self.connector.clone(), &self.config, Duration::ZERO),
            };
        }
    }

    async fn connected(&mut self, res: Result<Connection, Status>) {
        let conn = match res {
            Ok(conn) => conn,
            Err(status) => {
                if is_auth_failure(&status) {
                    self.auth_failures += 1;
                    if self.auth_failures >= self.config.max_auth_failures {
                        self.close(status);
                        return;
                    }
                }
                warn!(code = ?status.code(), message = %status.message(), "Failed to connect");
                self.report(DistributorError::ConnectFailed(status.message().to_string()));
                self.reconnect();
                return;
            }
        };

        info!(worker = %self.config.worker, "Connected");
        self.state = State::Connected(conn);
        self.metrics.set_connected(true);
        self.attempt = 0;
        self.auth_failures = 0;
        self.stale_reported = false;

        // Catch the worker up with a single snapshot of the current state.
        let Some(current) = self.current.clone() else {
            return;
        };
        if self
            .rejected
            .as_ref()
            .is_some_and(|r| Arc::ptr_eq(r, &current))
        {
            debug!("Not resending a rejected configuration");
            self.undelivered_since = None;
            return;
        }
        if let Err(error) = self.send_full(current).await {
            warn!(%error, "Failed to send configuration");
        }
    }

    async fn feedback(&mut self, msg: Option<Result<proto::Feedback, Status>>) {
        let proto::Feedback { version, outcome } = match msg {
            Some(Ok(feedback)) => feedback,
            Some(Err(status)) => {
                if is_auth_failure(&status) {
                    self.auth_failures += 1;
                    if self.auth_failures >= self.config.max_auth_failures {
                        self.close(status);
                        return;
                    }
                }
                self.disconnect(DistributorError::StreamClosed(status.message().to_string()));
                return;
            }
            None => {
                self.disconnect(DistributorError::StreamClosed(
                    "stream ended by worker".to_string(),
                ));
                return;
            }
        };

        let kind = self
            .sent
            .iter()
            .find(|(v, _)| *v == version)
            .map(|(_, kind)| *kind);
        match outcome {
            Some(proto::feedback::Outcome::Applied(_)) => {
                debug!(version, "Worker applied configuration");
            }
            Some(proto::feedback::Outcome::Rejected(proto::Rejected { reason })) => {
                let Some(kind) = kind else {
                    warn!(version, %reason, "Worker rejected an unknown envelope");
                    return;
                };
                warn!(version, %kind, %reason, "Worker rejected envelope");
                self.report(DistributorError::RejectedByPeer {
                    version,
                    kind,
                    reason,
                });
                match kind {
                    // The worker's state is unknown; replace it wholesale.
                    EnvelopeKind::Incremental => {
                        if let Some(current) = self.current.clone() {
                            if let Err(error) = self.send_full(current).await {
                                warn!(%error, "Failed to send configuration");
                            }
                        }
                    }
                    // Sending the same configuration again would be rejected again.
                    EnvelopeKind::FullConfig => {
                        self.rejected = self.current.clone();
                    }
                }
            }
            None => debug!(version, "Ignoring empty feedback"),
        }
    }

    fn stale(&mut self) {
        let Some(since) = self.undelivered_since else {
            return;
        };
        self.stale_reported = true;
        let elapsed = since.elapsed();
        warn!(?elapsed, "Configuration is stale");
        self.report(DistributorError::Stale(elapsed));
    }

    fn stale_deadline(&self) -> Option<Instant> {
        if self.stale_reported || matches!(self.state, State::Connected(_)) {
            return None;
        }
        self.undelivered_since
            .map(|since| since + self.config.max_staleness)
    }

    async fn send_full(&mut self, config: Arc<Configuration>) -> Result<ApplyStatus, ApplyError> {
        self.send(|version| StreamEnvelope::FullConfig {
            version,
            configuration: config,
        })
        .await
    }

    /// Writes an envelope to the stream, disconnecting if the write fails or times out.
    async fn send(
        &mut self,
        mk: impl FnOnce(u64) -> StreamEnvelope,
    ) -> Result<ApplyStatus, ApplyError> {
        let envelopes = match &self.state {
            State::Connected(conn) => conn.envelopes.clone(),
            _ => return Ok(self.queued()),
        };

        let version = self.next_version;
        let envelope = mk(version);
        let kind = envelope.kind();
        let msg = encode(&envelope)?;
        self.next_version += 1;

        match time::timeout(self.config.send_timeout, envelopes.send(msg)).await {
            Ok(Ok(())) => {
                debug!(version, %kind, "Sent");
                self.metrics.sent(kind);
                self.undelivered_since = None;
                if kind == EnvelopeKind::FullConfig {
                    self.rejected = None;
                }
                if self.sent.len() == SENT_HISTORY {
                    self.sent.pop_front();
                }
                self.sent.push_back((version, kind));
                Ok(ApplyStatus::Sent { version })
            }
            Ok(Err(_)) => {
                self.disconnect(DistributorError::StreamClosed(
                    "stream dropped by transport".to_string(),
                ));
                Ok(self.queued())
            }
            Err(_) => {
                self.disconnect(DistributorError::SendTimeout(self.config.send_timeout));
                Ok(self.queued())
            }
        }
    }

    fn queued(&mut self) -> ApplyStatus {
        self.undelivered_since.get_or_insert_with(Instant::now);
        ApplyStatus::Queued
    }

    fn disconnect(&mut self, error: DistributorError) {
        warn!(%error, "Disconnected");
        self.report(error);
        self.metrics.set_connected(false);
        self.reconnect();
    }

    fn reconnect(&mut self) {
        self.attempt = self.attempt.saturating_add(1);
        let delay = self.config.backoff.delay(self.attempt);
        debug!(attempt = self.attempt, ?delay, "Reconnecting");
        self.metrics.reconnecting();
        // Dropping a previous connection closes its stream.
        self.state = State::Disconnected {
            connecting: connect(self.connector.clone(), &self.config, delay),
        };
    }

    fn close(&mut self, status: Status) {
        warn!(
            attempts = self.auth_failures,
            message = %status.message(),
            "Authentication failed; closing"
        );
        self.report(DistributorError::AuthenticationFailed {
            attempts: self.auth_failures,
            message: status.message().to_string(),
        });
        self.metrics.set_connected(false);
        self.state = State::Closed;
    }

    fn report(&self, error: DistributorError) {
        self.metrics.error(&error);
        let _ = self.errors.send(error);
    }
}

/// Waits for the pending connection attempt or the next feedback message.
async fn connection_event(state: &mut State) -> Event {
    match state {
        State::Disconnected { connecting } => Event::Connected(connecting.await),
        State::Connected(conn) => Event::Feedback(conn.feedback.next().await),
        State::Closed => future::pending().await,
    }
}

async fn stale(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => time::sleep_until(deadline).await,
        None => future::pending().await,
    }
}

fn encode(envelope: &StreamEnvelope) -> Result<proto::Envelope, serde_json::Error> {
    let op = match envelope {
        StreamEnvelope::FullConfig { configuration, .. } => {
            proto::envelope::Op::FullConfig(proto::FullConfig {
                configuration: configuration.to_json()?,
            })
        }
        StreamEnvelope::Incremental { op, .. } => {
            proto::envelope::Op::Incremental(proto::Incremental {
                name: op.name().to_string(),
                payload: op.payload()?,
            })
        }
    };
    Ok(proto::Envelope {
        version: envelope.version(),
        op: Some(op),
    })
}

fn connect<C: Connect>(connector: Arc<C>, config: &Config, delay: Duration) -> Connecting {
    let buffer = config.buffer.max(1);
    let timeout = config.connect_timeout;
    Box::pin(async move {
        if !delay.is_zero() {
            time::sleep(delay).await;
        }
        let (envelopes, rx) = mpsc::channel(buffer);
        let feedback = time::timeout(timeout, connector.connect(rx))
            .await
            .map_err(|_| {
                Status::deadline_exceeded(format!("worker did not respond within {timeout:?}"))
            })??;
        Ok(Connection {
            envelopes,
            feedback,
        })
    })
}

fn is_auth_failure(status: &Status) -> bool {
    matches!(status.code(), Code::Unauthenticated | Code::PermissionDenied)
}
