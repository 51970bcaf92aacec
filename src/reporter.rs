//! Reporter - samples the host and pushes reports on a fixed interval
//!
//! The reporter runs as a single tokio task. Each tick collects one
//! [`Sample`](crate::Sample) and delivers it before the next tick may start,
//! so there is never more than one request in flight.
//!
//! ## Message Flow
//!
//! ```text
//! Timer tick → collect() → deliver() (retries inside) → log outcome
//!     ↑
//!     └─── Commands (TickNow, GetStats, Shutdown), handled between ticks
//! ```
//!
//! ## States
//!
//! ```text
//! Idle → Collecting → Delivering → Idle
//!          └──────────────────────→ Idle     (collection failed, tick skipped)
//! Idle → ShuttingDown → Terminated
//! ```
//!
//! A shutdown request that arrives mid-tick is queued on the command channel
//! and only looked at once the reporter is back in `Idle`, so a report is
//! never abandoned halfway through a request.

use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, error, info, instrument, trace, warn};

use crate::cloud::CloudInformation;
use crate::collector::{CollectionError, MetricsSource};
use crate::config::AgentConfig;
use crate::connectivity::ConnectivityProbe;
use crate::delivery::{DeliveryError, IngestClient};
use crate::{HostInformation, Report};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReporterState {
    /// Waiting for the next tick
    Idle,
    Collecting,
    Delivering,
    ShuttingDown,
    Terminated,
}

impl ReporterState {
    pub fn can_transition_to(self, next: ReporterState) -> bool {
        use ReporterState::*;

        matches!(
            (self, next),
            (Idle, Collecting)
                | (Collecting, Delivering)
                | (Collecting, Idle)
                | (Delivering, Idle)
                | (Idle, ShuttingDown)
                | (ShuttingDown, Terminated)
        )
    }
}

/// Terminal result of one tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    Delivered { attempts: u32 },
    Rejected { status: u16, attempts: u32 },
    Exhausted { attempts: u32 },
    CollectionFailed(CollectionError),
}

impl TickOutcome {
    pub fn kind(&self) -> &'static str {
        match self {
            TickOutcome::Delivered { .. } => "delivered",
            TickOutcome::Rejected { .. } => "rejected",
            TickOutcome::Exhausted { .. } => "exhausted",
            TickOutcome::CollectionFailed(_) => "collection_failed",
        }
    }

    pub fn is_delivered(&self) -> bool {
        matches!(self, TickOutcome::Delivered { .. })
    }
}

/// Counters over the reporter's lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReporterStats {
    pub ticks: u64,
    pub delivered: u64,
    pub rejected: u64,
    pub exhausted: u64,
    pub collection_failures: u64,

    /// HTTP requests sent, retries included
    pub attempts: u64,
}

impl ReporterStats {
    fn record(&mut self, outcome: &TickOutcome) {
        self.ticks += 1;
        match outcome {
            TickOutcome::Delivered { attempts } => {
                self.delivered += 1;
                self.attempts += u64::from(*attempts);
            }
            TickOutcome::Rejected { attempts, .. } => {
                self.rejected += 1;
                self.attempts += u64::from(*attempts);
            }
            TickOutcome::Exhausted { attempts } => {
                self.exhausted += 1;
                self.attempts += u64::from(*attempts);
            }
            TickOutcome::CollectionFailed(_) => {
                self.collection_failures += 1;
            }
        }
    }
}

/// Commands that can be sent to a running [`Reporter`]
#[derive(Debug)]
pub enum ReporterCommand {
    /// Run a tick right away, outside the interval schedule
    TickNow {
        respond_to: oneshot::Sender<TickOutcome>,
    },

    GetStats {
        respond_to: oneshot::Sender<ReporterStats>,
    },

    /// Stop after the current tick, if any
    Shutdown,
}

pub struct Reporter<S> {
    source: S,
    client: IngestClient,
    probe: Option<Box<dyn ConnectivityProbe>>,
    host: HostInformation,
    cloud: CloudInformation,
    interval: Duration,
    state: ReporterState,
    stats: ReporterStats,
}

impl<S: MetricsSource> Reporter<S> {
    pub fn new(config: &AgentConfig, source: S, client: IngestClient) -> Self {
        Self {
            source,
            client,
            probe: None,
            host: HostInformation::default(),
            cloud: CloudInformation::default(),
            interval: config.interval,
            state: ReporterState::Idle,
            stats: ReporterStats::default(),
        }
    }

    pub fn with_probe(mut self, probe: impl ConnectivityProbe + 'static) -> Self {
        self.probe = Some(Box::new(probe));
        self
    }

    pub fn with_host(mut self, host: HostInformation) -> Self {
        self.host = host;
        self
    }

    pub fn with_cloud(mut self, cloud: CloudInformation) -> Self {
        self.cloud = cloud;
        self
    }

    pub fn state(&self) -> ReporterState {
        self.state
    }

    pub fn stats(&self) -> ReporterStats {
        self.stats
    }

    fn transition(&mut self, next: ReporterState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "invalid reporter transition {:?} -> {next:?}",
            self.state
        );
        trace!("state {:?} -> {next:?}", self.state);
        self.state = next;
    }

    /// Run the reporter until a shutdown command arrives or every handle is
    /// dropped. Returns the final counters.
    #[instrument(skip_all, fields(url = %self.client.url()))]
    pub async fn run(mut self, mut command_rx: mpsc::Receiver<ReporterCommand>) -> ReporterStats {
        info!(interval_secs = self.interval.as_secs_f64(), "starting reporter");

        // the first tick completes immediately
        let mut ticker = interval(self.interval.max(Duration::from_millis(1)));
        // an overrunning tick pushes the schedule back instead of bursting
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                command = command_rx.recv() => match command {
                    Some(ReporterCommand::TickNow { respond_to }) => {
                        debug!("received TickNow command");
                        let outcome = self.tick().await;
                        let _ = respond_to.send(outcome);
                    }
                    Some(ReporterCommand::GetStats { respond_to }) => {
                        let _ = respond_to.send(self.stats);
                    }
                    Some(ReporterCommand::Shutdown) => {
                        debug!("received shutdown command");
                        break;
                    }
                    None => {
                        warn!("command channel closed, shutting down");
                        break;
                    }
                },

                _ = ticker.tick() => {
                    self.tick().await;
                }
            }
        }

        self.transition(ReporterState::ShuttingDown);
        self.transition(ReporterState::Terminated);

        info!(
            ticks = self.stats.ticks,
            delivered = self.stats.delivered,
            rejected = self.stats.rejected,
            exhausted = self.stats.exhausted,
            collection_failures = self.stats.collection_failures,
            "reporter stopped"
        );

        self.stats
    }

    /// Collect one sample and deliver it. Never fails, every problem ends up
    /// in the returned outcome and in the log.
    pub async fn tick(&mut self) -> TickOutcome {
        self.transition(ReporterState::Collecting);

        let sample = match self.source.collect().await {
            Ok(sample) => sample,
            Err(e) => {
                self.transition(ReporterState::Idle);
                warn!(outcome = "collection_failed", "skipping tick, failed to collect metrics: {e}");
                let outcome = TickOutcome::CollectionFailed(e);
                self.stats.record(&outcome);
                return outcome;
            }
        };

        let status = match &self.probe {
            Some(probe) => Some(probe.check().await),
            None => None,
        };

        let report = Report::new(sample)
            .with_status(status)
            .with_host(self.host.clone())
            .with_cloud(self.cloud.clone());

        self.transition(ReporterState::Delivering);
        let result = self.client.deliver(&report).await;
        self.transition(ReporterState::Idle);

        let sample = &report.sample;
        let outcome = match result {
            Ok(delivery) => {
                let attempts = delivery.attempt_count();
                info!(
                    outcome = "delivered",
                    attempts,
                    cpu = sample.cpu_percent,
                    memory = sample.memory_percent,
                    disk = sample.disk_percent,
                    status = ?report.status,
                    "metrics sent"
                );
                TickOutcome::Delivered { attempts }
            }
            Err(DeliveryError::Rejected {
                status,
                body,
                attempts,
            }) => {
                error!(
                    outcome = "rejected",
                    attempts,
                    status,
                    body = %body,
                    "ingest endpoint rejected metrics, check the server token"
                );
                TickOutcome::Rejected { status, attempts }
            }
            Err(e @ DeliveryError::Exhausted { .. }) => {
                let attempts = e.attempts();
                error!(outcome = "exhausted", attempts, "failed to send metrics: {e}");
                TickOutcome::Exhausted { attempts }
            }
        };

        self.stats.record(&outcome);
        outcome
    }
}

/// Handle for controlling a spawned [`Reporter`]
///
/// Can be cloned; the reporter stops once every handle is dropped.
#[derive(Clone)]
pub struct ReporterHandle {
    sender: mpsc::Sender<ReporterCommand>,
}

impl ReporterHandle {
    /// Spawn the reporter as a tokio task.
    ///
    /// The join handle resolves to the final counters once it has stopped.
    pub fn spawn<S>(reporter: Reporter<S>) -> (Self, JoinHandle<ReporterStats>)
    where
        S: MetricsSource + 'static,
    {
        let (cmd_tx, cmd_rx) = mpsc::channel(32);

        let task = tokio::spawn(reporter.run(cmd_rx));

        (Self { sender: cmd_tx }, task)
    }

    /// Run a tick right away and wait for its outcome
    pub async fn tick_now(&self) -> Result<TickOutcome> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ReporterCommand::TickNow { respond_to: tx })
            .await
            .context("failed to send TickNow command")?;

        rx.await.context("failed to receive tick outcome")
    }

    pub async fn stats(&self) -> Result<ReporterStats> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ReporterCommand::GetStats { respond_to: tx })
            .await
            .context("failed to send GetStats command")?;

        rx.await.context("failed to receive stats")
    }

    /// Ask the reporter to stop once the current tick is done
    pub async fn shutdown(&self) -> Result<()> {
        self.sender
            .send(ReporterCommand::Shutdown)
            .await
            .context("failed to send Shutdown command")?;
        Ok(())
    }
}
