//! ControlEnvironment - step/observe/reset façade over the robot link
//!
//! Connection state is guarded by a read/write lock: `connect`, `close` and
//! fault teardown take the write side, while `step`, `get_obs` and `reset`
//! share the read side, so an observation can be fetched while a step is
//! still waiting for its acknowledgement. Steps additionally go through a
//! single outstanding-request slot; an overlapping step is rejected rather
//! than queued. A reset holds that slot for its whole duration.

use crate::{
    config::EnvConfig,
    connection::{ConnectionManager, ConnectionState},
    observation::{ObservationFetcher, ObservationSnapshot},
    reset::ResetController,
    shape::ActionVector,
    step::{HoldSummary, StepController, StepResult},
    transport::{RobotProfile, TransportConnector},
    CloneEnvError, Result,
};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, MutexGuard, RwLock};
use tracing::{info, warn};

/// Counters for the current episode
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EpisodeStats {
    pub index: u64,
    pub steps: u64,
    pub accepted: u64,
    pub dropped: u64,
}

impl EpisodeStats {
    fn record(&mut self, accepted: bool) {
        self.steps += 1;
        if accepted {
            self.accepted += 1;
        } else {
            self.dropped += 1;
        }
    }

    fn record_hold(&mut self, summary: &HoldSummary) {
        self.steps += summary.sent;
        self.accepted += summary.accepted;
        self.dropped += summary.dropped();
    }
}

/// Marks a reset as running for as long as it lives
struct ResetMark<'a>(&'a AtomicUsize);

impl<'a> ResetMark<'a> {
    fn raise(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for ResetMark<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Control-loop client for one robot
pub struct ControlEnvironment {
    config: EnvConfig,
    connection: RwLock<ConnectionManager>,
    state_rx: watch::Receiver<ConnectionState>,
    step_slot: Mutex<EpisodeStats>,
    resets_running: AtomicUsize,
    episode: AtomicU64,
    stepper: StepController,
    fetcher: ObservationFetcher,
    resetter: ResetController,
}

impl ControlEnvironment {
    pub fn new(config: EnvConfig, connector: Arc<dyn TransportConnector>) -> Result<Self> {
        config.validate()?;

        let manager = ConnectionManager::new(connector, config.connection.handshake_timeout());
        let state_rx = manager.subscribe();
        let budget = config.timeout_budget();

        Ok(Self {
            stepper: StepController::new(budget, config.cycle_interval()),
            fetcher: ObservationFetcher::new(budget),
            resetter: ResetController::from_config(&config),
            connection: RwLock::new(manager),
            state_rx,
            step_slot: Mutex::new(EpisodeStats::default()),
            resets_running: AtomicUsize::new(0),
            episode: AtomicU64::new(0),
            config,
        })
    }

    pub fn config(&self) -> &EnvConfig {
        &self.config
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Robot dimensions of the live session
    pub async fn profile(&self) -> Result<RobotProfile> {
        let connection = self.connection.read().await;
        Ok(connection.link()?.profile())
    }

    pub async fn actuator_count(&self) -> Result<usize> {
        Ok(self.profile().await?.actuator_count)
    }

    pub async fn sensor_count(&self) -> Result<usize> {
        Ok(self.profile().await?.sensor_count)
    }

    /// Counters of the current episode. Waits for a running reset.
    pub async fn episode(&self) -> EpisodeStats {
        *self.step_slot.lock().await
    }

    /// Connect to the configured host. A no-op when already connected.
    pub async fn connect(&self) -> Result<RobotProfile> {
        let mut connection = self.connection.write().await;
        let previous = connection.session_id();

        let profile = connection
            .connect(
                &self.config.hostname,
                self.config.connection.handshake_timeout(),
                self.config.connection.actuator_count,
            )
            .await?;

        if connection.session_id() != previous {
            // no step can hold the slot while the write lock is held
            *self.step_slot.lock().await = EpisodeStats::default();
            self.episode.store(0, Ordering::SeqCst);
        }
        Ok(profile)
    }

    /// Dispatch one action within the default budget
    pub async fn step(&self, action: &ActionVector) -> Result<StepResult> {
        self.step_with_timeout(action, None).await
    }

    pub async fn step_with_timeout(&self, action: &ActionVector, timeout: Option<Duration>) -> Result<StepResult> {
        let (session, result) = {
            let connection = self.connection.read().await;
            let link = connection.link()?;
            self.stepper.validate(&link, action)?;
            let mut slot = self.claim_step_slot()?;

            let budget = timeout.unwrap_or(self.stepper.budget());
            let result = self.stepper.dispatch(&link, action, budget).await;
            if let Ok(step) = &result {
                slot.record(step.accepted);
            }
            (link.session_id(), result)
        };
        self.settle(session, result).await
    }

    /// Latest robot report, without waiting for in-flight steps
    pub async fn get_obs(&self) -> Result<ObservationSnapshot> {
        self.get_obs_with_timeout(None).await
    }

    pub async fn get_obs_with_timeout(&self, timeout: Option<Duration>) -> Result<ObservationSnapshot> {
        let (session, result) = {
            let connection = self.connection.read().await;
            let link = connection.link()?;
            let episode = self.episode.load(Ordering::SeqCst);
            let result = self.fetcher.fetch(&link, timeout, episode).await;
            (link.session_id(), result)
        };
        self.settle(session, result).await
    }

    /// Drive the robot to `target` (or the configured home) and start a new episode
    pub async fn reset(&self, target: Option<&ActionVector>) -> Result<ObservationSnapshot> {
        let (session, result) = {
            let connection = self.connection.read().await;
            let link = connection.link()?;
            let target = match target {
                Some(target) => target.clone(),
                None => self.home_action(link.profile().actuator_count),
            };
            self.stepper.validate(&link, &target)?;

            let _mark = ResetMark::raise(&self.resets_running);
            let mut slot = self.step_slot.lock().await;
            let next = slot.index + 1;

            let result = self
                .resetter
                .reset(&link, &self.stepper, &self.fetcher, &target, next)
                .await;
            if result.is_ok() {
                *slot = EpisodeStats { index: next, ..EpisodeStats::default() };
                self.episode.store(next, Ordering::SeqCst);
                info!("Episode {} started", next);
            }
            (link.session_id(), result)
        };
        self.settle(session, result).await
    }

    /// Keep sending `action` once per cycle for `period`
    pub async fn hold(&self, action: &ActionVector, period: Duration) -> Result<HoldSummary> {
        let (session, result) = {
            let connection = self.connection.read().await;
            let link = connection.link()?;
            self.stepper.validate(&link, action)?;
            let mut slot = self.claim_step_slot()?;

            let result = self.stepper.hold(&link, action, period).await;
            if let Ok(summary) = &result {
                slot.record_hold(summary);
            }
            (link.session_id(), result)
        };
        self.settle(session, result).await
    }

    /// Hold every actuator released for `period`
    pub async fn relax(&self, period: Duration) -> Result<HoldSummary> {
        let actuators = self.actuator_count().await?;
        self.hold(&ActionVector::release(actuators), period).await
    }

    /// Relax the robot (if configured) and close the connection
    ///
    /// Safe from any state and idempotent; never fails.
    pub async fn close(&self) {
        if self.config.close.relax_before_close && self.state() == ConnectionState::Connected {
            if let Err(e) = self.relax(self.config.close.relax_period()).await {
                warn!("Could not relax robot before closing: {}", e);
            }
        }
        self.force_close().await;
    }

    /// Close immediately, skipping the relax step
    pub async fn force_close(&self) {
        self.connection.write().await.close().await;
    }

    fn home_action(&self, actuators: usize) -> ActionVector {
        match &self.config.reset.home {
            Some(home) => ActionVector::from(home.clone()),
            None => ActionVector::release(actuators),
        }
    }

    fn claim_step_slot(&self) -> Result<MutexGuard<'_, EpisodeStats>> {
        if self.resets_running.load(Ordering::SeqCst) > 0 {
            return Err(CloneEnvError::ResetInProgress);
        }
        self.step_slot.try_lock().map_err(|_| {
            if self.resets_running.load(Ordering::SeqCst) > 0 {
                CloneEnvError::ResetInProgress
            } else {
                CloneEnvError::StepInFlight
            }
        })
    }

    /// Tear the session down when `result` is a transport fault
    async fn settle<T>(&self, session: u64, result: Result<T>) -> Result<T> {
        if let Err(CloneEnvError::Transport(reason)) = &result {
            self.connection.write().await.invalidate(session, reason).await;
        }
        result
    }
}
