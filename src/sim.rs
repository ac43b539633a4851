//! In-process simulated robot
//!
//! Implements the transport traits with configurable acknowledgement latency
//! and actuation delay. Actions take effect `actuation_delay` after receipt,
//! regardless of whether the acknowledgement reached the caller in time.
//! Each reading mirrors the last applied command of the matching actuator.

use crate::{
    codec::{self, SnapshotFrame},
    transport::{Ack, RobotProfile, TransportConnector, TransportHandle},
};
use anyhow::{bail, Context};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::{self, Instant};
use tracing::{debug, trace};

/// Timing and shape of a simulated robot
#[derive(Debug, Clone)]
pub struct SimSettings {
    pub actuator_count: usize,
    pub sensor_count: usize,
    pub ack_latency: Duration,
    pub snapshot_latency: Duration,
    pub actuation_delay: Duration,
    pub prepare_time: Duration,
}

impl SimSettings {
    pub fn new(actuator_count: usize) -> Self {
        Self {
            actuator_count,
            sensor_count: actuator_count,
            ack_latency: Duration::from_micros(500),
            snapshot_latency: Duration::from_micros(500),
            actuation_delay: Duration::from_millis(20),
            prepare_time: Duration::from_millis(100),
        }
    }

    pub fn with_sensor_count(mut self, sensor_count: usize) -> Self {
        self.sensor_count = sensor_count;
        self
    }

    pub fn with_ack_latency(mut self, latency: Duration) -> Self {
        self.ack_latency = latency;
        self
    }

    pub fn with_snapshot_latency(mut self, latency: Duration) -> Self {
        self.snapshot_latency = latency;
        self
    }

    pub fn with_actuation_delay(mut self, delay: Duration) -> Self {
        self.actuation_delay = delay;
        self
    }

    pub fn with_prepare_time(mut self, prepare_time: Duration) -> Self {
        self.prepare_time = prepare_time;
        self
    }

    fn profile(&self) -> RobotProfile {
        RobotProfile {
            actuator_count: self.actuator_count,
            sensor_count: self.sensor_count,
        }
    }
}

struct PendingAction {
    apply_at: Instant,
    seq: u64,
    values: Vec<f64>,
}

struct RobotModel {
    command: Vec<f64>,
    pending: VecDeque<PendingAction>,
    applied_seq: u64,
    latest_seq: u64,
}

impl RobotModel {
    fn new(actuator_count: usize) -> Self {
        Self {
            command: vec![0.0; actuator_count],
            pending: VecDeque::new(),
            applied_seq: 0,
            latest_seq: 0,
        }
    }

    /// Sequence numbers restart with every session; the physical command stays.
    fn start_session(&mut self) {
        self.pending.clear();
        self.applied_seq = 0;
        self.latest_seq = 0;
    }

    fn receive(&mut self, seq: u64, values: Vec<f64>, apply_at: Instant) {
        if seq <= self.latest_seq {
            trace!("Dropping stale frame {} (latest {})", seq, self.latest_seq);
            return;
        }
        self.latest_seq = seq;
        self.pending.push_back(PendingAction { apply_at, seq, values });
    }

    fn advance(&mut self, now: Instant) {
        while self.pending.front().is_some_and(|p| p.apply_at <= now) {
            if let Some(action) = self.pending.pop_front() {
                self.command = action.values;
                self.applied_seq = action.seq;
            }
        }
    }

    fn readings(&self, sensor_count: usize) -> Vec<f64> {
        (0..sensor_count)
            .map(|i| self.command.get(i).copied().unwrap_or(0.0))
            .collect()
    }
}

struct Shared {
    settings: Mutex<SimSettings>,
    model: Mutex<RobotModel>,
    boot: Instant,
    reachable: AtomicBool,
    frozen: AtomicBool,
    fault_next: AtomicBool,
    corrupt_next: AtomicBool,
    supply_active: AtomicBool,
    opened: AtomicUsize,
    closed: AtomicUsize,
    actions_received: AtomicU64,
}

impl Shared {
    fn settings(&self) -> SimSettings {
        lock(&self.settings).clone()
    }

    fn take_fault(&self) -> anyhow::Result<()> {
        if self.fault_next.swap(false, Ordering::SeqCst) {
            bail!("simulated channel fault");
        }
        Ok(())
    }

    fn advance(&self, model: &mut RobotModel) {
        if !self.frozen.load(Ordering::SeqCst) {
            model.advance(Instant::now());
        }
    }
}

/// Simulated robot, usable as a `TransportConnector`
///
/// Clones share the same robot. The robot outlives individual handles, so
/// the physical command survives a reconnect.
#[derive(Clone)]
pub struct SimulatedRobot {
    shared: Arc<Shared>,
}

impl SimulatedRobot {
    pub fn new(settings: SimSettings) -> Self {
        let model = RobotModel::new(settings.actuator_count);
        Self {
            shared: Arc::new(Shared {
                settings: Mutex::new(settings),
                model: Mutex::new(model),
                boot: Instant::now(),
                reachable: AtomicBool::new(true),
                frozen: AtomicBool::new(false),
                fault_next: AtomicBool::new(false),
                corrupt_next: AtomicBool::new(false),
                supply_active: AtomicBool::new(false),
                opened: AtomicUsize::new(0),
                closed: AtomicUsize::new(0),
                actions_received: AtomicU64::new(0),
            }),
        }
    }

    /// Change settings for subsequent calls
    ///
    /// Open handles keep the profile they reported at connect time, but their
    /// snapshots follow the current `sensor_count`.
    pub fn update_settings(&self, update: impl FnOnce(&mut SimSettings)) {
        let mut settings = lock(&self.shared.settings);
        update(&mut *settings);
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.shared.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Stop applying received actions, as if the actuators were stuck
    pub fn set_frozen(&self, frozen: bool) {
        self.shared.frozen.store(frozen, Ordering::SeqCst);
    }

    /// Make the next transport call fail with a channel fault
    pub fn inject_fault(&self) {
        self.shared.fault_next.store(true, Ordering::SeqCst);
    }

    /// Make the next snapshot reply a truncated frame
    pub fn corrupt_next_snapshot(&self) {
        self.shared.corrupt_next.store(true, Ordering::SeqCst);
    }

    pub fn opened_handles(&self) -> usize {
        self.shared.opened.load(Ordering::SeqCst)
    }

    pub fn closed_handles(&self) -> usize {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Action frames received across all sessions, including dropped ones
    pub fn actions_received(&self) -> u64 {
        self.shared.actions_received.load(Ordering::SeqCst)
    }

    pub fn supply_active(&self) -> bool {
        self.shared.supply_active.load(Ordering::SeqCst)
    }

    /// Command currently applied to the actuators
    pub fn command(&self) -> Vec<f64> {
        let mut model = lock(&self.shared.model);
        self.shared.advance(&mut model);
        model.command.clone()
    }
}

#[async_trait]
impl TransportConnector for SimulatedRobot {
    async fn open(&self, hostname: &str) -> anyhow::Result<Box<dyn TransportHandle>> {
        if !self.shared.reachable.load(Ordering::SeqCst) {
            bail!("host {} unreachable", hostname);
        }
        let profile = self.shared.settings().profile();
        lock(&self.shared.model).start_session();
        self.shared.opened.fetch_add(1, Ordering::SeqCst);
        debug!("Simulated robot {} opened", hostname);

        Ok(Box::new(SimHandle {
            shared: Arc::clone(&self.shared),
            profile,
            closed: AtomicBool::new(false),
        }))
    }
}

struct SimHandle {
    shared: Arc<Shared>,
    profile: RobotProfile,
    closed: AtomicBool,
}

impl SimHandle {
    fn ensure_open(&self) -> anyhow::Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            bail!("handle already closed");
        }
        self.shared.take_fault()
    }
}

#[async_trait]
impl TransportHandle for SimHandle {
    fn profile(&self) -> RobotProfile {
        self.profile
    }

    async fn prepare(&self) -> anyhow::Result<()> {
        self.ensure_open()?;
        // supply starts immediately, working pressure is reached after prepare_time
        self.shared.supply_active.store(true, Ordering::SeqCst);
        let prepare_time = self.shared.settings().prepare_time;
        if !prepare_time.is_zero() {
            time::sleep(prepare_time).await;
        }
        Ok(())
    }

    async fn send_action(&self, frame: Bytes, _timeout: Duration) -> anyhow::Result<Option<Ack>> {
        self.ensure_open()?;
        let action = codec::decode_action(frame).context("robot rejected action frame")?;
        if action.values.len() != self.profile.actuator_count {
            bail!(
                "robot expects {} actuator values, frame has {}",
                self.profile.actuator_count,
                action.values.len()
            );
        }

        let settings = self.shared.settings();
        self.shared.actions_received.fetch_add(1, Ordering::SeqCst);
        {
            let mut model = lock(&self.shared.model);
            model.receive(action.seq, action.values, Instant::now() + settings.actuation_delay);
        }

        if !settings.ack_latency.is_zero() {
            time::sleep(settings.ack_latency).await;
        }
        Ok(Some(Ack { seq: action.seq }))
    }

    async fn request_snapshot(&self, _timeout: Duration) -> anyhow::Result<Option<Bytes>> {
        self.ensure_open()?;
        let settings = self.shared.settings();
        if !settings.snapshot_latency.is_zero() {
            time::sleep(settings.snapshot_latency).await;
        }
        if self.shared.corrupt_next.swap(false, Ordering::SeqCst) {
            return Ok(Some(Bytes::from_static(&[0x5a, 0x5a, 0x5a])));
        }

        let snapshot = {
            let mut model = lock(&self.shared.model);
            self.shared.advance(&mut model);
            SnapshotFrame {
                robot_time: Instant::now().duration_since(self.shared.boot),
                applied_seq: model.applied_seq,
                readings: model.readings(settings.sensor_count),
            }
        };
        Ok(Some(codec::encode_snapshot(&snapshot)?))
    }

    async fn release(&self) -> anyhow::Result<()> {
        self.ensure_open()?;
        self.shared.supply_active.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> anyhow::Result<()> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.shared.closed.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_actions_apply_after_delay() {
        let robot = SimulatedRobot::new(SimSettings::new(2).with_actuation_delay(Duration::from_millis(10)));
        let handle = robot.open("sim").await.unwrap();

        let frame = codec::encode_action(1, &[0.5, -0.5]).unwrap();
        let ack = handle.send_action(frame, Duration::from_millis(5)).await.unwrap();
        assert_eq!(ack, Some(Ack { seq: 1 }));
        assert_eq!(robot.command(), vec![0.0, 0.0]);

        time::sleep(Duration::from_millis(15)).await;
        let reply = handle.request_snapshot(Duration::from_millis(5)).await.unwrap().unwrap();
        let snapshot = codec::decode_snapshot(reply).unwrap();
        assert_eq!(snapshot.applied_seq, 1);
        assert_eq!(snapshot.readings, vec![0.5, -0.5]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_frames_ignored() {
        let robot = SimulatedRobot::new(SimSettings::new(1).with_actuation_delay(Duration::ZERO));
        let handle = robot.open("sim").await.unwrap();

        handle.send_action(codec::encode_action(2, &[1.0]).unwrap(), Duration::from_millis(5)).await.unwrap();
        handle.send_action(codec::encode_action(1, &[-1.0]).unwrap(), Duration::from_millis(5)).await.unwrap();
        assert_eq!(robot.command(), vec![1.0]);
        assert_eq!(robot.actions_received(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_injected_fault_hits_next_call_only() {
        let robot = SimulatedRobot::new(SimSettings::new(1));
        let handle = robot.open("sim").await.unwrap();

        robot.inject_fault();
        assert!(handle.request_snapshot(Duration::from_millis(5)).await.is_err());
        assert!(handle.request_snapshot(Duration::from_millis(5)).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_corrupted_snapshot_hits_next_reply_only() {
        let robot = SimulatedRobot::new(SimSettings::new(1));
        let handle = robot.open("sim").await.unwrap();

        robot.corrupt_next_snapshot();
        let garbled = handle.request_snapshot(Duration::from_millis(5)).await.unwrap().unwrap();
        assert!(codec::decode_snapshot(garbled).is_err());

        let reply = handle.request_snapshot(Duration::from_millis(5)).await.unwrap().unwrap();
        assert!(codec::decode_snapshot(reply).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_handle_rejects_calls() {
        let robot = SimulatedRobot::new(SimSettings::new(1));
        let handle = robot.open("sim").await.unwrap();
        handle.close().await.unwrap();
        handle.close().await.unwrap();

        assert_eq!(robot.closed_handles(), 1);
        assert!(handle.request_snapshot(Duration::from_millis(5)).await.is_err());
    }
}
