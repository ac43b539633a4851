//! Timeout-bounded action dispatch
//!
//! An accepted step means the robot acknowledged *receipt* of the frame.
//! Actuation happens later on the robot side. A step whose acknowledgement
//! misses the budget is a dropped frame: an expected outcome reported as
//! `accepted == false`, not an error.

use crate::{codec, connection::Link, shape::ActionVector, CloneEnvError, Result};
use std::time::Duration;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, trace};

/// Outcome of one dispatched action frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepResult {
    pub accepted: bool,
    pub seq: u64,
    pub latency: Duration,
}

/// Totals for an action held over a period
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HoldSummary {
    pub sent: u64,
    pub accepted: u64,
    /// Sequence number of the last frame the robot acknowledged
    pub last_acked: Option<u64>,
}

impl HoldSummary {
    fn record(&mut self, result: &StepResult) {
        self.sent += 1;
        if result.accepted {
            self.accepted += 1;
            self.last_acked = Some(result.seq);
        }
    }

    pub fn dropped(&self) -> u64 {
        self.sent - self.accepted
    }
}

pub struct StepController {
    budget: Duration,
    cycle: Duration,
}

impl StepController {
    pub fn new(budget: Duration, cycle: Duration) -> Self {
        Self { budget, cycle }
    }

    pub fn budget(&self) -> Duration {
        self.budget
    }

    /// Local checks that run before anything touches the network
    pub fn validate(&self, link: &Link<'_>, action: &ActionVector) -> Result<()> {
        action.check_dim(link.profile().actuator_count)?;
        action.ensure_finite()
    }

    /// Validate and dispatch one action within `timeout` (or the default budget)
    pub async fn step(&self, link: &Link<'_>, action: &ActionVector, timeout: Option<Duration>) -> Result<StepResult> {
        self.validate(link, action)?;
        self.dispatch(link, action, timeout.unwrap_or(self.budget)).await
    }

    /// Send an already validated action
    pub async fn dispatch(&self, link: &Link<'_>, action: &ActionVector, budget: Duration) -> Result<StepResult> {
        let seq = link.next_seq();
        let frame = codec::encode_action(seq, action.as_slice())?;

        let started = Instant::now();
        let outcome = time::timeout(budget, link.handle().send_action(frame, budget)).await;
        let latency = started.elapsed();

        match outcome {
            Ok(Ok(Some(ack))) if ack.seq == seq => {
                trace!("Frame {} acknowledged after {:?}", seq, latency);
                Ok(StepResult { accepted: true, seq, latency })
            }
            Ok(Ok(Some(ack))) => Err(CloneEnvError::Transport(format!(
                "acknowledgement for frame {} arrived while waiting for frame {}",
                ack.seq, seq
            ))),
            Ok(Ok(None)) | Err(_) => {
                debug!("Frame {} dropped, no acknowledgement within {:?}", seq, budget);
                Ok(StepResult { accepted: false, seq, latency })
            }
            Ok(Err(e)) => Err(CloneEnvError::transport(e.context(format!("sending frame {} failed", seq)))),
        }
    }

    /// Keep sending `action` once per cycle for `period`
    ///
    /// At least one frame is sent even for a zero period.
    pub async fn hold(&self, link: &Link<'_>, action: &ActionVector, period: Duration) -> Result<HoldSummary> {
        self.validate(link, action)?;

        let until = Instant::now().checked_add(period).ok_or_else(|| {
            CloneEnvError::InvalidAction(format!("hold period {:?} is out of range", period))
        })?;
        let mut summary = HoldSummary::default();
        let mut ticker = time::interval(self.cycle);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            if summary.sent > 0 && Instant::now() >= until {
                break;
            }
            let result = self.dispatch(link, action, self.budget).await?;
            summary.record(&result);
        }

        debug!(
            "Held action for {:?}: {} sent, {} dropped",
            period,
            summary.sent,
            summary.dropped()
        );
        Ok(summary)
    }
}
