//! Observation retrieval, decoupled from step completion
//!
//! Every fetch asks the robot for its current report. It never waits for an
//! in-flight step to finish actuating, so a snapshot taken right after a step
//! can still show the pre-step state. Callers that need the step's effect
//! must insert their own settling delay between `step` and `get_obs`.

use crate::{codec, connection::Link, shape::Readings, CloneEnvError, Result};
use std::time::Duration;
use tokio::time::{self, Instant};
use tracing::trace;

/// One sensor reading of the robot
#[derive(Debug, Clone)]
pub struct ObservationSnapshot {
    /// Robot clock at the time of the report
    pub timestamp: Duration,
    /// Highest action sequence number the robot had applied
    pub applied_seq: u64,
    pub readings: Readings,
    /// Episode the snapshot was fetched in
    pub episode: u64,
    pub received_at: Instant,
}

pub struct ObservationFetcher {
    budget: Duration,
}

impl ObservationFetcher {
    pub fn new(budget: Duration) -> Self {
        Self { budget }
    }

    pub async fn fetch(&self, link: &Link<'_>, timeout: Option<Duration>, episode: u64) -> Result<ObservationSnapshot> {
        let budget = timeout.unwrap_or(self.budget);

        let reply = match time::timeout(budget, link.handle().request_snapshot(budget)).await {
            Ok(Ok(Some(reply))) => reply,
            Ok(Ok(None)) | Err(_) => return Err(CloneEnvError::ObservationTimeout(budget)),
            Ok(Err(e)) => return Err(CloneEnvError::transport(e.context("snapshot request failed"))),
        };
        let received_at = Instant::now();

        let frame = codec::decode_snapshot(reply)?;
        let readings = Readings::new(frame.readings);
        let sensor_count = link.profile().sensor_count;
        if readings.len() != sensor_count {
            return Err(CloneEnvError::Transport(format!(
                "snapshot carries {} readings, robot has {} sensors",
                readings.len(),
                sensor_count
            )));
        }

        trace!("Snapshot at {:?}, applied frame {}", frame.robot_time, frame.applied_seq);
        Ok(ObservationSnapshot {
            timestamp: frame.robot_time,
            applied_seq: frame.applied_seq,
            readings,
            episode,
            received_at,
        })
    }
}
