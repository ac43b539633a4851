//! JSON event output for control-loop runs
//!
//! One JSON object per line on stdout, so runs can be piped into external
//! tools for latency and drop-rate analysis.

use crate::{
    environment::EpisodeStats,
    observation::ObservationSnapshot,
    step::StepResult,
};
use serde::{Deserialize, Serialize};

/// Current wall-clock time as f64 seconds since the UNIX epoch, microsecond precision
pub fn current_timestamp() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

/// Step outcome event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepEvent {
    pub timestamp: f64,
    #[serde(rename = "type")]
    pub event_type: String,
    pub episode: u64,
    pub seq: u64,
    pub accepted: bool,
    pub latency_us: u64,
}

/// Observation event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservationEvent {
    pub timestamp: f64,
    #[serde(rename = "type")]
    pub event_type: String,
    pub episode: u64,
    /// Robot clock in seconds
    pub robot_time: f64,
    pub applied_seq: u64,
    pub readings: Vec<f64>,
}

/// End-of-episode summary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpisodeEvent {
    pub timestamp: f64,
    #[serde(rename = "type")]
    pub event_type: String,
    pub episode: u64,
    pub steps: u64,
    pub accepted: u64,
    pub dropped: u64,
    pub drop_rate: f64,
}

/// Error event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEvent {
    pub timestamp: f64,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub episode: Option<u64>,
    pub error: String,
}

impl StepEvent {
    pub fn new(episode: u64, result: &StepResult) -> Self {
        Self {
            timestamp: current_timestamp(),
            event_type: "step".to_string(),
            episode,
            seq: result.seq,
            accepted: result.accepted,
            latency_us: result.latency.as_micros().min(u64::MAX as u128) as u64,
        }
    }
}

impl ObservationEvent {
    /// `event_type` distinguishes plain observations from post-reset ones
    pub fn new(event_type: &str, snapshot: &ObservationSnapshot) -> Self {
        Self {
            timestamp: current_timestamp(),
            event_type: event_type.to_string(),
            episode: snapshot.episode,
            robot_time: snapshot.timestamp.as_secs_f64(),
            applied_seq: snapshot.applied_seq,
            readings: snapshot.readings.to_vec(),
        }
    }

    pub fn observation(snapshot: &ObservationSnapshot) -> Self {
        Self::new("observation", snapshot)
    }

    pub fn reset(snapshot: &ObservationSnapshot) -> Self {
        Self::new("reset", snapshot)
    }
}

impl EpisodeEvent {
    pub fn new(stats: &EpisodeStats) -> Self {
        let drop_rate = if stats.steps == 0 {
            0.0
        } else {
            stats.dropped as f64 / stats.steps as f64
        };
        Self {
            timestamp: current_timestamp(),
            event_type: "episode".to_string(),
            episode: stats.index,
            steps: stats.steps,
            accepted: stats.accepted,
            dropped: stats.dropped,
            drop_rate,
        }
    }
}

impl ErrorEvent {
    pub fn new(error: &str, episode: Option<u64>) -> Self {
        Self {
            timestamp: current_timestamp(),
            event_type: "error".to_string(),
            episode,
            error: error.to_string(),
        }
    }
}

/// Output a JSON event to stdout
pub fn output_event<T: Serialize>(event: &T) {
    if let Ok(json) = serde_json::to_string(event) {
        println!("{}", json);
    }
}
