//! Binary framing for action and snapshot payloads
//!
//! Both frames are little-endian:
//!
//! ```text
//! action:   seq u64 | count u16 | count x f64
//! snapshot: robot_time_us u64 | applied_seq u64 | count u16 | count x f64
//! ```
//!
//! Sequence numbers start at 1 for each session; 0 means "nothing applied yet".

use crate::CloneEnvError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::time::Duration;
use thiserror::Error;

const ACTION_HEADER_LEN: usize = 8 + 2;
const SNAPSHOT_HEADER_LEN: usize = 8 + 8 + 2;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame truncated: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    #[error("frame has {0} unexpected trailing bytes")]
    TrailingBytes(usize),

    #[error("frame carries {0} values, more than a frame can hold")]
    TooManyValues(usize),
}

impl From<FrameError> for CloneEnvError {
    fn from(err: FrameError) -> Self {
        CloneEnvError::Transport(format!("malformed frame: {}", err))
    }
}

/// Decoded action frame
#[derive(Debug, Clone, PartialEq)]
pub struct ActionFrame {
    pub seq: u64,
    pub values: Vec<f64>,
}

/// Decoded snapshot frame
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotFrame {
    pub robot_time: Duration,
    pub applied_seq: u64,
    pub readings: Vec<f64>,
}

pub fn encode_action(seq: u64, values: &[f64]) -> Result<Bytes, FrameError> {
    let count = value_count(values)?;
    let mut buf = BytesMut::with_capacity(ACTION_HEADER_LEN + values.len() * 8);
    buf.put_u64_le(seq);
    buf.put_u16_le(count);
    for value in values {
        buf.put_f64_le(*value);
    }
    Ok(buf.freeze())
}

pub fn decode_action(mut frame: Bytes) -> Result<ActionFrame, FrameError> {
    ensure_len(&frame, ACTION_HEADER_LEN)?;
    let seq = frame.get_u64_le();
    let count = frame.get_u16_le() as usize;
    let values = read_values(&mut frame, count)?;
    Ok(ActionFrame { seq, values })
}

pub fn encode_snapshot(snapshot: &SnapshotFrame) -> Result<Bytes, FrameError> {
    let count = value_count(&snapshot.readings)?;
    let mut buf = BytesMut::with_capacity(SNAPSHOT_HEADER_LEN + snapshot.readings.len() * 8);
    buf.put_u64_le(snapshot.robot_time.as_micros().min(u64::MAX as u128) as u64);
    buf.put_u64_le(snapshot.applied_seq);
    buf.put_u16_le(count);
    for value in &snapshot.readings {
        buf.put_f64_le(*value);
    }
    Ok(buf.freeze())
}

pub fn decode_snapshot(mut frame: Bytes) -> Result<SnapshotFrame, FrameError> {
    ensure_len(&frame, SNAPSHOT_HEADER_LEN)?;
    let robot_time = Duration::from_micros(frame.get_u64_le());
    let applied_seq = frame.get_u64_le();
    let count = frame.get_u16_le() as usize;
    let readings = read_values(&mut frame, count)?;
    Ok(SnapshotFrame { robot_time, applied_seq, readings })
}

fn value_count(values: &[f64]) -> Result<u16, FrameError> {
    u16::try_from(values.len()).map_err(|_| FrameError::TooManyValues(values.len()))
}

fn ensure_len(frame: &Bytes, needed: usize) -> Result<(), FrameError> {
    if frame.len() < needed {
        return Err(FrameError::Truncated { needed, available: frame.len() });
    }
    Ok(())
}

fn read_values(frame: &mut Bytes, count: usize) -> Result<Vec<f64>, FrameError> {
    ensure_len(frame, count * 8)?;
    let values = (0..count).map(|_| frame.get_f64_le()).collect();
    if frame.has_remaining() {
        return Err(FrameError::TrailingBytes(frame.remaining()));
    }
    Ok(values)
}
