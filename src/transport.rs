//! Transport abstraction for the robot link
//!
//! The control loop never speaks a wire protocol directly. A
//! `TransportConnector` opens a `TransportHandle` to a named robot, and the
//! handle moves already-encoded frames (see `codec`) with a caller-supplied
//! timeout. Any RPC stack can sit behind these traits.

use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;

/// Dimensions the robot reports when a handle is opened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RobotProfile {
    pub actuator_count: usize,
    pub sensor_count: usize,
}

/// Receipt acknowledgement for an action frame
///
/// Receipt only: the robot actuates asynchronously after acknowledging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ack {
    /// Sequence number echoed back from the acknowledged frame
    pub seq: u64,
}

/// Opens handles to robot endpoints
#[async_trait]
pub trait TransportConnector: Send + Sync {
    /// Open a channel to `hostname`, including any protocol handshake
    async fn open(&self, hostname: &str) -> anyhow::Result<Box<dyn TransportHandle>>;
}

/// An opened channel to one robot
///
/// `Ok(None)` from the timed primitives means the timeout elapsed without a
/// reply. `Err` is reserved for channel faults (closed socket, protocol
/// violation); callers tear the session down when they see one.
#[async_trait]
pub trait TransportHandle: Send + Sync {
    fn profile(&self) -> RobotProfile;

    /// Bring the robot into an operable state after open (e.g. start the
    /// pressure supply and wait until it reaches working pressure)
    async fn prepare(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn send_action(&self, frame: Bytes, timeout: Duration) -> anyhow::Result<Option<Ack>>;

    async fn request_snapshot(&self, timeout: Duration) -> anyhow::Result<Option<Bytes>>;

    /// Undo `prepare` before closing
    async fn release(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn close(&self) -> anyhow::Result<()>;
}
