//! Connection lifecycle for the robot link
//!
//! `ConnectionManager` is the only owner of a live `TransportHandle`. Other
//! components borrow it through a `Link` for the duration of one operation.

use crate::{
    transport::{RobotProfile, TransportConnector, TransportHandle},
    CloneEnvError, Result,
};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{self, Instant};
use tracing::{debug, error, info, warn};

/// Connection lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Closing,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Closing => "closing",
        };
        f.write_str(name)
    }
}

struct Session {
    id: u64,
    hostname: String,
    profile: RobotProfile,
    handle: Box<dyn TransportHandle>,
    last_seq: AtomicU64,
}

/// Borrowed access to the live session
pub struct Link<'a> {
    session: &'a Session,
}

impl<'a> Link<'a> {
    pub fn session_id(&self) -> u64 {
        self.session.id
    }

    pub fn hostname(&self) -> &str {
        &self.session.hostname
    }

    pub fn profile(&self) -> RobotProfile {
        self.session.profile
    }

    /// Next action-frame sequence number for this session, starting at 1
    pub fn next_seq(&self) -> u64 {
        self.session.last_seq.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) fn handle(&self) -> &'a dyn TransportHandle {
        self.session.handle.as_ref()
    }
}

/// Owns the transport handle and the observable connection state
pub struct ConnectionManager {
    connector: Arc<dyn TransportConnector>,
    teardown_timeout: Duration,
    session: Option<Session>,
    sessions_opened: u64,
    state_tx: watch::Sender<ConnectionState>,
}

impl ConnectionManager {
    pub fn new(connector: Arc<dyn TransportConnector>, teardown_timeout: Duration) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            connector,
            teardown_timeout,
            session: None,
            sessions_opened: 0,
            state_tx,
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub fn session_id(&self) -> Option<u64> {
        self.session.as_ref().map(|s| s.id)
    }

    pub fn profile(&self) -> Option<RobotProfile> {
        self.session.as_ref().map(|s| s.profile)
    }

    /// Borrow the live session, failing unless the state is `Connected`
    pub fn link(&self) -> Result<Link<'_>> {
        match &self.session {
            Some(session) if self.state() == ConnectionState::Connected => Ok(Link { session }),
            _ => Err(CloneEnvError::NotConnected),
        }
    }

    /// Open a session to `hostname`
    ///
    /// A no-op when already connected to the same host. Connected to a
    /// different host, the old session is closed first.
    pub async fn connect(
        &mut self,
        hostname: &str,
        handshake_timeout: Duration,
        expected_actuators: Option<usize>,
    ) -> Result<RobotProfile> {
        if let Some(session) = &self.session {
            if session.hostname == hostname && self.state() == ConnectionState::Connected {
                debug!("Already connected to {}", hostname);
                return Ok(session.profile);
            }
            info!("Switching robot from {} to {}", session.hostname, hostname);
            self.close().await;
        }

        self.set_state(ConnectionState::Connecting);
        info!("Connecting to robot at {}", hostname);

        let started = Instant::now();
        let opened = time::timeout(handshake_timeout, self.connector.open(hostname)).await;
        let handle = match opened {
            Ok(Ok(handle)) => handle,
            Ok(Err(e)) => return Err(self.fail_connect(hostname, format!("{:#}", e))),
            Err(_) => return Err(self.fail_connect(hostname, handshake_expired(handshake_timeout))),
        };
        let profile = handle.profile();

        // once a handle exists, every failure below must tear it down
        let prepared = match check_profile(profile, expected_actuators) {
            Ok(()) => {
                let remaining = handshake_timeout.saturating_sub(started.elapsed());
                match time::timeout(remaining, handle.prepare()).await {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(e)) => Err(format!("robot preparation failed: {:#}", e)),
                    Err(_) => Err(handshake_expired(handshake_timeout)),
                }
            }
            Err(reason) => Err(reason),
        };
        if let Err(reason) = prepared {
            teardown(handle.as_ref(), hostname, self.teardown_timeout).await;
            return Err(self.fail_connect(hostname, reason));
        }

        self.sessions_opened += 1;
        self.session = Some(Session {
            id: self.sessions_opened,
            hostname: hostname.to_string(),
            profile,
            handle,
            last_seq: AtomicU64::new(0),
        });
        self.set_state(ConnectionState::Connected);
        info!(
            "Connected to {} ({} actuators, {} sensors)",
            hostname, profile.actuator_count, profile.sensor_count
        );
        Ok(profile)
    }

    /// Tear down the session. Always ends in `Disconnected`.
    ///
    /// Remote teardown is best effort: failures are logged, never returned.
    pub async fn close(&mut self) {
        let Some(session) = self.session.take() else {
            self.set_state(ConnectionState::Disconnected);
            return;
        };

        self.set_state(ConnectionState::Closing);
        info!("Closing connection to {}", session.hostname);

        teardown(session.handle.as_ref(), &session.hostname, self.teardown_timeout).await;

        self.set_state(ConnectionState::Disconnected);
        info!("Connection to {} closed", session.hostname);
    }

    /// Tear down `session_id` after a transport fault
    ///
    /// Ignored when that session has already been replaced.
    pub async fn invalidate(&mut self, session_id: u64, reason: &str) {
        if self.session_id() != Some(session_id) {
            debug!("Ignoring fault for stale session {}: {}", session_id, reason);
            return;
        }
        error!("Transport fault on session {}: {}", session_id, reason);
        self.close().await;
    }

    fn fail_connect(&mut self, hostname: &str, reason: String) -> CloneEnvError {
        error!("Failed to connect to {}: {}", hostname, reason);
        self.set_state(ConnectionState::Disconnected);
        CloneEnvError::Connect {
            reason,
            hostname: hostname.to_string(),
        }
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            debug!("Connection state {} -> {}", previous, state);
        }
    }
}

/// Best-effort release and close of `handle`, bounded by `limit`
async fn teardown(handle: &dyn TransportHandle, hostname: &str, limit: Duration) {
    let steps = async {
        if let Err(e) = handle.release().await {
            warn!("Failed to release robot {}: {:#}", hostname, e);
        }
        if let Err(e) = handle.close().await {
            warn!("Failed to close transport to {}: {:#}", hostname, e);
        }
    };
    if time::timeout(limit, steps).await.is_err() {
        warn!("Teardown of {} did not finish within {:?}, dropping handle", hostname, limit);
    }
}

fn handshake_expired(limit: Duration) -> String {
    format!("handshake did not complete within {:?}", limit)
}

fn check_profile(profile: RobotProfile, expected_actuators: Option<usize>) -> std::result::Result<(), String> {
    if profile.actuator_count == 0 {
        return Err("robot reports no actuators".to_string());
    }
    if profile.sensor_count == 0 {
        return Err("robot reports no sensors".to_string());
    }
    match expected_actuators {
        Some(expected) if expected != profile.actuator_count => Err(format!(
            "robot reports {} actuators but {} are configured",
            profile.actuator_count, expected
        )),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimSettings, SimulatedRobot};

    const HANDSHAKE: Duration = Duration::from_secs(1);

    fn manager(robot: &SimulatedRobot) -> ConnectionManager {
        ConnectionManager::new(Arc::new(robot.clone()), HANDSHAKE)
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_is_idempotent() {
        let robot = SimulatedRobot::new(SimSettings::new(3));
        let mut manager = manager(&robot);

        let profile = manager.connect("test-bot", HANDSHAKE, None).await.unwrap();
        assert_eq!(profile.actuator_count, 3);
        assert_eq!(manager.state(), ConnectionState::Connected);

        manager.connect("test-bot", HANDSHAKE, None).await.unwrap();
        assert_eq!(robot.opened_handles(), 1);
        assert_eq!(manager.session_id(), Some(1));
        assert!(robot.supply_active());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_host() {
        let robot = SimulatedRobot::new(SimSettings::new(3));
        robot.set_reachable(false);
        let mut manager = manager(&robot);

        match manager.connect("test-bot", HANDSHAKE, None).await {
            Err(CloneEnvError::Connect { hostname, reason }) => {
                assert_eq!(hostname, "test-bot");
                assert!(reason.contains("unreachable"));
            }
            other => panic!("expected connect error, got {:?}", other.map(|_| ())),
        }
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert!(matches!(manager.link(), Err(CloneEnvError::NotConnected)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_handshake_timeout() {
        let robot = SimulatedRobot::new(SimSettings::new(3).with_prepare_time(Duration::from_secs(5)));
        let mut manager = manager(&robot);

        let err = manager.connect("test-bot", HANDSHAKE, None).await.unwrap_err();
        assert!(matches!(err, CloneEnvError::Connect { .. }));
        assert!(err.to_string().contains("handshake"));
        assert_eq!(manager.state(), ConnectionState::Disconnected);

        // the half-prepared handle is released and closed, not leaked
        assert_eq!(robot.opened_handles(), 1);
        assert_eq!(robot.closed_handles(), robot.opened_handles());
        assert!(!robot.supply_active());
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_to_other_host_closes_old_session() {
        let robot = SimulatedRobot::new(SimSettings::new(3));
        let mut manager = manager(&robot);

        manager.connect("bot-a", HANDSHAKE, None).await.unwrap();
        manager.connect("bot-b", HANDSHAKE, None).await.unwrap();

        assert_eq!(robot.opened_handles(), 2);
        assert_eq!(robot.closed_handles(), 1);
        assert_eq!(manager.session_id(), Some(2));
        assert_eq!(manager.state(), ConnectionState::Connected);
        assert_eq!(manager.link().unwrap().hostname(), "bot-b");
        assert!(robot.supply_active());
    }

    #[tokio::test(start_paused = true)]
    async fn test_configured_actuator_count_must_match() {
        let robot = SimulatedRobot::new(SimSettings::new(3));
        let mut manager = manager(&robot);

        let err = manager.connect("test-bot", HANDSHAKE, Some(4)).await.unwrap_err();
        assert!(err.to_string().contains("3 actuators but 4 are configured"));
        assert_eq!(robot.closed_handles(), 1);
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_is_idempotent() {
        let robot = SimulatedRobot::new(SimSettings::new(3));
        let mut manager = manager(&robot);
        let mut states = manager.subscribe();

        manager.close().await;
        assert_eq!(manager.state(), ConnectionState::Disconnected);

        manager.connect("test-bot", HANDSHAKE, None).await.unwrap();
        assert!(states.has_changed().unwrap());
        assert_eq!(*states.borrow_and_update(), ConnectionState::Connected);

        manager.close().await;
        manager.close().await;
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert_eq!(robot.closed_handles(), 1);
        assert!(!robot.supply_active());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_fault_does_not_close_new_session() {
        let robot = SimulatedRobot::new(SimSettings::new(3));
        let mut manager = manager(&robot);

        manager.connect("test-bot", HANDSHAKE, None).await.unwrap();
        manager.close().await;
        manager.connect("test-bot", HANDSHAKE, None).await.unwrap();
        assert_eq!(manager.session_id(), Some(2));

        manager.invalidate(1, "late fault").await;
        assert_eq!(manager.state(), ConnectionState::Connected);

        manager.invalidate(2, "socket closed").await;
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert_eq!(robot.opened_handles(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sequence_numbers_restart_per_session() {
        let robot = SimulatedRobot::new(SimSettings::new(2));
        let mut manager = manager(&robot);

        manager.connect("test-bot", HANDSHAKE, None).await.unwrap();
        {
            let link = manager.link().unwrap();
            assert_eq!(link.next_seq(), 1);
            assert_eq!(link.next_seq(), 2);
        }
        manager.close().await;
        manager.connect("test-bot", HANDSHAKE, None).await.unwrap();
        assert_eq!(manager.link().unwrap().next_seq(), 1);
    }
}
