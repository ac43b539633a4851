//! Episode reset
//!
//! A reset holds the target action for the hold period, then waits until the
//! robot reports that it has applied the last acknowledged target frame.
//! Sequence numbers are monotonic per session and the robot applies frames in
//! order, so once that frame is applied no earlier action can show up in a
//! later snapshot. A reset that cannot confirm this within its timeout fails
//! instead of returning a half-reset snapshot.

use crate::{
    config::EnvConfig,
    connection::Link,
    observation::{ObservationFetcher, ObservationSnapshot},
    shape::ActionVector,
    step::StepController,
    CloneEnvError, Result,
};
use std::time::Duration;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info};

pub struct ResetController {
    hold_period: Duration,
    timeout: Duration,
    cycle: Duration,
}

impl ResetController {
    pub fn new(hold_period: Duration, timeout: Duration, cycle: Duration) -> Self {
        Self {
            hold_period,
            timeout,
            cycle,
        }
    }

    pub fn from_config(config: &EnvConfig) -> Self {
        Self::new(config.reset.hold_period(), config.reset.timeout(), config.cycle_interval())
    }

    /// Drive the robot to `target` and return the first snapshot that reflects it
    ///
    /// `episode` is stamped on the returned snapshot.
    pub async fn reset(
        &self,
        link: &Link<'_>,
        stepper: &StepController,
        fetcher: &ObservationFetcher,
        target: &ActionVector,
        episode: u64,
    ) -> Result<ObservationSnapshot> {
        stepper.validate(link, target)?;

        let started = Instant::now();
        let deadline = started.checked_add(self.timeout);
        info!("Resetting robot, holding target for {:?}", self.hold_period.min(self.timeout));

        let held = stepper.hold(link, target, self.hold_period.min(self.timeout)).await?;
        let barrier = held.last_acked.ok_or_else(|| {
            CloneEnvError::Reset(format!("robot acknowledged none of {} reset frames", held.sent))
        })?;
        debug!("Reset target held: {} sent, waiting for frame {} to apply", held.sent, barrier);

        let mut ticker = time::interval(self.cycle);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match fetcher.fetch(link, None, episode).await {
                Ok(snapshot) if snapshot.applied_seq >= barrier => {
                    info!("Reset complete after {:?}", started.elapsed());
                    return Ok(snapshot);
                }
                Ok(snapshot) => debug!("Robot at frame {}, waiting for {}", snapshot.applied_seq, barrier),
                Err(CloneEnvError::ObservationTimeout(budget)) => debug!("No snapshot within {:?} during reset", budget),
                Err(e) => return Err(e),
            }

            if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                return Err(CloneEnvError::Reset(format!(
                    "robot did not confirm reset frame {} within {:?}",
                    barrier, self.timeout
                )));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionManager;
    use crate::sim::{SimSettings, SimulatedRobot};
    use std::sync::Arc;

    const BUDGET: Duration = Duration::from_micros(4500);
    const CYCLE: Duration = Duration::from_millis(1);

    struct Rig {
        robot: SimulatedRobot,
        manager: ConnectionManager,
        stepper: StepController,
        fetcher: ObservationFetcher,
        resetter: ResetController,
    }

    async fn rig(settings: SimSettings) -> Rig {
        let robot = SimulatedRobot::new(settings);
        let mut manager = ConnectionManager::new(Arc::new(robot.clone()), Duration::from_secs(1));
        manager.connect("test-bot", Duration::from_secs(1), None).await.unwrap();
        Rig {
            robot,
            manager,
            stepper: StepController::new(BUDGET, CYCLE),
            fetcher: ObservationFetcher::new(BUDGET),
            resetter: ResetController::new(Duration::from_millis(100), Duration::from_millis(500), CYCLE),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_reaches_target() {
        let rig = rig(SimSettings::new(3)).await;
        let link = rig.manager.link().unwrap();
        let home = ActionVector::release(3);

        let snapshot = rig
            .resetter
            .reset(&link, &rig.stepper, &rig.fetcher, &home, 1)
            .await
            .unwrap();
        assert_eq!(snapshot.readings.as_slice(), &[-1.0, -1.0, -1.0]);
        assert_eq!(snapshot.episode, 1);
        assert_eq!(rig.robot.command(), vec![-1.0, -1.0, -1.0]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_prior_action_never_leaks_past_reset() {
        let settings = SimSettings::new(3).with_actuation_delay(Duration::from_millis(80));
        let rig = rig(settings).await;
        let link = rig.manager.link().unwrap();

        let step = rig
            .stepper
            .step(&link, &ActionVector::from([0.9, 0.9, 0.9]), None)
            .await
            .unwrap();
        assert!(step.accepted);

        let home = ActionVector::release(3);
        let snapshot = rig
            .resetter
            .reset(&link, &rig.stepper, &rig.fetcher, &home, 1)
            .await
            .unwrap();
        assert!(snapshot.applied_seq > step.seq);
        assert_eq!(snapshot.readings.as_slice(), &[-1.0, -1.0, -1.0]);

        for _ in 0..5 {
            time::sleep(Duration::from_millis(30)).await;
            let later = rig.fetcher.fetch(&link, None, 1).await.unwrap();
            assert_eq!(later.readings.as_slice(), &[-1.0, -1.0, -1.0]);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stuck_robot_fails_reset() {
        let rig = rig(SimSettings::new(2)).await;
        rig.robot.set_frozen(true);
        let link = rig.manager.link().unwrap();

        let err = rig
            .resetter
            .reset(&link, &rig.stepper, &rig.fetcher, &ActionVector::release(2), 1)
            .await
            .unwrap_err();
        assert!(matches!(err, CloneEnvError::Reset(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unacknowledged_reset_fails() {
        let settings = SimSettings::new(2).with_ack_latency(Duration::from_millis(10));
        let rig = rig(settings).await;
        let link = rig.manager.link().unwrap();

        let err = rig
            .resetter
            .reset(&link, &rig.stepper, &rig.fetcher, &ActionVector::release(2), 1)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("acknowledged none"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unbounded_timeout_still_completes() {
        let rig = rig(SimSettings::new(2)).await;
        let link = rig.manager.link().unwrap();
        let resetter = ResetController::new(Duration::from_millis(50), Duration::MAX, CYCLE);

        let snapshot = resetter
            .reset(&link, &rig.stepper, &rig.fetcher, &ActionVector::release(2), 1)
            .await
            .unwrap();
        assert_eq!(snapshot.readings.as_slice(), &[-1.0, -1.0]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_custom_target_shape_checked() {
        let rig = rig(SimSettings::new(3)).await;
        let link = rig.manager.link().unwrap();

        let err = rig
            .resetter
            .reset(&link, &rig.stepper, &rig.fetcher, &ActionVector::from([0.0, 0.0]), 1)
            .await
            .unwrap_err();
        assert!(matches!(err, CloneEnvError::Shape { .. }));
        assert_eq!(rig.robot.actions_received(), 0);
    }
}
