//! clone-env - real-time control-loop client for remote robots
//!
//! Drives a robot through a step/observe/reset cycle over a transport link
//! while keeping every call inside a small timing budget (4.5 ms by default).
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use clone_env::{ActionVector, ControlEnvironment, EnvConfig, SimSettings, SimulatedRobot};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let robot = SimulatedRobot::new(SimSettings::new(3));
//!     let env = ControlEnvironment::new(EnvConfig::default().with_hostname("test-bot"), Arc::new(robot))?;
//!
//!     env.connect().await?;
//!     let step = env.step(&ActionVector::from([0.1, 0.2, 0.3])).await?;
//!     if !step.accepted {
//!         println!("frame {} dropped", step.seq);
//!     }
//!     let obs = env.get_obs().await?;
//!     println!("readings: {:?}", obs.readings);
//!
//!     env.reset(None).await?;
//!     env.close().await;
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! - **ControlEnvironment**: façade exposing connect/step/get_obs/reset/close
//! - **ConnectionManager**: transport handle lifecycle and connection state
//! - **StepController**: timeout-bounded action dispatch, dropped frames
//! - **ObservationFetcher**: snapshot retrieval independent of step completion
//! - **ResetController**: episode boundaries confirmed by the robot
//! - **TransportConnector / TransportHandle**: seam for the RPC client

pub mod codec;
pub mod config;
pub mod connection;
pub mod environment;
pub mod error;
pub mod json_output;
pub mod observation;
pub mod reset;
pub mod shape;
pub mod sim;
pub mod step;
pub mod transport;

pub use config::{CloseConfig, ConnectionConfig, EnvConfig, LogLevel, ResetConfig};
pub use connection::{ConnectionManager, ConnectionState, Link};
pub use environment::{ControlEnvironment, EpisodeStats};
pub use error::{CloneEnvError, Result};
pub use observation::{ObservationFetcher, ObservationSnapshot};
pub use reset::ResetController;
pub use shape::{ActionVector, Readings, ShapedBuffer};
pub use sim::{SimSettings, SimulatedRobot};
pub use step::{HoldSummary, StepController, StepResult};
pub use transport::{Ack, RobotProfile, TransportConnector, TransportHandle};
