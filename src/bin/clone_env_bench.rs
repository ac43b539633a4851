//! Control-loop timing bench
//!
//! Runs step/get_obs episodes against a simulated robot with configurable
//! link latency and prints one JSON event per line, so drop rates under a
//! given timeout budget can be measured before touching hardware.

use anyhow::{Context, Result};
use clap::Parser;
use clone_env::json_output::{output_event, EpisodeEvent, ErrorEvent, ObservationEvent, StepEvent};
use clone_env::{ActionVector, ControlEnvironment, EnvConfig, LogLevel, SimSettings, SimulatedRobot};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "clone-env-bench")]
#[command(about = "Measure control-loop drop rates against a simulated robot")]
#[command(version)]
struct Args {
    /// Path to the environment configuration file
    #[arg(short, long)]
    config: Option<String>,

    /// Number of episodes to run
    #[arg(long, default_value = "3")]
    episodes: u32,

    /// Steps per episode
    #[arg(long, default_value = "200")]
    steps: u32,

    /// Pause between step and get_obs in milliseconds
    #[arg(long, default_value = "0")]
    settle_ms: u64,

    /// Simulated actuator count
    #[arg(long, default_value = "6")]
    actuators: usize,

    /// Simulated acknowledgement latency in microseconds
    #[arg(long, default_value = "800")]
    ack_latency_us: u64,

    /// Simulated delay between receipt and actuation in milliseconds
    #[arg(long, default_value = "20")]
    actuation_delay_ms: u64,

    /// Log at debug level regardless of the configured level
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    fn load_config(&self) -> Result<EnvConfig> {
        let path = self
            .config
            .clone()
            .or_else(|| std::env::var("CLONE_ENV_CONFIG").ok());
        match path {
            Some(path) => EnvConfig::load_from_path(&path).with_context(|| format!("Failed to load config {}", path)),
            None => Ok(EnvConfig::default()),
        }
    }

    fn sim_settings(&self) -> SimSettings {
        SimSettings::new(self.actuators)
            .with_ack_latency(Duration::from_micros(self.ack_latency_us))
            .with_actuation_delay(Duration::from_millis(self.actuation_delay_ms))
    }
}

/// Smooth contraction pattern, phase-shifted per actuator
fn pattern(step: u32, actuators: usize) -> ActionVector {
    let values: Vec<f64> = (0..actuators)
        .map(|i| (step as f64 * 0.05 + i as f64 * 0.7).sin())
        .collect();
    ActionVector::from(values)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = args.load_config()?;

    let level = if args.verbose { LogLevel::Debug } else { config.log_level };
    tracing_subscriber::fmt()
        .with_env_filter(level.as_filter())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    info!("Control-loop bench against simulated {}", config.hostname);
    info!("Budget {:?}, {} episodes x {} steps", config.timeout_budget(), args.episodes, args.steps);

    let robot = SimulatedRobot::new(args.sim_settings());
    let env = ControlEnvironment::new(config, Arc::new(robot)).context("Failed to create environment")?;

    let profile = env.connect().await.context("Failed to connect")?;
    let settle = Duration::from_millis(args.settle_ms);

    for _ in 0..args.episodes {
        match env.reset(None).await {
            Ok(snapshot) => output_event(&ObservationEvent::reset(&snapshot)),
            Err(e) => {
                error!("Reset failed: {}", e);
                output_event(&ErrorEvent::new(&e.to_string(), None));
                break;
            }
        }
        let episode = env.episode().await.index;

        for step in 0..args.steps {
            let action = pattern(step, profile.actuator_count);
            match env.step(&action).await {
                Ok(result) => output_event(&StepEvent::new(episode, &result)),
                Err(e) => {
                    output_event(&ErrorEvent::new(&e.to_string(), Some(episode)));
                    if e.requires_reconnect() {
                        env.connect().await.context("Reconnect failed")?;
                    }
                    continue;
                }
            }

            if !settle.is_zero() {
                tokio::time::sleep(settle).await;
            }

            match env.get_obs().await {
                Ok(snapshot) => output_event(&ObservationEvent::observation(&snapshot)),
                Err(e) => output_event(&ErrorEvent::new(&e.to_string(), Some(episode))),
            }
        }

        let stats = env.episode().await;
        info!("Episode {}: {} of {} frames dropped", stats.index, stats.dropped, stats.steps);
        output_event(&EpisodeEvent::new(&stats));
    }

    env.close().await;
    info!("Bench complete");
    Ok(())
}
