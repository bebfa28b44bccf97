//! # RCIP Step Execution Engine
//!
//! Runs recipe steps against physical (or simulated) kitchen devices and
//! decides from fused sensor readings when each step is done.
//!
//! ## Features
//!
//! - **Step state machine**: `Pending -> Dispatched -> Monitoring -> Completed | Failed | Aborted`
//! - **Sensor fusion**: confidence-weighted primaries, backups and virtual estimators
//! - **Condition evaluation**: thresholds, inclusive ranges and RGB/HSV color boxes with tolerance
//! - **Adaptive control**: PID corrections with predictive overshoot dampening
//! - **Command translation**: capability-checked device commands, one in flight per device
//! - **Safety interlock**: temperature, pressure, runtime and device-fault ceilings that stop every device
//!
//! ## Quick Start
//!
//! ```no_run
//! use rcip_engine::{EngineConfig, ExecutionSession, Recipe, SimKitchen};
//! use std::sync::Arc;
//!
//! # async fn run(json: &str) -> Result<(), rcip_engine::EngineError> {
//! let recipe = Recipe::from_json_str(json)?;
//! let kitchen = Arc::new(SimKitchen::from_recipe(&recipe));
//! let session = ExecutionSession::builder(EngineConfig::default(), kitchen.clone(), kitchen)
//!     .recipe(&recipe)
//!     .build()?;
//!
//! for state in session.run_recipe(&recipe.steps).await? {
//!     println!("{}: {:?}", state.step_id, state.state);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`session`] - Session context, recipe orchestration and teardown
//! - [`scheduler`] - Per-step state machine and monitoring loop
//! - [`translator`] - Step to device command translation and device slots
//! - [`fusion`] - Sensor fusion
//! - [`evaluator`] - `done_when` evaluation
//! - [`controller`] - PID control
//! - [`safety`] - Safety monitor and interlock
//! - [`progress`] - Progress events
//! - [`driver`] - Device and sensor driver boundary
//! - [`sim`] - Simulated kitchen

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::missing_errors_doc)]

pub mod config;
pub mod controller;
pub mod driver;
pub mod error;
pub mod evaluator;
pub mod fusion;
pub mod progress;
pub mod recipe;
pub mod safety;
pub mod scheduler;
pub mod session;
pub mod sim;
pub mod translator;

// Re-export main public types for convenience
pub use config::EngineConfig;
pub use driver::{DeviceDriver, SensorDriver};
pub use error::EngineError;
pub use recipe::{DeviceProfile, Recipe, SensorSpec, Step, Target};
pub use scheduler::{StepExecutionState, StepState};
pub use session::{ExecutionSession, StopReport};
pub use sim::SimKitchen;
