//! # loopbench
//!
//! Emulates a networked closed control loop. A plant process ticks a
//! physical simulation at a fixed rate, samples it through sensors that fire
//! on their own sub-rates, and sends the samples to a controller service over
//! UDP. The service runs one worker; samples that arrive while it is busy are
//! dropped in favour of the newest. Replies are applied on the plant's next
//! tick, and every hop is timestamped so round-trip times and drops can be
//! studied afterwards.
//!
//! ## Layout
//! - [`protocol`]: the MessagePack control messages and their factory.
//! - [`plant`]: state, sensors, actuators, the simulation core and the tick loop.
//! - [`controller`]: controller logic, the single-worker service and dispatchers.
//! - [`utils`]: clock, mailbox, recorders, diagnostics counters, logging.
//! - [`demo`]: a spring-mass plant with a PID position controller.

pub mod config;
pub mod controller;
pub mod demo;
pub mod error;
pub mod plant;
pub mod protocol;
pub mod utils;

pub use config::{ControllerServiceConfig, PlantConfig};
pub use error::{EmulationError, Result};
