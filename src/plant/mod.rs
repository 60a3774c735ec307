//! Plant side: physical state, sensors, actuators and the tick loop.

pub mod actuator;
pub mod engine;
pub mod interface;
pub mod physics;
pub mod runner;
pub mod sensor;
pub mod state;

pub use actuator::{
    Actuator, ActuatorArray, NoisyConstantActuator, SimpleConstantActuator, SimpleImpulseActuator,
};
pub use engine::{Plant, PlantBuilder, PlantRecorders};
pub use interface::{ControllerInterface, DummyControllerInterface, ReplyTracker, UdpControllerInterface};
pub use physics::PhysicalSimulation;
pub use runner::{PlantLoop, PlantReport, TickRateMonitor, emulation_runtime, run_udp_plant};
pub use sensor::{NoisySensor, Sensor, SensorArray, SimpleSensor};
pub use state::{PropertyRole, SanityCheck, State, StateLayout, StateLayoutBuilder};
