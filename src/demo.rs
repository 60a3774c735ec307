//! Reference plant and controllers used by the binaries and the tests.
//!
//! A damped spring-mass system: the mass position and velocity are sensed,
//! the applied force is actuated, and the physical constants plus the
//! position setpoint are params handed to the controller.

use std::time::Duration;

use pidgeon::{ControllerConfig, PidController};

use crate::controller::{Controller, LocalDispatcher};
use crate::error::{EmulationError, Result};
use crate::plant::{
    NoisySensor, Plant, PlantRecorders, Sensor, SimpleConstantActuator, SimpleSensor, State,
    StateLayout,
};
use crate::protocol::{PropValue, PropertyMap};
use crate::utils::diagnostics::Diagnostics;

pub const POSITION: &str = "position";
pub const VELOCITY: &str = "velocity";
pub const FORCE: &str = "force";
pub const MASS: &str = "mass";
pub const STIFFNESS: &str = "stiffness";
pub const DAMPING: &str = "damping";
pub const SETPOINT: &str = "setpoint";

/// The mass leaves the rig beyond this displacement.
pub const POSITION_LIMIT: f64 = 10.0;

pub struct SpringMassState {
    layout: StateLayout,
    position: f64,
    velocity: f64,
    force: f64,
    mass: f64,
    stiffness: f64,
    damping: f64,
    setpoint: f64,
}

impl SpringMassState {
    pub fn new(mass: f64, stiffness: f64, damping: f64, setpoint: f64) -> Result<Self> {
        if mass <= 0.0 {
            return Err(EmulationError::Config("mass must be positive".into()));
        }
        let layout = StateLayout::builder()
            .sensed(POSITION)
            .sensed(VELOCITY)
            .actuated(FORCE)
            .param(MASS)
            .param(STIFFNESS)
            .param(DAMPING)
            .param(SETPOINT)
            .checked(POSITION, |x| x.as_f64().abs() < POSITION_LIMIT)
            .build()?;
        Ok(Self {
            layout,
            position: 0.0,
            velocity: 0.0,
            force: 0.0,
            mass,
            stiffness,
            damping,
            setpoint,
        })
    }

    /// Unit mass on a lightly damped spring, asked to hold `position = 1`.
    pub fn reference() -> Result<Self> {
        Self::new(1.0, 4.0, 0.8, 1.0)
    }

    /// Starts the mass displaced from rest.
    pub fn with_position(mut self, position: f64) -> Self {
        self.position = position;
        self
    }
}

impl State for SpringMassState {
    fn layout(&self) -> &StateLayout {
        &self.layout
    }

    fn get(&self, name: &str) -> Option<PropValue> {
        let v = match name {
            POSITION => self.position,
            VELOCITY => self.velocity,
            FORCE => self.force,
            MASS => self.mass,
            STIFFNESS => self.stiffness,
            DAMPING => self.damping,
            SETPOINT => self.setpoint,
            _ => return None,
        };
        Some(v.into())
    }

    fn set(&mut self, name: &str, value: PropValue) {
        if name == FORCE {
            self.force = value.as_f64();
        }
    }

    // semi-implicit Euler
    fn advance(&mut self, delta_t: f64) {
        let accel =
            (self.force - self.stiffness * self.position - self.damping * self.velocity) / self.mass;
        self.velocity += accel * delta_t;
        self.position += self.velocity * delta_t;
    }
}

/// PID on the sensed position. Samples arrive at a fixed rate, so the step
/// is the sampling period rather than wall-clock time. The first sample only
/// seeds the PID and yields zero force.
pub struct PidPositionController {
    pid: PidController,
    period: f64,
}

impl PidPositionController {
    pub fn new(params: &PropertyMap, period: Duration) -> Result<Self> {
        let setpoint = params
            .get(SETPOINT)
            .map(PropValue::as_f64)
            .ok_or_else(|| EmulationError::Config(format!("controller needs param `{SETPOINT}`")))?;
        let config = ControllerConfig::new()
            .with_kp(8.0)
            .with_ki(6.0)
            .with_kd(3.0)
            .with_output_limits(-50.0, 50.0)
            .with_anti_windup(true);
        let mut pid = PidController::new(config);
        if pid.set_setpoint(setpoint).is_err() {
            return Err(EmulationError::Config(format!("rejected setpoint {setpoint}")));
        }
        Ok(Self {
            pid,
            period: period.as_secs_f64(),
        })
    }
}

impl Controller for PidPositionController {
    fn process(&mut self, samples: &PropertyMap) -> Result<PropertyMap> {
        let position = samples
            .get(POSITION)
            .ok_or_else(|| EmulationError::Controller(format!("sample lacks `{POSITION}`")))?
            .as_f64();
        let force = self.pid.compute(position, self.period);
        Ok(PropertyMap::from([(FORCE.to_owned(), force.into())]))
    }
}

/// Registers `pid` and `passive` (always zero force). `sample_rate` is the
/// position sensor rate the PID steps at.
pub fn register_demo_controllers(dispatcher: &mut LocalDispatcher, sample_rate: u32) {
    let period = Duration::from_secs_f64(1.0 / sample_rate.max(1) as f64);
    dispatcher.register(
        "pid",
        Box::new(move |params: &PropertyMap| -> Result<Box<dyn Controller>> {
            Ok(Box::new(PidPositionController::new(params, period)?))
        }),
    );
    dispatcher.register(
        "passive",
        Box::new(|_params: &PropertyMap| -> Result<Box<dyn Controller>> {
            let zero = |_: &PropertyMap| -> Result<PropertyMap> {
                Ok(PropertyMap::from([(FORCE.to_owned(), PropValue::Float(0.0))]))
            };
            Ok(Box::new(zero))
        }),
    );
}

/// The spring-mass plant with position and velocity sensors at
/// `sensor_rate`. Position readings carry `noise` when it is non-zero.
pub fn demo_plant(
    tick_rate: u32,
    sensor_rate: u32,
    noise: f64,
    recorders: PlantRecorders,
    diagnostics: Diagnostics,
) -> Result<Plant> {
    let position: Box<dyn Sensor> = if noise > 0.0 {
        Box::new(NoisySensor::new(POSITION, sensor_rate, noise))
    } else {
        Box::new(SimpleSensor::new(POSITION, sensor_rate))
    };
    Plant::builder(tick_rate)
        .state(Box::new(SpringMassState::reference()?))
        .sensor(position)
        .sensor(Box::new(SimpleSensor::new(VELOCITY, sensor_rate)))
        .actuator(Box::new(SimpleConstantActuator::new(FORCE, 0.0)))
        .recorders(recorders)
        .diagnostics(diagnostics)
        .build()
}
