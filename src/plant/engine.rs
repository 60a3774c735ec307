//! The synchronous tick core: actuators → simulation → sensors.
//!
//! `Plant` does no I/O and no scheduling; the runner owns timing and the
//! controller channel and hands the core to a blocking worker each tick.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use log::{info, warn};

use crate::error::{EmulationError, Result};
use crate::plant::actuator::{Actuator, ActuatorArray};
use crate::plant::physics::PhysicalSimulation;
use crate::plant::sensor::{Sensor, SensorArray};
use crate::plant::state::State;
use crate::protocol::PropertyMap;
use crate::utils::diagnostics::{DiagnosticEvent, Diagnostics};
use crate::utils::recorder::{CsvRecorder, NullRecorder, SharedRecorder};

/// Sinks for everything the plant side records.
#[derive(Clone)]
pub struct PlantRecorders {
    pub simulation: SharedRecorder,
    pub sensors: SharedRecorder,
    pub actuators: SharedRecorder,
    pub client: SharedRecorder,
}

impl PlantRecorders {
    pub fn null() -> Self {
        let null: SharedRecorder = Arc::new(NullRecorder);
        Self {
            simulation: null.clone(),
            sensors: null.clone(),
            actuators: null.clone(),
            client: null,
        }
    }

    /// CSV files `simulation.csv`, `sensors.csv`, `actuators.csv` and
    /// `client.csv` under `dir`, which is created if needed.
    pub fn csv(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        if dir.exists() && !dir.is_dir() {
            return Err(EmulationError::Config(format!(
                "{} exists and is not a directory",
                dir.display()
            )));
        }
        std::fs::create_dir_all(dir)?;
        Ok(Self {
            simulation: Arc::new(CsvRecorder::create(dir.join("simulation.csv"))?),
            sensors: Arc::new(CsvRecorder::create(dir.join("sensors.csv"))?),
            actuators: Arc::new(CsvRecorder::create(dir.join("actuators.csv"))?),
            client: Arc::new(CsvRecorder::create(dir.join("client.csv"))?),
        })
    }

    pub fn shutdown(&self) {
        self.simulation.shutdown();
        self.sensors.shutdown();
        self.actuators.shutdown();
        self.client.shutdown();
    }
}

impl Default for PlantRecorders {
    fn default() -> Self {
        Self::null()
    }
}

pub struct Plant {
    simulation: PhysicalSimulation,
    sensors: SensorArray,
    actuators: ActuatorArray,
    diagnostics: Diagnostics,
}

impl Plant {
    pub fn builder(tick_rate: u32) -> PlantBuilder {
        PlantBuilder::new(tick_rate)
    }

    pub fn tick_rate(&self) -> u32 {
        self.simulation.tick_rate()
    }

    pub fn tick_count(&self) -> u64 {
        self.simulation.tick_count()
    }

    pub fn sim_time(&self) -> f64 {
        self.simulation.sim_time()
    }

    /// Param-role properties, handed to the dispatcher when starting a
    /// controller.
    pub fn controller_params(&self) -> PropertyMap {
        self.simulation.state().get_controller_params()
    }

    pub fn sensor_rates(&self) -> BTreeMap<String, u32> {
        self.sensors.sensor_rates()
    }

    pub fn initialize(&mut self) {
        info!(
            "Initializing plant: {} Hz, {:.1} ms per tick",
            self.tick_rate(),
            self.simulation.tick_delta() * 1e3
        );
        self.simulation.initialize();
    }

    pub fn shutdown(&mut self) {
        self.simulation.shutdown();
    }

    /// Runs one tick with `commands` as the newest actuation (empty when
    /// nothing arrived). Returns the samples to send, if any sensor fired.
    ///
    /// Only `UnrecoverableState` escapes; a sensor missing its property is
    /// logged, counted and the tick sends nothing.
    pub fn tick(&mut self, commands: &PropertyMap) -> Result<Option<PropertyMap>> {
        let tick = self.simulation.tick_count();
        let actuation = self.actuators.apply(tick, commands);
        let sensed = self.simulation.step(&actuation)?;
        match self.sensors.sample(tick, &sensed) {
            Ok(samples) => Ok(samples),
            Err(EmulationError::MissingProperty(prop)) => {
                warn!("Tick {tick}: missing expected update for property `{prop}`");
                self.diagnostics.record(DiagnosticEvent::MissingProperty);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

/// Assembles a [`Plant`]. Passed around by value; there is no global
/// instance.
pub struct PlantBuilder {
    tick_rate: u32,
    state: Option<Box<dyn State>>,
    sensors: Vec<Box<dyn Sensor>>,
    actuators: Vec<Box<dyn Actuator>>,
    recorders: PlantRecorders,
    diagnostics: Diagnostics,
}

impl PlantBuilder {
    pub fn new(tick_rate: u32) -> Self {
        Self {
            tick_rate,
            state: None,
            sensors: Vec::new(),
            actuators: Vec::new(),
            recorders: PlantRecorders::null(),
            diagnostics: Diagnostics::new(),
        }
    }

    pub fn state(mut self, state: Box<dyn State>) -> Self {
        self.state = Some(state);
        self
    }

    pub fn sensor(mut self, sensor: Box<dyn Sensor>) -> Self {
        self.sensors.push(sensor);
        self
    }

    pub fn actuator(mut self, actuator: Box<dyn Actuator>) -> Self {
        self.actuators.push(actuator);
        self
    }

    pub fn recorders(mut self, recorders: PlantRecorders) -> Self {
        self.recorders = recorders;
        self
    }

    pub fn diagnostics(mut self, diagnostics: Diagnostics) -> Self {
        self.diagnostics = diagnostics;
        self
    }

    pub fn build(self) -> Result<Plant> {
        if self.tick_rate == 0 {
            return Err(EmulationError::Config("tick rate must be positive".into()));
        }
        let state = self
            .state
            .ok_or_else(|| EmulationError::Config("plant has no state".into()))?;

        let layout = state.layout();
        for s in &self.sensors {
            if !layout.is_sensed(s.property()) {
                warn!("Sensor attached to `{}`, which is not a sensed property", s.property());
            }
        }
        for a in &self.actuators {
            if !layout.is_actuated(a.property()) {
                warn!("Actuator attached to `{}`, which is not an actuated property", a.property());
            }
        }

        let mut sensors = SensorArray::new(self.tick_rate).with_recorder(self.recorders.sensors);
        for s in self.sensors {
            sensors.register(s)?;
        }

        let mut actuators = ActuatorArray::new().with_recorder(self.recorders.actuators);
        actuators.set_diagnostics(self.diagnostics.clone());
        for a in self.actuators {
            actuators.register(a);
        }

        let mut simulation = PhysicalSimulation::new(state, self.tick_rate);
        simulation.set_recorder(self.recorders.simulation);
        simulation.set_diagnostics(self.diagnostics.clone());

        Ok(Plant {
            simulation,
            sensors,
            actuators,
            diagnostics: self.diagnostics,
        })
    }
}
