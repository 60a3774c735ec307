//! Actuators and the actuator array.
//!
//! Actuators hold state between ticks: a tick without a fresh command reuses
//! whatever the actuator last produced (or its reset value, for impulses).

use std::collections::BTreeMap;
use std::sync::Arc;

use log::{debug, warn};
use rand::random_range;

use crate::protocol::{PropValue, PropertyMap};
use crate::utils::diagnostics::Diagnostics;
use crate::utils::recorder::{NullRecorder, Record, SharedRecorder};

pub trait Actuator: Send {
    fn property(&self) -> &str;

    /// Sets the target for subsequent actuations.
    fn set_value(&mut self, desired: PropValue);

    /// Value applied to the state this tick.
    fn get_actuation(&mut self) -> PropValue;
}

/// Keeps applying the last value it was set to.
#[derive(Debug, Clone)]
pub struct SimpleConstantActuator {
    prop: String,
    value: PropValue,
}

impl SimpleConstantActuator {
    pub fn new(prop: impl Into<String>, initial: impl Into<PropValue>) -> Self {
        Self {
            prop: prop.into(),
            value: initial.into(),
        }
    }
}

impl Actuator for SimpleConstantActuator {
    fn property(&self) -> &str {
        &self.prop
    }

    fn set_value(&mut self, desired: PropValue) {
        self.value = desired;
    }

    fn get_actuation(&mut self) -> PropValue {
        self.value
    }
}

/// Applies a set value once, then falls back to its default.
#[derive(Debug, Clone)]
pub struct SimpleImpulseActuator {
    prop: String,
    default: PropValue,
    value: PropValue,
}

impl SimpleImpulseActuator {
    pub fn new(prop: impl Into<String>, default: impl Into<PropValue>) -> Self {
        let default = default.into();
        Self {
            prop: prop.into(),
            default,
            value: default,
        }
    }
}

impl Actuator for SimpleImpulseActuator {
    fn property(&self) -> &str {
        &self.prop
    }

    fn set_value(&mut self, desired: PropValue) {
        self.value = desired;
    }

    fn get_actuation(&mut self) -> PropValue {
        std::mem::replace(&mut self.value, self.default)
    }
}

/// Constant actuator that lands within `±noise` of each target.
#[derive(Debug, Clone)]
pub struct NoisyConstantActuator {
    prop: String,
    noise: f64,
    value: PropValue,
}

impl NoisyConstantActuator {
    pub fn new(prop: impl Into<String>, initial: impl Into<PropValue>, noise: f64) -> Self {
        Self {
            prop: prop.into(),
            noise: noise.abs(),
            value: initial.into(),
        }
    }
}

impl Actuator for NoisyConstantActuator {
    fn property(&self) -> &str {
        &self.prop
    }

    fn set_value(&mut self, desired: PropValue) {
        self.value = if self.noise == 0.0 {
            desired
        } else {
            desired.offset(random_range(-self.noise..self.noise))
        };
    }

    fn get_actuation(&mut self) -> PropValue {
        self.value
    }
}

pub struct ActuatorArray {
    actuators: BTreeMap<String, Box<dyn Actuator>>,
    recorder: SharedRecorder,
    diagnostics: Diagnostics,
}

impl ActuatorArray {
    pub fn new() -> Self {
        Self {
            actuators: BTreeMap::new(),
            recorder: Arc::new(NullRecorder),
            diagnostics: Diagnostics::new(),
        }
    }

    pub fn with_recorder(mut self, recorder: SharedRecorder) -> Self {
        self.recorder = recorder;
        self
    }

    pub fn set_recorder(&mut self, recorder: SharedRecorder) {
        self.recorder = recorder;
    }

    pub fn set_diagnostics(&mut self, diagnostics: Diagnostics) {
        self.diagnostics = diagnostics;
    }

    /// Adds an actuator, replacing any actuator on the same property.
    pub fn register(&mut self, actuator: Box<dyn Actuator>) {
        let prop = actuator.property().to_owned();
        if self.actuators.insert(prop.clone(), actuator).is_some() {
            warn!("Replacing already registered actuator for property `{prop}`");
        } else {
            debug!("[ActuatorArray] actuator on `{prop}`");
        }
    }

    pub fn properties(&self) -> impl Iterator<Item = &str> {
        self.actuators.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.actuators.is_empty()
    }

    /// Feeds `commands` to their actuators and returns one output per
    /// registered actuator. Commands for unknown properties are counted and
    /// skipped.
    pub fn apply(&mut self, tick: u64, commands: &PropertyMap) -> PropertyMap {
        for (prop, value) in commands {
            match self.actuators.get_mut(prop) {
                Some(actuator) => actuator.set_value(*value),
                None => {
                    warn!("Received command for unregistered actuated property `{prop}`, skipping");
                    self.diagnostics.record_unregistered(prop);
                }
            }
        }

        let outputs: PropertyMap = self
            .actuators
            .iter_mut()
            .map(|(prop, a)| (prop.clone(), a.get_actuation()))
            .collect();

        let mut rec = Record::with_capacity(1 + 2 * outputs.len());
        rec.push("plant_seq", tick as f64);
        for (prop, out) in &outputs {
            rec.push(format!("{prop}_value"), out.as_f64());
            rec.push(
                format!("{prop}_target"),
                commands.get(prop).map_or(f64::NAN, PropValue::as_f64),
            );
        }
        self.recorder.push_record(rec);

        outputs
    }
}

impl Default for ActuatorArray {
    fn default() -> Self {
        Self::new()
    }
}
