//! Sensors and the frequency-divided sensor array.
//!
//! The array keeps a trigger table with one slot per plant cycle
//! (`tick % plant_freq`), listing the properties whose sensors fire on that
//! cycle. The table is rebuilt whenever a sensor is registered, so sampling is
//! a single lookup.

use std::collections::BTreeMap;
use std::sync::Arc;

use log::{debug, warn};
use rand::random_range;

use crate::error::{EmulationError, Result};
use crate::protocol::{PropValue, PropertyMap};
use crate::utils::recorder::{NullRecorder, Record, SharedRecorder};

pub trait Sensor: Send {
    fn property(&self) -> &str;

    /// Samples per second. Must divide the plant tick rate.
    fn sampling_frequency(&self) -> u32;

    fn process_sample(&mut self, value: PropValue) -> PropValue;
}

/// Perfect sensor: reports the value as read.
#[derive(Debug, Clone)]
pub struct SimpleSensor {
    prop: String,
    freq: u32,
}

impl SimpleSensor {
    pub fn new(prop: impl Into<String>, freq: u32) -> Self {
        Self {
            prop: prop.into(),
            freq,
        }
    }
}

impl Sensor for SimpleSensor {
    fn property(&self) -> &str {
        &self.prop
    }

    fn sampling_frequency(&self) -> u32 {
        self.freq
    }

    fn process_sample(&mut self, value: PropValue) -> PropValue {
        value
    }
}

/// Adds uniform noise in `[-noise, noise)` to every numeric sample.
#[derive(Debug, Clone)]
pub struct NoisySensor {
    prop: String,
    freq: u32,
    noise: f64,
}

impl NoisySensor {
    pub fn new(prop: impl Into<String>, freq: u32, noise: f64) -> Self {
        Self {
            prop: prop.into(),
            freq,
            noise: noise.abs(),
        }
    }
}

impl Sensor for NoisySensor {
    fn property(&self) -> &str {
        &self.prop
    }

    fn sampling_frequency(&self) -> u32 {
        self.freq
    }

    fn process_sample(&mut self, value: PropValue) -> PropValue {
        if self.noise == 0.0 {
            return value;
        }
        value.offset(random_range(-self.noise..self.noise))
    }
}

pub struct SensorArray {
    plant_freq: u32,
    sensors: BTreeMap<String, Box<dyn Sensor>>,
    // cycle index → properties to sample on that cycle
    triggers: Vec<Vec<String>>,
    recorder: SharedRecorder,
}

impl SensorArray {
    pub fn new(plant_freq: u32) -> Self {
        Self {
            plant_freq,
            sensors: BTreeMap::new(),
            triggers: vec![Vec::new(); plant_freq as usize],
            recorder: Arc::new(NullRecorder),
        }
    }

    pub fn with_recorder(mut self, recorder: SharedRecorder) -> Self {
        self.recorder = recorder;
        self
    }

    pub fn set_recorder(&mut self, recorder: SharedRecorder) {
        self.recorder = recorder;
    }

    /// Adds a sensor, replacing any sensor already on the same property.
    ///
    /// Fails with `IncompatibleFrequency` if the sensor's rate is zero, above
    /// the plant rate or does not divide it.
    pub fn register(&mut self, sensor: Box<dyn Sensor>) -> Result<()> {
        let freq = sensor.sampling_frequency();
        if freq == 0 || freq > self.plant_freq || self.plant_freq % freq != 0 {
            return Err(EmulationError::IncompatibleFrequency {
                property: sensor.property().to_owned(),
                sensor_freq: freq,
                plant_freq: self.plant_freq,
            });
        }

        let prop = sensor.property().to_owned();
        if self.sensors.insert(prop.clone(), sensor).is_some() {
            warn!("Replacing already registered sensor for property `{prop}`");
        }
        self.rebuild_triggers();
        debug!("[SensorArray] `{prop}` sampled at {freq} Hz");
        Ok(())
    }

    fn rebuild_triggers(&mut self) {
        for slot in &mut self.triggers {
            slot.clear();
        }
        for (prop, sensor) in &self.sensors {
            let spacing = (self.plant_freq / sensor.sampling_frequency()) as usize;
            for cycle in (0..self.plant_freq as usize).step_by(spacing) {
                self.triggers[cycle].push(prop.clone());
            }
        }
    }

    /// Properties sampled on `cycle`, in registration-map order.
    pub fn scheduled(&self, cycle: u32) -> &[String] {
        self.triggers
            .get(cycle as usize)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn sensor_rates(&self) -> BTreeMap<String, u32> {
        self.sensors
            .iter()
            .map(|(p, s)| (p.clone(), s.sampling_frequency()))
            .collect()
    }

    pub fn plant_freq(&self) -> u32 {
        self.plant_freq
    }

    pub fn is_empty(&self) -> bool {
        self.sensors.is_empty()
    }

    /// Runs the sensors scheduled for `tick` over `raw`.
    ///
    /// `Ok(None)` means no sensor fires this tick. A scheduled sensor whose
    /// property is missing from `raw` fails with `MissingProperty`. One record
    /// is pushed per call either way.
    pub fn sample(&mut self, tick: u64, raw: &PropertyMap) -> Result<Option<PropertyMap>> {
        let cycle = if self.plant_freq == 0 {
            0
        } else {
            (tick % self.plant_freq as u64) as usize
        };

        let mut samples = PropertyMap::new();
        let mut outcome = Ok(());
        let scheduled = self.triggers.get(cycle).map(Vec::as_slice).unwrap_or(&[]);
        for prop in scheduled {
            let (Some(value), Some(sensor)) = (raw.get(prop), self.sensors.get_mut(prop)) else {
                outcome = Err(EmulationError::MissingProperty(prop.clone()));
                break;
            };
            samples.insert(prop.clone(), sensor.process_sample(*value));
        }

        self.push_record(tick, raw, &samples);
        outcome?;

        if scheduled.is_empty() {
            Ok(None)
        } else {
            Ok(Some(samples))
        }
    }

    fn push_record(&self, tick: u64, raw: &PropertyMap, samples: &PropertyMap) {
        let mut rec = Record::with_capacity(1 + 2 * self.sensors.len());
        rec.push("plant_seq", tick as f64);
        for prop in self.sensors.keys() {
            rec.push(
                format!("{prop}_value"),
                raw.get(prop).map_or(f64::NAN, PropValue::as_f64),
            );
            rec.push(
                format!("{prop}_sample"),
                samples.get(prop).map_or(f64::NAN, PropValue::as_f64),
            );
        }
        self.recorder.push_record(rec);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::recorder::MemoryRecorder;

    fn raw(pairs: &[(&str, f64)]) -> PropertyMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), PropValue::Float(*v)))
            .collect()
    }

    #[test]
    fn divisor_frequencies_register() {
        for freq in [1, 2, 4, 5, 10, 20, 25, 50, 100] {
            let mut arr = SensorArray::new(100);
            assert!(arr.register(Box::new(SimpleSensor::new("p", freq))).is_ok(), "{freq}");
        }
    }

    #[test]
    fn incompatible_frequencies_are_rejected() {
        for freq in [0, 3, 7, 30, 101, 200] {
            let mut arr = SensorArray::new(100);
            let err = arr
                .register(Box::new(SimpleSensor::new("p", freq)))
                .unwrap_err();
            assert!(
                matches!(err, EmulationError::IncompatibleFrequency { sensor_freq, plant_freq: 100, .. } if sensor_freq == freq),
                "{freq}"
            );
            assert!(arr.is_empty());
        }
    }

    #[test]
    fn trigger_table_follows_rates() {
        let mut arr = SensorArray::new(100);
        arr.register(Box::new(SimpleSensor::new("a", 100))).unwrap();
        arr.register(Box::new(SimpleSensor::new("b", 50))).unwrap();
        for cycle in 0..100u32 {
            let fired = arr.scheduled(cycle);
            assert!(fired.contains(&"a".to_string()));
            assert_eq!(fired.contains(&"b".to_string()), cycle % 2 == 0, "cycle {cycle}");
        }
    }

    #[test]
    fn no_update_on_idle_cycle() {
        let mut arr = SensorArray::new(10);
        arr.register(Box::new(SimpleSensor::new("p", 5))).unwrap();
        let values = raw(&[("p", 1.0)]);
        assert_eq!(arr.sample(0, &values).unwrap(), Some(values.clone()));
        assert_eq!(arr.sample(1, &values).unwrap(), None);
        assert_eq!(arr.sample(12, &values).unwrap(), Some(values));
    }

    #[test]
    fn only_scheduled_properties_are_returned() {
        let mut arr = SensorArray::new(4);
        arr.register(Box::new(SimpleSensor::new("fast", 4))).unwrap();
        arr.register(Box::new(SimpleSensor::new("slow", 1))).unwrap();
        let values = raw(&[("fast", 1.0), ("slow", 2.0), ("other", 3.0)]);
        let first = arr.sample(0, &values).unwrap().unwrap();
        assert_eq!(first.len(), 2);
        let second = arr.sample(1, &values).unwrap().unwrap();
        assert_eq!(second.keys().collect::<Vec<_>>(), vec!["fast"]);
    }

    #[test]
    fn missing_property_fails_but_records() {
        let rec = Arc::new(MemoryRecorder::new());
        let mut arr = SensorArray::new(1).with_recorder(rec.clone());
        arr.register(Box::new(SimpleSensor::new("p", 1))).unwrap();
        let err = arr.sample(0, &PropertyMap::new()).unwrap_err();
        assert!(matches!(err, EmulationError::MissingProperty(p) if p == "p"));
        assert_eq!(rec.len(), 1);
        assert!(rec.column("p_value")[0].is_nan());
    }

    #[test]
    fn replacement_keeps_one_sensor_per_property() {
        let mut arr = SensorArray::new(10);
        arr.register(Box::new(SimpleSensor::new("p", 10))).unwrap();
        arr.register(Box::new(SimpleSensor::new("p", 2))).unwrap();
        assert_eq!(arr.sensor_rates().get("p"), Some(&2));
        assert_eq!(arr.scheduled(1).len(), 0);
        assert_eq!(arr.scheduled(5), ["p".to_string()]);
    }

    #[test]
    fn records_value_and_sample_columns() {
        let rec = Arc::new(MemoryRecorder::new());
        let mut arr = SensorArray::new(2).with_recorder(rec.clone());
        arr.register(Box::new(SimpleSensor::new("p", 1))).unwrap();
        let values = raw(&[("p", 4.0)]);
        arr.sample(0, &values).unwrap();
        arr.sample(1, &values).unwrap();
        assert_eq!(rec.column("plant_seq"), vec![0.0, 1.0]);
        let samples = rec.column("p_sample");
        assert_eq!(samples[0], 4.0);
        assert!(samples[1].is_nan());
    }

    #[test]
    fn noisy_sensor_stays_in_range() {
        let mut s = NoisySensor::new("p", 1, 0.5);
        for _ in 0..200 {
            let v = s.process_sample(PropValue::Float(10.0)).as_f64();
            assert!((9.5..=10.5).contains(&v));
        }
        assert_eq!(s.process_sample(PropValue::Bool(true)), PropValue::Bool(true));
    }
}
