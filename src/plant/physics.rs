//! Fixed-rate stepping of a [`State`].

use std::sync::Arc;
use std::time::Instant;

use log::warn;

use crate::error::{EmulationError, Result};
use crate::plant::state::State;
use crate::protocol::PropertyMap;
use crate::utils::diagnostics::Diagnostics;
use crate::utils::recorder::{NullRecorder, Record, SharedRecorder};

pub struct PhysicalSimulation {
    state: Box<dyn State>,
    tick_rate: u32,
    tick_count: u64,
    sim_time: f64,
    last_step: Option<Instant>,
    recorder: SharedRecorder,
    diagnostics: Diagnostics,
}

impl PhysicalSimulation {
    pub fn new(state: Box<dyn State>, tick_rate: u32) -> Self {
        Self {
            state,
            tick_rate,
            tick_count: 0,
            sim_time: 0.0,
            last_step: None,
            recorder: Arc::new(NullRecorder),
            diagnostics: Diagnostics::new(),
        }
    }

    pub fn set_recorder(&mut self, recorder: SharedRecorder) {
        self.recorder = recorder;
    }

    pub fn set_diagnostics(&mut self, diagnostics: Diagnostics) {
        self.diagnostics = diagnostics;
    }

    pub fn tick_rate(&self) -> u32 {
        self.tick_rate
    }

    /// Nominal seconds per tick.
    pub fn tick_delta(&self) -> f64 {
        1.0 / self.tick_rate as f64
    }

    /// Completed steps.
    pub fn tick_count(&self) -> u64 {
        self.tick_count
    }

    /// Sum of every `dt` handed to the state so far.
    pub fn sim_time(&self) -> f64 {
        self.sim_time
    }

    pub fn state(&self) -> &dyn State {
        self.state.as_ref()
    }

    pub fn initialize(&mut self) {
        self.state.initialize();
    }

    pub fn shutdown(&mut self) {
        self.state.shutdown();
    }

    /// Applies `inputs`, advances the state by the time since the previous
    /// step and returns the sensed properties.
    ///
    /// The first step advances by 0. Fails with `UnrecoverableState` when any
    /// sanity check does not hold afterwards.
    pub fn step(&mut self, inputs: &PropertyMap) -> Result<PropertyMap> {
        for (name, value) in inputs {
            if self.state.layout().is_actuated(name) {
                self.state.set(name, *value);
            } else {
                warn!("Received update for unregistered actuated property `{name}`, skipping");
                self.diagnostics.record_unregistered(name);
            }
        }

        let now = Instant::now();
        let dt = self
            .last_step
            .map(|prev| now.duration_since(prev).as_secs_f64())
            .unwrap_or(0.0);
        self.last_step = Some(now);

        self.state.advance(dt);
        let step_time = now.elapsed().as_secs_f64();
        self.sim_time += dt;
        let tick = self.tick_count;
        self.tick_count += 1;

        let recorded = self.state.get_recorded();
        let mut rec = Record::with_capacity(4 + recorded.len());
        rec.push("tick", tick as f64);
        rec.push("sim_time", self.sim_time);
        rec.push("delta_t", dt);
        rec.push("step_time", step_time);
        for (name, value) in &recorded {
            rec.push(name.clone(), value.as_f64());
        }
        self.recorder.push_record(rec);

        let failed = self.state.check_sanity();
        if !failed.is_empty() {
            return Err(EmulationError::UnrecoverableState(failed));
        }
        Ok(self.state.get_sensed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plant::state::StateLayout;
    use crate::protocol::PropValue;
    use crate::utils::recorder::MemoryRecorder;
    use std::time::Duration;

    struct Drift {
        layout: StateLayout,
        x: f64,
        v: f64,
        last_dt: f64,
    }

    impl Drift {
        fn boxed() -> Box<Self> {
            Box::new(Self {
                layout: StateLayout::builder()
                    .sensed("x")
                    .actuated("v")
                    .checked("x", |x| x.as_f64().abs() < 1.0)
                    .build()
                    .unwrap(),
                x: 0.0,
                v: 0.0,
                last_dt: -1.0,
            })
        }
    }

    impl State for Drift {
        fn layout(&self) -> &StateLayout {
            &self.layout
        }

        fn get(&self, name: &str) -> Option<PropValue> {
            match name {
                "x" => Some(self.x.into()),
                "v" => Some(self.v.into()),
                "dt" => Some(self.last_dt.into()),
                _ => None,
            }
        }

        fn set(&mut self, name: &str, value: PropValue) {
            if name == "v" {
                self.v = value.as_f64();
            }
        }

        fn advance(&mut self, delta_t: f64) {
            self.last_dt = delta_t;
            self.x += self.v;
        }
    }

    #[test]
    fn first_step_has_zero_dt() {
        let mut sim = PhysicalSimulation::new(Drift::boxed(), 100);
        let out = sim.step(&PropertyMap::new()).unwrap();
        assert_eq!(sim.state().get("dt"), Some(PropValue::Float(0.0)));
        assert_eq!(out.keys().collect::<Vec<_>>(), vec!["x"]);

        std::thread::sleep(Duration::from_millis(5));
        sim.step(&PropertyMap::new()).unwrap();
        assert!(sim.state().get("dt").unwrap().as_f64() >= 0.005);
        assert_eq!(sim.tick_count(), 2);
    }

    #[test]
    fn unregistered_inputs_are_skipped() {
        let diag = Diagnostics::new();
        let mut sim = PhysicalSimulation::new(Drift::boxed(), 100);
        sim.set_diagnostics(diag.clone());
        let mut inputs = PropertyMap::new();
        inputs.insert("x".into(), PropValue::Float(0.5));
        let out = sim.step(&inputs).unwrap();
        assert_eq!(out["x"], PropValue::Float(0.0));
        assert_eq!(diag.unregistered_for("x"), 1);
    }

    #[test]
    fn failed_sanity_check_is_unrecoverable() {
        let mut sim = PhysicalSimulation::new(Drift::boxed(), 100);
        let mut inputs = PropertyMap::new();
        inputs.insert("v".into(), PropValue::Float(0.6));
        sim.step(&inputs).unwrap();
        let err = sim.step(&PropertyMap::new()).unwrap_err();
        match err {
            EmulationError::UnrecoverableState(failed) => {
                assert!((failed["x"].as_f64() - 1.2).abs() < 1e-9);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn each_step_is_recorded() {
        let rec = Arc::new(MemoryRecorder::new());
        let mut sim = PhysicalSimulation::new(Drift::boxed(), 50);
        sim.set_recorder(rec.clone());
        sim.step(&PropertyMap::new()).unwrap();
        sim.step(&PropertyMap::new()).unwrap();
        assert_eq!(rec.column("tick"), vec![0.0, 1.0]);
        let first = &rec.records()[0];
        let names: Vec<&str> = first.names().collect();
        assert_eq!(names, vec!["tick", "sim_time", "delta_t", "step_time", "v", "x"]);
    }
}
