//! Plant and controller wired together over loopback UDP.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::thread;
use std::time::Duration;

use loopbench::config::{ControllerServiceConfig, PlantConfig};
use loopbench::controller::{Controller, Dispatcher, LocalDispatcher};
use loopbench::demo::{FORCE, demo_plant, register_demo_controllers};
use loopbench::plant::{
    Plant, PlantRecorders, SimpleConstantActuator, SimpleSensor, State, StateLayout,
    emulation_runtime, run_udp_plant,
};
use loopbench::protocol::{PropValue, PropertyMap};
use loopbench::utils::diagnostics::Diagnostics;
use loopbench::utils::recorder::{MemoryRecorder, SharedRecorder};
use loopbench::Result;

struct Drift {
    layout: StateLayout,
    p: f64,
    u: f64,
}

impl Drift {
    fn boxed() -> Box<Self> {
        Box::new(Self {
            layout: StateLayout::builder().sensed("p").actuated("u").build().unwrap(),
            p: 0.0,
            u: 1.0,
        })
    }
}

impl State for Drift {
    fn layout(&self) -> &StateLayout {
        &self.layout
    }

    fn get(&self, name: &str) -> Option<PropValue> {
        match name {
            "p" => Some(self.p.into()),
            "u" => Some(self.u.into()),
            _ => None,
        }
    }

    fn set(&mut self, name: &str, value: PropValue) {
        if name == "u" {
            self.u = value.as_f64();
        }
    }

    fn advance(&mut self, delta_t: f64) {
        self.p += self.u * delta_t;
    }
}

fn memory_recorders() -> (PlantRecorders, Arc<MemoryRecorder>, Arc<MemoryRecorder>) {
    let sensors = Arc::new(MemoryRecorder::new());
    let client = Arc::new(MemoryRecorder::new());
    let mut recorders = PlantRecorders::null();
    recorders.sensors = sensors.clone() as SharedRecorder;
    recorders.client = client.clone() as SharedRecorder;
    (recorders, sensors, client)
}

fn plant_config(tick_rate: u32, duration_s: f64) -> PlantConfig {
    PlantConfig {
        tick_rate,
        duration_s: Some(duration_s),
        bind_addr: "127.0.0.1:0".parse().unwrap(),
        ..Default::default()
    }
}

#[test]
fn half_rate_sensor_fires_on_even_ticks() {
    let (recorders, sensors, _) = memory_recorders();
    let mut plant = Plant::builder(200)
        .state(Drift::boxed())
        .sensor(Box::new(SimpleSensor::new("p", 100)))
        .actuator(Box::new(SimpleConstantActuator::new("u", 1.0)))
        .recorders(recorders)
        .build()
        .unwrap();

    let mut fired = Vec::new();
    for _ in 0..200 {
        let tick = plant.tick_count();
        if plant.tick(&PropertyMap::new()).unwrap().is_some() {
            fired.push(tick);
        }
    }

    assert_eq!(plant.tick_count(), 200);
    assert_eq!(fired.len(), 100);
    assert!(fired.iter().all(|t| t % 2 == 0));

    let seqs = sensors.column("plant_seq");
    let samples = sensors.column("p_sample");
    assert_eq!(seqs.len(), 200);
    let sampled: Vec<f64> = seqs
        .iter()
        .zip(&samples)
        .filter(|(_, s)| !s.is_nan())
        .map(|(t, _)| *t)
        .collect();
    assert_eq!(sampled.len(), 100);
    assert!(sampled.iter().all(|t| *t as u64 % 2 == 0));
}

#[test]
fn slow_controller_does_not_stall_the_plant() {
    let mut dispatcher = LocalDispatcher::new(ControllerServiceConfig::default());
    dispatcher.register(
        "slow",
        Box::new(|_params: &PropertyMap| -> Result<Box<dyn Controller>> {
            let slow = |_: &PropertyMap| -> Result<PropertyMap> {
                thread::sleep(Duration::from_millis(200));
                Ok(PropertyMap::from([(FORCE.to_owned(), PropValue::Float(0.0))]))
            };
            Ok(Box::new(slow))
        }),
    );

    let (recorders, _, client) = memory_recorders();
    let diagnostics = Diagnostics::new();
    // 1 Hz sensors: a single sample at tick 0
    let plant = demo_plant(100, 1, 0.0, recorders.clone(), diagnostics.clone()).unwrap();
    let handle = dispatcher
        .spawn_controller("slow", &plant.controller_params())
        .unwrap();

    let rt = emulation_runtime(2).unwrap();
    let report = rt
        .block_on(run_udp_plant(
            plant,
            &plant_config(100, 0.6),
            handle.addr(),
            recorders,
            diagnostics,
            Arc::new(AtomicBool::new(true)),
        ))
        .unwrap();
    handle.shutdown().unwrap();

    assert!(report.ticks >= 30, "plant stalled at {} ticks", report.ticks);
    assert_eq!(report.samples_sent, 1);
    assert_eq!(report.replies, 1);
    assert_eq!(report.unanswered, 0);

    let rows = client.records();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("seq"), Some(0.0));
    let rtt = rows[0].get("rtt").unwrap();
    assert!(rtt >= 0.2 && rtt.is_finite(), "rtt {rtt}");
}

#[test]
fn pid_loop_over_udp_accounts_for_every_sample() {
    let mut dispatcher = LocalDispatcher::new(ControllerServiceConfig::default());
    register_demo_controllers(&mut dispatcher, 50);

    let (recorders, _, client) = memory_recorders();
    let diagnostics = Diagnostics::new();
    let plant = demo_plant(100, 50, 0.0, recorders.clone(), diagnostics.clone()).unwrap();
    let handle = dispatcher
        .spawn_controller("pid", &plant.controller_params())
        .unwrap();

    let rt = emulation_runtime(2).unwrap();
    let report = rt
        .block_on(run_udp_plant(
            plant,
            &plant_config(100, 1.0),
            handle.addr(),
            recorders,
            diagnostics,
            Arc::new(AtomicBool::new(true)),
        ))
        .unwrap();
    let service = handle.shutdown().unwrap().unwrap();

    assert_eq!(report.samples_sent, report.ticks.div_ceil(2));
    assert_eq!(report.replies + report.unanswered, report.samples_sent);
    assert!(report.replies > 0);
    assert_eq!(report.diagnostics.unprompted_replies, 0);
    assert!(report.rtt.is_some());
    assert_eq!(client.len() as u64, report.samples_sent);
    assert!(service.samples_received <= report.samples_sent);
}

#[test]
fn unreachable_controller_leaves_samples_unanswered() {
    // nothing listens here; the plant must still run to completion
    let nowhere: SocketAddr = {
        let s = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        s.local_addr().unwrap()
    };
    let (recorders, _, client) = memory_recorders();
    let diagnostics = Diagnostics::new();
    let plant = demo_plant(50, 10, 0.0, recorders.clone(), diagnostics.clone()).unwrap();

    let rt = emulation_runtime(1).unwrap();
    let report = rt
        .block_on(run_udp_plant(
            plant,
            &plant_config(50, 0.3),
            nowhere,
            recorders,
            diagnostics,
            Arc::new(AtomicBool::new(true)),
        ))
        .unwrap();

    assert!(report.samples_sent > 0);
    assert_eq!(report.replies, 0);
    assert_eq!(report.unanswered, report.samples_sent);
    assert!(client.column("rtt").iter().all(|r| r.is_infinite()));
}
