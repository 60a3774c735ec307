//! Periodic plant loop.
//!
//! One current-thread tokio runtime drives the tick timer and the controller
//! socket. Each tick hands the [`Plant`] core to the bounded blocking pool for
//! the simulation step and gets it back with the result, so the step never
//! stalls network I/O and the core is never shared.

use std::fs::File;
use std::io::BufWriter;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use log::{Level, debug, error, info, log, warn};
use serde::Serialize;
use tokio::runtime::{Builder, Runtime};
use tokio::time::{MissedTickBehavior, interval};

use crate::config::PlantConfig;
use crate::error::{EmulationError, Result};
use crate::plant::engine::{Plant, PlantRecorders};
use crate::plant::interface::{ControllerInterface, UdpControllerInterface};
use crate::protocol::PropertyMap;
use crate::utils::diagnostics::{DiagnosticEvent, Diagnostics, DiagnosticsSnapshot};
use crate::utils::metrics::Stats;

const RATE_REPORT_INTERVAL: Duration = Duration::from_secs(5);

/// Runtime for the plant side: a single event-loop thread plus at most
/// `blocking_threads` workers for simulation steps.
pub fn emulation_runtime(blocking_threads: usize) -> Result<Runtime> {
    Ok(Builder::new_current_thread()
        .enable_all()
        .max_blocking_threads(blocking_threads.max(1))
        .thread_name("plant-step")
        .build()?)
}

/// Logs the effective tick rate every few seconds.
#[derive(Debug)]
pub struct TickRateMonitor {
    target_hz: f64,
    total_ticks: u64,
    window_start: Instant,
    window_ticks: u64,
}

impl TickRateMonitor {
    pub fn new(target_hz: u32) -> Self {
        Self::starting_at(target_hz, Instant::now())
    }

    pub fn starting_at(target_hz: u32, start: Instant) -> Self {
        Self {
            target_hz: target_hz as f64,
            total_ticks: 0,
            window_start: start,
            window_ticks: 0,
        }
    }

    /// Counts one tick. Returns the measured rate when a report is due.
    pub fn on_tick(&mut self, now: Instant) -> Option<f64> {
        self.total_ticks += 1;
        self.window_ticks += 1;
        let window = now.saturating_duration_since(self.window_start);
        if window < RATE_REPORT_INTERVAL {
            return None;
        }
        let ticks = self.window_ticks;
        self.window_ticks = 0;
        self.window_start = now;
        // nothing meaningful before a full second of ticks
        if (self.total_ticks as f64) < self.target_hz {
            return None;
        }

        let rate = ticks as f64 / window.as_secs_f64();
        log!(
            rate_level(rate / self.target_hz),
            "Current effective plant rate: {ticks} ticks in {:.3} s, for an average of {rate:.3} ticks/second",
            window.as_secs_f64()
        );
        Some(rate)
    }
}

/// Severity for a measured/target tick-rate ratio.
pub fn rate_level(ratio: f64) -> Level {
    if ratio >= 0.95 {
        Level::Info
    } else if ratio >= 0.85 {
        Level::Warn
    } else {
        Level::Error
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PlantReport {
    pub ticks: u64,
    pub elapsed_s: f64,
    pub samples_sent: u64,
    pub replies: u64,
    pub unanswered: u64,
    pub rtt: Option<Stats>,
    pub diagnostics: DiagnosticsSnapshot,
}

impl PlantReport {
    pub fn log_summary(&self) {
        info!(
            "Plant ran {} ticks in {:.3} s: {} samples sent, {} replies, {} unanswered",
            self.ticks, self.elapsed_s, self.samples_sent, self.replies, self.unanswered
        );
        if let Some(rtt) = &self.rtt {
            info!(
                "RTT over last {} replies: min {:.3} ms, mean {:.3} ms, max {:.3} ms",
                rtt.count,
                rtt.min * 1e3,
                rtt.mean * 1e3,
                rtt.max * 1e3
            );
        }
        let d = &self.diagnostics;
        if d.tick_overruns > 0
            || d.dropped_sends > 0
            || d.malformed > 0
            || d.unprompted_replies > 0
            || d.missing_properties > 0
        {
            warn!("Diagnostics: {d:?}");
        }
    }
}

pub struct PlantLoop<C: ControllerInterface> {
    plant: Plant,
    interface: C,
    duration: Option<Duration>,
    running: Arc<AtomicBool>,
    recorders: PlantRecorders,
    diagnostics: Diagnostics,
    output_dir: Option<PathBuf>,
}

impl<C: ControllerInterface> PlantLoop<C> {
    pub fn new(plant: Plant, interface: C, diagnostics: Diagnostics) -> Self {
        Self {
            plant,
            interface,
            duration: None,
            running: Arc::new(AtomicBool::new(true)),
            recorders: PlantRecorders::null(),
            diagnostics,
            output_dir: None,
        }
    }

    pub fn with_duration(mut self, duration: Option<Duration>) -> Self {
        self.duration = duration;
        self
    }

    /// Recorders to shut down (flush) when the loop ends.
    pub fn with_recorders(mut self, recorders: PlantRecorders) -> Self {
        self.recorders = recorders;
        self
    }

    /// Directory for the diagnostics summary and, on failure, the error log.
    pub fn with_output_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.output_dir = dir;
        self
    }

    /// Clearing this flag stops the loop before its next tick.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        self.running.clone()
    }

    /// Shares an externally owned run flag instead of the loop's own.
    pub fn with_stop_handle(mut self, running: Arc<AtomicBool>) -> Self {
        self.running = running;
        self
    }

    pub async fn run(self) -> Result<PlantReport> {
        let PlantLoop {
            plant,
            mut interface,
            duration,
            running,
            recorders,
            diagnostics,
            output_dir,
        } = self;

        let tick_rate = plant.tick_rate();
        let period = Duration::from_secs_f64(1.0 / tick_rate as f64);
        let mut core = Some(plant);
        if let Some(p) = core.as_mut() {
            p.initialize();
        }
        if let Some(d) = duration {
            info!("Target duration: {:.3} s", d.as_secs_f64());
        }

        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut monitor = TickRateMonitor::new(tick_rate);
        let started = Instant::now();
        info!("Scheduling plant ticks every {:.3} ms", period.as_secs_f64() * 1e3);

        let outcome: Result<()> = loop {
            if !running.load(Ordering::SeqCst) {
                info!("Plant loop stopped on request");
                break Ok(());
            }
            if duration.is_some_and(|d| started.elapsed() >= d) {
                warn!("Emulation timeout reached");
                break Ok(());
            }

            ticker.tick().await;
            let tick_start = Instant::now();

            let commands = interface.get_actuator_values();
            let Some(mut p) = core.take() else {
                break Err(EmulationError::Worker("plant core lost".into()));
            };
            let joined = tokio::task::spawn_blocking(move || {
                let result = p.tick(&commands);
                (p, result)
            })
            .await;
            let (p, result) = match joined {
                Ok(r) => r,
                Err(e) => break Err(EmulationError::Worker(format!("simulation step failed: {e}"))),
            };
            core = Some(p);

            match result {
                Ok(Some(samples)) => {
                    if let Err(e) = interface.put_sensor_values(samples) {
                        match e {
                            EmulationError::NotReady => break Err(e),
                            other => warn!("Could not send samples: {other}"),
                        }
                    }
                }
                Ok(None) => {}
                Err(e) => break Err(e),
            }

            let spent = tick_start.elapsed();
            if spent > period {
                warn!(
                    "Tick overran its period: {:.3} ms > {:.3} ms",
                    spent.as_secs_f64() * 1e3,
                    period.as_secs_f64() * 1e3
                );
                diagnostics.record(DiagnosticEvent::TickOverrun);
            }
            monitor.on_tick(Instant::now());
        };

        // shutdown: flush the channel, then the state, then the recorders
        let elapsed_s = started.elapsed().as_secs_f64();
        interface.shutdown();
        let ticks = core.as_ref().map_or(0, Plant::tick_count);
        if let Some(p) = core.as_mut() {
            p.shutdown();
        }
        recorders.shutdown();

        let snapshot = diagnostics.snapshot();
        let report = PlantReport {
            ticks,
            elapsed_s,
            samples_sent: interface.samples_sent(),
            replies: interface.replies(),
            unanswered: snapshot.unanswered,
            rtt: interface.rtt_stats(),
            diagnostics: snapshot,
        };

        if let Some(dir) = &output_dir {
            if let Err(e) = diagnostics.export_summary(dir.join("diagnostics.csv")) {
                warn!("Could not write diagnostics summary: {e}");
            }
        }

        match outcome {
            Ok(()) => {
                info!("Plant loop shut down cleanly");
                Ok(report)
            }
            Err(EmulationError::UnrecoverableState(failed)) => {
                error!("Simulation has reached an unrecoverable state. Aborting.");
                if let Some(dir) = &output_dir {
                    let path = dir.join("errlog.csv");
                    match write_errlog(&path, &failed) {
                        Ok(()) => error!(
                            "Details of variables which failed sanity checks have been output to {}",
                            path.display()
                        ),
                        Err(e) => error!("Could not write error log: {e}"),
                    }
                }
                report.log_summary();
                Err(EmulationError::UnrecoverableState(failed))
            }
            Err(e) => {
                error!("Plant tick loop aborted with error: {e}");
                Err(e)
            }
        }
    }
}

#[derive(Serialize)]
struct FailedProperty<'a> {
    property: &'a str,
    value: f64,
}

fn write_errlog(path: &Path, failed: &PropertyMap) -> Result<()> {
    let mut wtr = csv::Writer::from_writer(BufWriter::new(File::create(path)?));
    for (property, value) in failed {
        wtr.serialize(FailedProperty {
            property,
            value: value.as_f64(),
        })?;
    }
    wtr.flush()?;
    Ok(())
}

/// Binds a UDP interface to `controller` and runs `plant` against it until
/// the configured duration elapses, `stop` is cleared or the state becomes
/// unrecoverable. Must run inside a tokio runtime.
pub async fn run_udp_plant(
    plant: Plant,
    config: &PlantConfig,
    controller: SocketAddr,
    recorders: PlantRecorders,
    diagnostics: Diagnostics,
    stop: Arc<AtomicBool>,
) -> Result<PlantReport> {
    let mut interface =
        UdpControllerInterface::new(controller, recorders.client.clone(), diagnostics.clone());
    let local = interface.bind(config.bind_addr).await?;
    debug!("Plant socket {local} → controller {controller}");

    PlantLoop::new(plant, interface, diagnostics)
        .with_duration(config.duration())
        .with_recorders(recorders)
        .with_output_dir(config.output_dir.clone())
        .with_stop_handle(stop)
        .run()
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plant::actuator::SimpleConstantActuator;
    use crate::plant::interface::DummyControllerInterface;
    use crate::plant::sensor::SimpleSensor;
    use crate::plant::state::{State, StateLayout};
    use crate::protocol::PropValue;

    struct Ramp {
        layout: StateLayout,
        x: f64,
    }

    impl State for Ramp {
        fn layout(&self) -> &StateLayout {
            &self.layout
        }

        fn get(&self, name: &str) -> Option<PropValue> {
            match name {
                "x" => Some(self.x.into()),
                "u" => Some(0.0.into()),
                _ => None,
            }
        }

        fn set(&mut self, _name: &str, _value: PropValue) {}

        fn advance(&mut self, _delta_t: f64) {
            self.x += 1.0;
        }
    }

    fn ramp_plant(limit: f64) -> Plant {
        let state = Ramp {
            layout: StateLayout::builder()
                .sensed("x")
                .actuated("u")
                .checked("x", move |x| x.as_f64() < limit)
                .build()
                .unwrap(),
            x: 0.0,
        };
        Plant::builder(200)
            .state(Box::new(state))
            .sensor(Box::new(SimpleSensor::new("x", 100)))
            .actuator(Box::new(SimpleConstantActuator::new("u", 0.0)))
            .build()
            .unwrap()
    }

    #[test]
    fn rate_levels() {
        assert_eq!(rate_level(1.0), Level::Info);
        assert_eq!(rate_level(0.9), Level::Warn);
        assert_eq!(rate_level(0.5), Level::Error);
    }

    #[test]
    fn monitor_reports_after_interval() {
        let t0 = Instant::now();
        let mut m = TickRateMonitor::starting_at(10, t0);
        for i in 1..50 {
            assert!(m.on_tick(t0 + Duration::from_millis(100 * i)).is_none());
        }
        let rate = m.on_tick(t0 + Duration::from_secs(5)).unwrap();
        assert!((rate - 10.0).abs() < 1e-9, "{rate}");
    }

    #[test]
    fn monitor_stays_quiet_during_warm_up() {
        let t0 = Instant::now();
        let mut m = TickRateMonitor::starting_at(1000, t0);
        assert!(m.on_tick(t0 + Duration::from_secs(6)).is_none());
    }

    #[tokio::test]
    async fn duration_bounds_the_run() {
        let plant = ramp_plant(f64::INFINITY);
        let report = PlantLoop::new(plant, DummyControllerInterface::new(), Diagnostics::new())
            .with_duration(Some(Duration::from_millis(200)))
            .run()
            .await
            .unwrap();
        assert!(report.ticks > 0);
        assert_eq!(report.samples_sent, report.ticks.div_ceil(2));
    }

    #[tokio::test]
    async fn stop_flag_ends_the_loop() {
        let plant_loop = PlantLoop::new(ramp_plant(f64::INFINITY), DummyControllerInterface::new(), Diagnostics::new());
        let stop = plant_loop.stop_handle();
        stop.store(false, Ordering::SeqCst);
        let report = plant_loop.run().await.unwrap();
        assert_eq!(report.ticks, 0);
    }

    #[tokio::test]
    async fn unrecoverable_state_terminates() {
        let err = PlantLoop::new(ramp_plant(5.0), DummyControllerInterface::new(), Diagnostics::new())
            .with_duration(Some(Duration::from_secs(5)))
            .run()
            .await
            .unwrap_err();
        assert!(matches!(err, EmulationError::UnrecoverableState(_)));
    }
}
