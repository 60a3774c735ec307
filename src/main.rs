//! # loopbench plant
//!
//! Runs the spring-mass plant against a controller service over UDP.
//!
//! ## Modes
//! - **Local** (default): a controller service of the chosen class is started
//!   in this process on its own thread and loopback socket.
//! - **Remote** (`--controller ADDR`): samples go to a service started
//!   elsewhere, e.g. with the `controller` binary.
//!
//! ## Outputs (with `--output-dir DIR`)
//! - `simulation.csv`, `sensors.csv`, `actuators.csv`: per-tick plant records.
//! - `client.csv`: one row per sample with send/receive times and RTT.
//! - `service.csv`: the local service's receive/process/send times.
//! - `diagnostics.csv`: drop and error counters.
//! - `plant_config.csv`, `service_config.csv`: the parameters used.
//! - `errlog.csv`: properties that failed sanity checks, if the run aborted.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use clap::Parser;
use log::{error, info, warn};

use loopbench::config::{ControllerServiceConfig, PlantConfig, save_config};
use loopbench::controller::{Dispatcher, LocalDispatcher, RemoteController};
use loopbench::demo::{demo_plant, register_demo_controllers};
use loopbench::plant::{PlantRecorders, emulation_runtime, run_udp_plant};
use loopbench::utils::diagnostics::Diagnostics;
use loopbench::utils::logging::init_logging;

/// Networked closed-loop emulation: plant side
#[derive(Parser, Debug)]
#[command(name = "loopbench")]
#[command(version)]
#[command(about = "Tick a simulated plant and close the loop through a UDP controller")]
struct Args {
    /// Plant ticks per second.
    #[arg(short = 'r', long, default_value_t = 100)]
    tick_rate: u32,

    /// Sampling rate of the position and velocity sensors; must divide the tick rate.
    #[arg(short = 's', long, default_value_t = 50)]
    sensor_rate: u32,

    /// Half-width of the uniform noise added to position readings.
    #[arg(long, default_value_t = 0.0)]
    noise: f64,

    /// Run for this many seconds; runs until Ctrl-C when omitted.
    #[arg(short = 't', long)]
    duration: Option<f64>,

    /// Address of an already running controller service.
    #[arg(short = 'c', long, value_name = "ADDR")]
    controller: Option<SocketAddr>,

    /// Controller class to start locally.
    #[arg(long, default_value = "pid")]
    class: String,

    /// Local address for the plant socket.
    #[arg(long, default_value = "0.0.0.0:0")]
    bind: SocketAddr,

    /// Directory for CSV recordings.
    #[arg(short = 'o', long, value_name = "DIR")]
    output_dir: Option<PathBuf>,

    /// Blocking threads available to simulation steps.
    #[arg(long, default_value_t = 2)]
    blocking_threads: usize,

    /// Artificial delay before each local controller reply, in milliseconds.
    #[arg(long, default_value_t = 0)]
    reply_delay_ms: u64,

    /// Run the local controller worker at maximum thread priority.
    #[arg(long)]
    realtime: bool,

    /// Pin the local controller worker to this core.
    #[arg(long)]
    pin_core: Option<usize>,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() {
    let args = Args::parse();
    init_logging(args.verbose);
    info!("=== LOOPBENCH PLANT START ===");

    if let Err(e) = run(args) {
        error!("Emulation failed: {e}");
        process::exit(1);
    }
    info!("=== LOOPBENCH PLANT FINISHED ===");
}

fn run(args: Args) -> loopbench::Result<()> {
    let plant_config = PlantConfig {
        tick_rate: args.tick_rate,
        duration_s: args.duration,
        bind_addr: args.bind,
        controller_addr: args.controller,
        output_dir: args.output_dir.clone(),
        blocking_threads: args.blocking_threads,
    };
    plant_config.validate()?;
    let service_config = ControllerServiceConfig {
        reply_delay_ms: args.reply_delay_ms,
        output_dir: args.output_dir.clone(),
        realtime_priority: args.realtime,
        pin_core: args.pin_core,
        ..Default::default()
    };

    let recorders = match &args.output_dir {
        Some(dir) => {
            let recorders = PlantRecorders::csv(dir)?;
            save_config(&plant_config, dir.join("plant_config.csv"))?;
            if plant_config.controller_addr.is_none() {
                save_config(&service_config, dir.join("service_config.csv"))?;
            }
            info!("Recording to {}", dir.display());
            recorders
        }
        None => PlantRecorders::null(),
    };

    let diagnostics = Diagnostics::new();
    let plant = demo_plant(
        args.tick_rate,
        args.sensor_rate,
        args.noise,
        recorders.clone(),
        diagnostics.clone(),
    )?;

    let dispatcher: Box<dyn Dispatcher> = match plant_config.controller_addr {
        Some(addr) => Box::new(RemoteController::new(addr)),
        None => {
            let mut local = LocalDispatcher::new(service_config);
            register_demo_controllers(&mut local, args.sensor_rate);
            Box::new(local)
        }
    };
    let handle = dispatcher.spawn_controller(&args.class, &plant.controller_params())?;

    let running = Arc::new(AtomicBool::new(true));
    let rt = emulation_runtime(plant_config.blocking_threads)?;
    let outcome = rt.block_on(async {
        let stop = running.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Ctrl-C received, stopping plant");
                stop.store(false, Ordering::SeqCst);
            }
        });
        run_udp_plant(
            plant,
            &plant_config,
            handle.addr(),
            recorders,
            diagnostics,
            running.clone(),
        )
        .await
    });

    match handle.shutdown() {
        Ok(Some(service)) => info!(
            "Controller service: {} samples received, {} replies sent, {} overwritten",
            service.samples_received, service.replies_sent, service.diagnostics.overwritten_samples
        ),
        Ok(None) => {}
        Err(e) => warn!("Controller service did not stop cleanly: {e}"),
    }

    let report = outcome?;
    report.log_summary();
    println!(
        "ticks={} samples={} replies={} unanswered={}",
        report.ticks, report.samples_sent, report.replies, report.unanswered
    );
    Ok(())
}
