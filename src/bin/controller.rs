//! Standalone controller service.
//!
//! Listens for samples from a `loopbench --controller ADDR` plant and answers
//! them with one of the demo controllers. Runs until Ctrl-C.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use clap::Parser;
use log::{error, info, warn};

use loopbench::config::{ControllerServiceConfig, save_config};
use loopbench::controller::{ControllerService, LocalDispatcher};
use loopbench::demo::{SETPOINT, SpringMassState, register_demo_controllers};
use loopbench::plant::State;
use loopbench::protocol::PropValue;
use loopbench::utils::diagnostics::Diagnostics;
use loopbench::utils::logging::init_logging;
use loopbench::utils::recorder::{CsvRecorder, NullRecorder, SharedRecorder};

/// Networked closed-loop emulation: controller side
#[derive(Parser, Debug)]
#[command(name = "controller")]
#[command(version)]
#[command(about = "Serve a demo controller over UDP with a single busy-dropping worker")]
struct Args {
    /// Address to listen on.
    #[arg(short, long, default_value = "127.0.0.1:5005")]
    bind: SocketAddr,

    /// Controller class (`pid` or `passive`).
    #[arg(long, default_value = "pid")]
    class: String,

    /// Rate at which the plant samples position; sets the PID step.
    #[arg(short = 's', long, default_value_t = 50)]
    sensor_rate: u32,

    /// Position setpoint, overriding the reference plant's.
    #[arg(long)]
    setpoint: Option<f64>,

    /// Artificial delay before each reply, in milliseconds.
    #[arg(long, default_value_t = 0)]
    reply_delay_ms: u64,

    /// Worker wait on an empty slot before rechecking for shutdown, in milliseconds.
    #[arg(long, default_value_t = 10)]
    poll_timeout_ms: u64,

    /// Directory for `service.csv`.
    #[arg(short = 'o', long, value_name = "DIR")]
    output_dir: Option<PathBuf>,

    /// Run the worker at maximum thread priority.
    #[arg(long)]
    realtime: bool,

    /// Pin the worker to this core.
    #[arg(long)]
    pin_core: Option<usize>,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() {
    let args = Args::parse();
    init_logging(args.verbose);

    if let Err(e) = run(args) {
        error!("Controller service failed: {e}");
        process::exit(1);
    }
}

fn run(args: Args) -> loopbench::Result<()> {
    let config = ControllerServiceConfig {
        bind_addr: args.bind,
        reply_delay_ms: args.reply_delay_ms,
        poll_timeout_ms: args.poll_timeout_ms,
        output_dir: args.output_dir.clone(),
        realtime_priority: args.realtime,
        pin_core: args.pin_core,
    };
    config.validate()?;

    let recorder: SharedRecorder = match &args.output_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            save_config(&config, dir.join("service_config.csv"))?;
            Arc::new(CsvRecorder::create(dir.join("service.csv"))?)
        }
        None => Arc::new(NullRecorder),
    };

    let mut params = SpringMassState::reference()?.get_controller_params();
    if let Some(sp) = args.setpoint {
        params.insert(SETPOINT.to_owned(), PropValue::Float(sp));
    }
    let mut dispatcher = LocalDispatcher::new(config.clone());
    register_demo_controllers(&mut dispatcher, args.sensor_rate);
    let controller = dispatcher.build_controller(&args.class, &params)?;
    let class = args.class;

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let report = rt.block_on(async move {
        let service = ControllerService::bind(config, recorder, Diagnostics::new()).await?;
        info!("Serving `{class}` on {}", service.local_addr()?);
        let running = service.stop_handle();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Ctrl-C received, stopping controller service");
                running.store(false, Ordering::SeqCst);
            }
        });
        service.serve(controller).await
    })?;

    println!(
        "received={} replied={} overwritten={} unanswered={}",
        report.samples_received,
        report.replies_sent,
        report.diagnostics.overwritten_samples,
        report.unanswered
    );
    Ok(())
}
