//! Executor process entry point.
//!
//! Loads the model manifest, boots the in-process driver, runs the executor
//! until a stop is requested (term signal, host command or fatal error) and
//! exits 0 on a graceful stop, 1 on any init failure.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use log::{error, info};

use flow_executor::driver::{Driver, Hal};
use flow_executor::dump::DumpConfig;
use flow_executor::executor::{mark_term_signal, ExecutorConfig, FlowFuncExecutor};
use flow_executor::flowfunc::FlowFuncRegistry;
use flow_executor::manifest::ModelManifest;

/// Capacity used when the bootstrap creates the manifest's queues in the
/// in-process driver.
const DEFAULT_QUEUE_CAPACITY: usize = 128;
const MAIN_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Parser, Debug)]
#[command(name = "flow_executor", about = "Dataflow flow-function executor")]
struct Args {
    /// Device this executor is bound to.
    #[arg(long = "device_id", default_value_t = 0)]
    device_id: u32,

    /// Path to the model manifest written by the graph compiler.
    #[arg(long = "load_path")]
    load_path: PathBuf,

    /// Memory/scheduling group name for this deployment.
    #[arg(long = "group_name", default_value = "default")]
    group_name: String,

    /// Request queue carrying host control messages.
    #[arg(long = "req_queue_id")]
    req_queue_id: Option<u32>,

    /// Response queue paired with the request queue.
    #[arg(long = "rsp_queue_id")]
    rsp_queue_id: Option<u32>,

    /// Merge main and worker event masks on every thread.
    #[arg(long = "on_device")]
    on_device: bool,

    /// Append periodic metric snapshots to this CSV file.
    #[arg(long = "metrics_csv")]
    metrics_csv: Option<PathBuf>,

    #[arg(long = "ge.exec.enableDump")]
    enable_dump: bool,

    #[arg(long = "ge.exec.dumpPath")]
    dump_path: Option<String>,

    /// `_`-separated decimal steps or low-high ranges.
    #[arg(long = "ge.exec.dumpStep")]
    dump_step: Option<String>,

    /// One of input, output, all.
    #[arg(long = "ge.exec.dumpMode")]
    dump_mode: Option<String>,
}

extern "C" fn term_handler(_sig: libc::c_int) {
    mark_term_signal();
}

fn install_signal_handlers() {
    unsafe {
        libc::signal(libc::SIGTERM, term_handler as usize);
        libc::signal(libc::SIGINT, term_handler as usize);
    }
}

/// The deployer owns queue creation in a real deployment; the in-process
/// driver bootstraps them here instead.
fn bootstrap_queues(drv: &Driver, manifest: &ModelManifest, args: &Args) {
    for model in &manifest.models {
        for q in model.input_queues.iter().chain(&model.output_queues) {
            let _ = drv.queue_create(q.device_id, q.queue_id, DEFAULT_QUEUE_CAPACITY);
        }
        if let Some(status) = &model.status_output_queue {
            let _ = drv.queue_create(status.device_id, status.queue_id, DEFAULT_QUEUE_CAPACITY);
        }
    }
    for qid in [args.req_queue_id, args.rsp_queue_id].into_iter().flatten() {
        let _ = drv.queue_create(args.device_id, qid, DEFAULT_QUEUE_CAPACITY);
    }
}

fn run() -> Result<(), flow_executor::FlowError> {
    let args = Args::parse();
    info!(
        "executor starting: device_id={}, group={}, load_path={}",
        args.device_id,
        args.group_name,
        args.load_path.display()
    );

    let dump = DumpConfig::from_attrs(
        args.enable_dump,
        args.dump_path.as_deref(),
        args.dump_step.as_deref(),
        args.dump_mode.as_deref(),
    )?;

    let manifest = ModelManifest::load(&args.load_path)?;
    let drv = Driver::new(Arc::new(Hal::new()));
    bootstrap_queues(&drv, &manifest, &args);

    let cfg = ExecutorConfig {
        device_id: args.device_id,
        req_queue_id: args.req_queue_id,
        rsp_queue_id: args.rsp_queue_id,
        on_device: args.on_device,
        monitor_parent: args.on_device,
        metrics_csv: args.metrics_csv.clone(),
        dump,
        ..ExecutorConfig::default()
    };

    let registry = Arc::new(FlowFuncRegistry::new());
    let mut executor = FlowFuncExecutor::new(cfg, drv, registry);
    executor.init(&manifest)?;

    let executor = Arc::new(executor);
    executor.start()?;
    install_signal_handlers();

    while executor.is_running() {
        std::thread::sleep(MAIN_POLL_INTERVAL);
    }
    executor.wait_for_stop();
    Ok(())
}

fn main() -> ExitCode {
    env_logger::init();
    match run() {
        Ok(()) => {
            info!("executor exited cleanly");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("executor failed: {e}");
            ExitCode::FAILURE
        }
    }
}
