use anyhow::Context;
use embassy_executor::{Executor, Spawner};
use env_logger::Builder;
use log::{LevelFilter, error, info};
use std::thread;

use glossy_radio_simulator::scheduler::{MacConfiguration, ProtocolConfig};
use glossy_radio_simulator::simulation::{
    self, CompletionSignal, ReportQueue, Scene, SimulationOutcome, load_scene,
    types::{ReportQueueReceiver, ReportQueueSender},
};
use glossy_radio_simulator::time_driver;

const DEFAULT_SCENE: &str = "demos/scene.json";

fn embassy_init(
    spawner: Spawner,
    scene: Scene,
    protocol: ProtocolConfig,
    report_tx: ReportQueueSender,
    report_rx: ReportQueueReceiver,
    done: &'static CompletionSignal,
) {
    let sink = scene.sink;
    let initial_config: MacConfiguration = scene.mac_config;
    let _ = spawner.spawn(simulation::report_task(report_rx, sink, initial_config, done));
    let _ = spawner.spawn(simulation::network_task(scene, protocol, report_tx));
}

fn run(scene_path: &str) -> anyhow::Result<SimulationOutcome> {
    let scene = load_scene(scene_path).with_context(|| format!("Failed to load scene {}", scene_path))?;
    let protocol = ProtocolConfig::load_for_scene(scene_path)
        .map_err(anyhow::Error::msg)
        .context("Failed to load timing configuration")?;

    info!(
        "Scene {}: {} nodes, sink {}, {} rounds at {}% speed",
        scene_path,
        scene.nodes.len(),
        scene.sink,
        scene.rounds,
        scene.speed_percent
    );
    time_driver::set_simulation_speed_percent(scene.speed_percent);

    let report_queue: &'static ReportQueue = Box::leak(Box::new(ReportQueue::new()));
    let done: &'static CompletionSignal = Box::leak(Box::new(CompletionSignal::new()));
    let report_tx = report_queue.sender();
    let report_rx = report_queue.receiver();

    // The network holds `Rc` state, so it is built on the executor thread.
    let _embassy_handle = thread::Builder::new()
        .stack_size(16 * 1024 * 1024)
        .name("embassy-executor".to_string())
        .spawn(move || {
            // Leak the executor to satisfy the 'static lifetime required by run()
            let executor: &'static mut Executor = Box::leak(Box::new(Executor::new()));
            executor.run(|spawner| embassy_init(spawner, scene, protocol, report_tx, report_rx, done));
        })
        .context("Failed to spawn embassy thread")?;

    Ok(embassy_futures::block_on(done.wait()))
}

fn main() {
    Builder::new()
        .filter_level(LevelFilter::Info)
        .filter(Some("glossy_radio_simulator"), LevelFilter::Debug)
        .parse_default_env()
        .init();

    let scene_path = std::env::args().nth(1).unwrap_or_else(|| DEFAULT_SCENE.to_string());
    info!("Starting up");

    match run(&scene_path) {
        Ok(outcome) => {
            info!("Simulation finished: {} rounds, {}/{} relays synchronized", outcome.rounds, outcome.synced_relays, outcome.relays);
        }
        Err(e) => {
            error!("{:#}", e);
            std::process::exit(1);
        }
    }
}
