use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use plcounter_backend::*;
use plcounterctrl_backend::{PlCounter, PluginSignal};

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let sim = Arc::new(SimDriver::new());
    sim.set_photon_rate(Some(42.));
    let (mut counter, signals) = PlCounter::new(sim.clone());

    let (info, ok) = counter.initialize();
    println!("initialize: {} ({})", info, ok);

    for _ in 0..3 {
        counter.grab(true);
    }
    // Faster clock: same stream, shorter counting windows
    if let Err(e) = counter.commit_settings("clock_freq", 1000.0.into()) {
        println!("commit failed: {}", e);
    }
    counter.grab(true);
    // Move the clock to another counter: full rebuild
    if let Err(e) = counter.commit_settings("clock_channel", "Dev1/ctr2".into()) {
        println!("commit failed: {}", e);
    }
    counter.grab(true);
    sim.inject(SimFault::ReadTimeout);
    counter.grab(true);
    counter.stop();
    counter.close();

    for signal in signals.try_iter() {
        match signal {
            PluginSignal::Data(export) | PluginSignal::TempData(export) => {
                println!("{} [{}]: {:?}", export.name, export.label, export.values.to_vec())
            }
            PluginSignal::Status(msg) => println!("status: {}", msg),
        }
    }
}
