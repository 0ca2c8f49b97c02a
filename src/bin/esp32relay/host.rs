// bin/esp32relay/host.rs

use std::path::Path;

use esp32relay::*;

/// Stand-in for the DS18B20: a slow sawtooth between 30 and 50 °C, so the
/// over-temperature cutoff gets exercised every few minutes.
struct SimulatedThermometer {
    tick: u32,
}

impl Thermometer for SimulatedThermometer {
    fn start_conversion(&mut self) -> anyhow::Result<()> {
        self.tick = self.tick.wrapping_add(1);
        Ok(())
    }

    fn read_temperature(&mut self) -> anyhow::Result<f32> {
        Ok(30.0 + (self.tick % 40) as f32 * 0.5)
    }
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    info!("esp32relay v{FW_VERSION} starting up on host.");

    let config = MyConfig::from_env();
    info!("My config:\n{config:#?}");

    // no reason to stall a desktop run on a missing schedule file
    let schedule = ScheduleTable::load(Path::new(&config.schedule_path), Duration::ZERO).await;
    let files = KnownFileSet::scan(&config.html_dir);

    let output = VirtualOutput::default();
    let relay = Relay::new(Box::new(output));
    let (sensor, acquisition) = sensor_channel(Some(SimulatedThermometer { tick: 0 }));
    let wdt = SoftWatchdog::start(WATCHDOG_TIMEOUT)?;

    let shared_state = Arc::new(Box::pin(MyState::new(config, schedule, files, relay, sensor)));
    *shared_state.wifi_up.write().await = true;

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Cannot listen for Ctrl-C: {e}");
            std::future::pending::<()>().await;
        }
        info!("Shutdown requested.");
    };

    info!("Entering main loop...");
    tokio::select! {
        _ = Box::pin(poll_reset(shared_state.clone())) => { error!("poll_reset() ended."); }
        _ = Box::pin(acquisition.run()) => { error!("acquisition.run() ended."); }
        _ = Box::pin(safety_monitor(shared_state.clone())) => { error!("safety_monitor() ended."); }
        _ = Box::pin(automation(shared_state.clone())) => { error!("automation() ended."); }
        _ = Box::pin(clock_sync(shared_state.clone())) => { error!("clock_sync() ended."); }
        _ = Box::pin(heartbeat(wdt)) => { error!("heartbeat() ended."); }
        res = Box::pin(run_api_server(shared_state.clone(), shutdown)) => {
            match res {
                Ok(()) => info!("API server stopped."),
                Err(e) => error!("run_api_server() failed: {e:#}"),
            }
        }
    };

    Ok(())
}

// EOF
