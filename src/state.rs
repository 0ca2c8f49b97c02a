// state.rs

use crate::*;

use std::{net::Ipv4Addr, sync::{atomic::AtomicBool, Mutex}};

use anyhow::anyhow;
use embedded_hal::digital::{OutputPin, PinState};

use tokio::sync::RwLock;

/// GPIO line driving the relay coil.
pub trait RelayOutput: Send + Sync {
    fn set(&mut self, on: bool) -> anyhow::Result<()>;
}

/// Relay output that only remembers its level, for running without hardware.
#[derive(Clone, Debug, Default)]
pub struct VirtualOutput {
    level: Arc<AtomicBool>,
}

impl VirtualOutput {
    pub fn is_on(&self) -> bool {
        self.level.load(Ordering::Relaxed)
    }
}

impl RelayOutput for VirtualOutput {
    fn set(&mut self, on: bool) -> anyhow::Result<()> {
        info!("Relay output -> {}", if on { "ON" } else { "OFF" });
        self.level.store(on, Ordering::Relaxed);
        Ok(())
    }
}

/// Relay coil on any embedded-hal output pin, high meaning energized.
pub struct PinOutput<P> {
    pin: Mutex<P>,
}

impl<P: OutputPin + Send> PinOutput<P> {
    pub fn new(pin: P) -> Self {
        Self { pin: Mutex::new(pin) }
    }
}

impl<P: OutputPin + Send> RelayOutput for PinOutput<P> {
    fn set(&mut self, on: bool) -> anyhow::Result<()> {
        let pin = self.pin.get_mut().map_err(|_| anyhow!("relay pin lock poisoned"))?;
        pin.set_state(PinState::from(on))
            .map_err(|e| anyhow!("relay pin: {e:?}"))
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DeviceState {
    pub relay_on: bool,
    /// false: automatic, true: manually overridden
    pub forced: bool,
}

/// The relay and its mode. Every transition is a plain synchronous method so
/// that a caller holding the write guard cannot suspend halfway through.
pub struct Relay {
    state: DeviceState,
    output: Box<dyn RelayOutput>,
}

impl Relay {
    /// Starts switched off, in automatic mode.
    pub fn new(mut output: Box<dyn RelayOutput>) -> Self {
        if let Err(e) = output.set(false) {
            error!("Relay init failed: {e:#}");
        }
        Relay {
            state: DeviceState::default(),
            output,
        }
    }

    pub fn state(&self) -> DeviceState {
        self.state
    }

    /// Operator command: switch and hold until released.
    pub fn force(&mut self, on: bool) {
        self.drive(on);
        self.state.forced = true;
    }

    /// Operator command: hand control back to the schedule.
    pub fn release(&mut self) {
        self.state.forced = false;
    }

    /// Schedule decision. Ignored while forced.
    pub fn schedule(&mut self, on: bool) -> bool {
        if self.state.forced {
            return false;
        }
        self.drive(on);
        true
    }

    /// Over-temperature cutoff: drop the override and switch off.
    pub fn trip(&mut self) {
        self.state.forced = false;
        self.drive(false);
    }

    fn drive(&mut self, on: bool) {
        if self.state.relay_on == on {
            return;
        }
        match self.output.set(on) {
            Ok(()) => self.state.relay_on = on,
            Err(e) => error!("Relay switch failed: {e:#}"),
        }
    }
}

/// Body of every API reply.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct StatusReport {
    pub time: String,
    pub forced: bool,
    pub switch: u8,
    pub temp: Option<f32>,
}

pub struct MyState {
    pub config: MyConfig,
    pub schedule: ScheduleTable,
    pub files: KnownFileSet,
    pub relay: RwLock<Relay>,
    pub sensor: SensorChannel,
    pub clock: WallClock,
    pub api_cnt: AtomicU32,
    pub wifi_up: RwLock<bool>,
    pub ip_addr: RwLock<Ipv4Addr>,
    pub myid: RwLock<String>,
    pub reset: RwLock<bool>,
}

impl MyState {
    pub fn new(
        config: MyConfig,
        schedule: ScheduleTable,
        files: KnownFileSet,
        relay: Relay,
        sensor: SensorChannel,
    ) -> Self {
        MyState {
            config,
            schedule,
            files,
            relay: RwLock::new(relay),
            sensor,
            clock: WallClock::new(),
            api_cnt: AtomicU32::new(0),
            wifi_up: RwLock::new(false),
            ip_addr: RwLock::new(Ipv4Addr::new(0, 0, 0, 0)),
            myid: RwLock::new("esp32relay".into()),
            reset: RwLock::new(false),
        }
    }

    pub async fn status(&self) -> StatusReport {
        let now = self.clock.now().await;
        let device = self.relay.read().await.state();
        StatusReport {
            time: now.format("%H:%M").to_string(),
            forced: device.forced,
            switch: device.relay_on as u8,
            temp: self.sensor.read().celsius(),
        }
    }

    /// Station id and address, as published by the network link.
    pub async fn identity(&self) -> String {
        format!("{}@{}", self.myid.read().await, self.ip_addr.read().await)
    }

    pub async fn wait_for_wifi(&self) {
        loop {
            if *self.wifi_up.read().await {
                break;
            }
            sleep(Duration::from_secs(1)).await;
        }
    }
}

/// Restarts the device once the reset flag has been raised.
pub async fn poll_reset(state: Arc<Pin<Box<MyState>>>) -> anyhow::Result<()> {
    loop {
        sleep(Duration::from_secs(2)).await;

        if *state.reset.read().await {
            info!("Reset requested.");
            restart();
        }
    }
}

/// Unconditional device reset. On a host build this ends the process.
pub fn restart() -> ! {
    #[cfg(target_os = "espidf")]
    {
        esp_idf_hal::reset::restart();
    }
    #[cfg(not(target_os = "espidf"))]
    {
        error!("Restart requested, exiting.");
        std::process::exit(1);
    }
}

#[cfg(test)]
pub(crate) fn test_state(schedule: ScheduleTable, reading: SensorReading) -> (Arc<Pin<Box<MyState>>>, VirtualOutput) {
    let output = VirtualOutput::default();
    let state = MyState::new(
        MyConfig::default(),
        schedule,
        KnownFileSet::default(),
        Relay::new(Box::new(output.clone())),
        SensorChannel::fixed(reading),
    );
    (Arc::new(Box::pin(state)), output)
}


// EOF
