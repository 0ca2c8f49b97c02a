// bin/esp32relay/esp.rs

use std::{ffi::CString, path::Path};

use anyhow::anyhow;
use esp32relay::*;
use esp_idf_hal::{
    delay::FreeRtos,
    gpio::{AnyIOPin, AnyInputPin, IOPin, Input, InputPin, OutputPin, PinDriver, Pull},
    prelude::Peripherals,
};
use esp_idf_svc::{eventloop::EspSystemEventLoop, nvs, timer::EspTaskTimerService, wifi::WifiDriver};
use esp_idf_sys::{esp, esp_app_desc};
use one_wire_bus::OneWire;

const CONFIG_RESET_COUNT: i32 = 9;
const SPIFFS_BASE: &str = "/spiffs";
const SPIFFS_MAX_FILES: usize = 8;

esp_app_desc!();

/// Task watchdog subscription of the thread running the async executor.
struct TaskWatchdog;

impl TaskWatchdog {
    fn subscribe(timeout: Duration) -> anyhow::Result<Self> {
        let config = esp_idf_sys::esp_task_wdt_config_t {
            timeout_ms: timeout.as_millis() as u32,
            idle_core_mask: 0,
            trigger_panic: true,
        };
        let rc = unsafe { esp_idf_sys::esp_task_wdt_init(&config) };
        // already initialized by sdkconfig is fine, then reconfigure
        if rc == esp_idf_sys::ESP_ERR_INVALID_STATE {
            esp! { unsafe { esp_idf_sys::esp_task_wdt_reconfigure(&config) } }?;
        } else {
            esp!(rc)?;
        }
        esp! { unsafe { esp_idf_sys::esp_task_wdt_add(core::ptr::null_mut()) } }?;
        info!("Task watchdog armed, timeout {timeout:?}");
        Ok(TaskWatchdog)
    }
}

impl Watchdog for TaskWatchdog {
    fn feed(&mut self) -> anyhow::Result<()> {
        esp! { unsafe { esp_idf_sys::esp_task_wdt_reset() } }?;
        Ok(())
    }
}

pub fn run() -> anyhow::Result<()> {
    esp_idf_sys::link_patches();
    esp_idf_svc::log::EspLogger::initialize_default();

    // eventfd is needed by our mio poll implementation.  Note you should set max_fds
    // higher if you have other code that may need eventfd.
    #[allow(clippy::needless_update)]
    let config = esp_idf_sys::esp_vfs_eventfd_config_t {
        max_fds: 1,
        ..Default::default()
    };
    esp! { unsafe { esp_idf_sys::esp_vfs_eventfd_register(&config) } }?;

    info!("esp32relay v{FW_VERSION} starting up.");

    let sysloop = EspSystemEventLoop::take()?;
    let timer = EspTaskTimerService::new()?;
    let nvs_default_partition = nvs::EspDefaultNvsPartition::take()?;

    let ns = env!("CARGO_BIN_NAME");
    let nvs = nvs::EspNvs::new(nvs_default_partition.clone(), ns, true)
        .map_err(|e| anyhow!("Could not get namespace {ns}: {e:?}"))?;
    let mut store = ConfigStore::new(nvs);

    let config = if cfg!(feature = "reset_settings") {
        warn!("reset_settings: storing default config");
        store.reset()?
    } else {
        store.load_or_init()?
    };
    info!("My config:\n{config:#?}");

    if let Err(e) = mount_spiffs() {
        error!("SPIFFS mount failed: {e:#}");
    }

    let peripherals = Peripherals::take()?;
    let pins = peripherals.pins;

    #[cfg(feature = "esp32c3")]
    let (button_pin, relay_pin, onewire_pin) = (
        pins.gpio9.downgrade_input(),
        pins.gpio2.downgrade_output(),
        pins.gpio0.downgrade(),
    );
    #[cfg(feature = "esp32s")]
    let (button_pin, relay_pin, onewire_pin) = (
        pins.gpio0.downgrade_input(),
        pins.gpio2.downgrade_output(),
        pins.gpio4.downgrade(),
    );

    let button = PinDriver::input(button_pin)?;
    let relay = Relay::new(Box::new(PinOutput::new(PinDriver::output(relay_pin)?)));
    let thermometer = probe_sensor(onewire_pin)?;
    let (sensor, acquisition) = sensor_channel(thermometer);

    let wifidriver = WifiDriver::new(peripherals.modem, sysloop.clone(), Some(nvs_default_partition))?;

    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?
        .block_on(Box::pin(async move {
            let schedule = ScheduleTable::load(Path::new(&config.schedule_path), SCHEDULE_FALLBACK_DELAY).await;
            let files = KnownFileSet::scan(&config.html_dir);

            let state = Box::pin(MyState::new(config, schedule, files, relay, sensor));
            let shared_state = Arc::new(state);

            let wifi = WifiLink::new(shared_state.clone());
            let wdt = match TaskWatchdog::subscribe(WATCHDOG_TIMEOUT) {
                Ok(wdt) => wdt,
                Err(e) => {
                    error!("Watchdog setup failed: {e:#}");
                    return;
                }
            };

            info!("Entering main loop...");
            tokio::select! {
                _ = Box::pin(poll_reset(shared_state.clone())) => { error!("poll_reset() ended."); }
                _ = Box::pin(reset_button(button, store)) => { error!("reset_button() ended."); }
                _ = Box::pin(acquisition.run()) => { error!("acquisition.run() ended."); }
                _ = Box::pin(safety_monitor(shared_state.clone())) => { error!("safety_monitor() ended."); }
                _ = Box::pin(automation(shared_state.clone())) => { error!("automation() ended."); }
                _ = Box::pin(clock_sync(shared_state.clone())) => { error!("clock_sync() ended."); }
                _ = Box::pin(heartbeat(wdt)) => { error!("heartbeat() ended."); }
                _ = Box::pin(run_api_server(shared_state.clone(), std::future::pending())) => { error!("run_api_server() ended."); }
                _ = Box::pin(wifi.run(wifidriver, sysloop, timer)) => { error!("wifi.run() ended."); }
            };
        }));

    // not actually returning from main() but we reboot instead
    info!("main() finished, reboot.");
    FreeRtos::delay_ms(3000);
    restart();
}

fn mount_spiffs() -> anyhow::Result<()> {
    let base_path = CString::new(SPIFFS_BASE)?;
    let conf = esp_idf_sys::esp_vfs_spiffs_conf_t {
        base_path: base_path.as_ptr(),
        partition_label: core::ptr::null(),
        max_files: SPIFFS_MAX_FILES,
        format_if_mount_failed: false,
    };
    esp! { unsafe { esp_idf_sys::esp_vfs_spiffs_register(&conf) } }?;
    info!("SPIFFS mounted at {SPIFFS_BASE}");
    Ok(())
}

fn probe_sensor(pin: AnyIOPin) -> anyhow::Result<Option<Ds18b20Sensor>> {
    let mut pin_drv = PinDriver::input_output_od(pin)?;
    pin_drv.set_pull(Pull::Up)?;
    let bus = OneWire::new(pin_drv).map_err(|e| anyhow!("1-wire bus init failed: {e:?}"))?;
    Ok(Ds18b20Sensor::probe(bus))
}

async fn reset_button(
    button: PinDriver<'static, AnyInputPin, Input>,
    mut store: ConfigStore,
) -> anyhow::Result<()> {
    loop {
        sleep(Duration::from_secs(2)).await;

        let mut reset_cnt = CONFIG_RESET_COUNT;
        while button.is_low() {
            // button is pressed and kept down, countdown and factory reset if reach zero
            error!("Reset? {reset_cnt}");

            if reset_cnt == 0 {
                error!("Factory resetting...");
                store.reset()?;
                sleep(Duration::from_millis(2000)).await;
                restart();
            }

            reset_cnt -= 1;
            sleep(Duration::from_millis(500)).await;
        }
    }
}

// EOF
