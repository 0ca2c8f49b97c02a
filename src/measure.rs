// measure.rs

use log::*;
use serde::Serialize;
use tokio::{
    sync::watch,
    time::{sleep, Duration},
};

/// DS18B20 conversion time at 12-bit resolution.
pub const CONVERSION_TIME: Duration = Duration::from_millis(750);
/// Pause after a conversion before the next one may start.
pub const SETTLE_TIME: Duration = Duration::from_secs(10);

/// Last completed temperature conversion.
///
/// `valid` stays false until the first conversion succeeds, and forever if no
/// sensor was found at boot. An invalid reading is "unknown": it never trips
/// the safety cutoff and never confirms that switching on is safe.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct SensorReading {
    pub temperature: f32,
    pub valid: bool,
}

impl SensorReading {
    pub fn new(temperature: f32) -> Self {
        Self {
            temperature,
            valid: true,
        }
    }

    pub fn celsius(&self) -> Option<f32> {
        self.valid.then_some(self.temperature)
    }

    /// True only for a known temperature at or above `limit`.
    pub fn at_or_above(&self, limit: f32) -> bool {
        matches!(self.celsius(), Some(t) if t >= limit)
    }

    /// True only for a known temperature below `limit`.
    pub fn below(&self, limit: f32) -> bool {
        matches!(self.celsius(), Some(t) if t < limit)
    }
}

pub trait Thermometer {
    fn start_conversion(&mut self) -> anyhow::Result<()>;
    fn read_temperature(&mut self) -> anyhow::Result<f32>;
}

/// Read side of the sensor. Cheap to clone, never blocks.
#[derive(Clone, Debug)]
pub struct SensorChannel {
    rx: watch::Receiver<SensorReading>,
}

impl SensorChannel {
    pub fn read(&self) -> SensorReading {
        *self.rx.borrow()
    }

    #[cfg(test)]
    pub(crate) fn fixed(reading: SensorReading) -> Self {
        let (_tx, rx) = watch::channel(reading);
        Self { rx }
    }
}

/// Write side of the sensor. Owns the thermometer, so only one conversion can
/// ever be in flight.
pub struct Acquisition<T> {
    sensor: Option<T>,
    tx: watch::Sender<SensorReading>,
}

pub fn sensor_channel<T: Thermometer>(sensor: Option<T>) -> (SensorChannel, Acquisition<T>) {
    let (tx, rx) = watch::channel(SensorReading::default());
    (SensorChannel { rx }, Acquisition { sensor, tx })
}

impl<T: Thermometer> Acquisition<T> {
    #[allow(unreachable_code)]
    pub async fn run(mut self) -> anyhow::Result<()> {
        let Some(mut sensor) = self.sensor.take() else {
            warn!("No temperature sensor, readings stay unknown.");
            // we cannot return, otherwise tokio::select in main() will exit
            loop {
                sleep(Duration::from_secs(3600)).await;
            }
        };

        loop {
            self.convert(&mut sensor).await;
            sleep(SETTLE_TIME).await;
        }
        Ok(())
    }

    async fn convert(&self, sensor: &mut T) {
        if let Err(e) = sensor.start_conversion() {
            error!("Temperature conversion start failed: {e:#}");
            return;
        }
        sleep(CONVERSION_TIME).await;

        match sensor.read_temperature() {
            Ok(t) => {
                debug!("Temperature {t:.1}°C");
                self.store(SensorReading::new(t));
            }
            // keep serving the previous reading
            Err(e) => error!("Temperature read failed: {e:#}"),
        }
    }

    pub(crate) fn store(&self, reading: SensorReading) {
        self.tx.send_replace(reading);
    }
}

#[cfg(target_os = "espidf")]
pub use ds::Ds18b20Sensor;

#[cfg(target_os = "espidf")]
mod ds {
    use anyhow::anyhow;
    use esp_idf_hal::{
        delay::Ets,
        gpio::{AnyIOPin, InputOutput, PinDriver},
    };
    use log::*;
    use one_wire_bus::OneWire;

    use super::Thermometer;

    type Bus = OneWire<PinDriver<'static, AnyIOPin, InputOutput>>;

    pub struct Ds18b20Sensor {
        bus: Bus,
        sensor: ds18b20::Ds18b20,
    }

    impl Ds18b20Sensor {
        /// Scan the bus and use the first DS18B20 found on it.
        pub fn probe(mut bus: Bus) -> Option<Self> {
            let mut found = None;
            for dev in bus.devices(false, &mut Ets) {
                match dev {
                    Ok(address) if address.family_code() == ds18b20::FAMILY_CODE => {
                        found = Some(address);
                        break;
                    }
                    Ok(address) => info!("Skipping 1-wire device {address:?}"),
                    Err(e) => {
                        error!("1-wire scan failed: {e:?}");
                        break;
                    }
                }
            }

            let Some(address) = found else {
                error!("DS sensor not found");
                return None;
            };
            info!("Found DS device: {address:?}");

            match ds18b20::Ds18b20::new::<core::convert::Infallible>(address) {
                Ok(sensor) => Some(Self { bus, sensor }),
                Err(e) => {
                    error!("Invalid DS18B20 address {address:?}: {e:?}");
                    None
                }
            }
        }
    }

    impl Thermometer for Ds18b20Sensor {
        fn start_conversion(&mut self) -> anyhow::Result<()> {
            ds18b20::start_simultaneous_temp_measurement(&mut self.bus, &mut Ets)
                .map_err(|e| anyhow!("{e:?}"))
        }

        fn read_temperature(&mut self) -> anyhow::Result<f32> {
            let data = self
                .sensor
                .read_data(&mut self.bus, &mut Ets)
                .map_err(|e| anyhow!("{e:?}"))?;
            Ok(data.temperature)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{cell::RefCell, collections::VecDeque, rc::Rc};

    #[derive(Default)]
    struct Script {
        values: VecDeque<anyhow::Result<f32>>,
        started: u32,
        pending: bool,
        overlapped: bool,
    }

    #[derive(Clone, Default)]
    struct FakeSensor(Rc<RefCell<Script>>);

    impl FakeSensor {
        fn with(values: Vec<anyhow::Result<f32>>) -> Self {
            let s = Self::default();
            s.0.borrow_mut().values = values.into();
            s
        }
    }

    impl Thermometer for FakeSensor {
        fn start_conversion(&mut self) -> anyhow::Result<()> {
            let mut s = self.0.borrow_mut();
            if s.pending {
                s.overlapped = true;
            }
            s.pending = true;
            s.started += 1;
            Ok(())
        }

        fn read_temperature(&mut self) -> anyhow::Result<f32> {
            let mut s = self.0.borrow_mut();
            s.pending = false;
            s.values.pop_front().unwrap_or(Ok(0.0))
        }
    }

    #[test]
    fn unknown_reading_is_neither_hot_nor_safe() {
        let r = SensorReading::default();
        assert!(!r.valid);
        assert!(!r.at_or_above(47.0));
        assert!(!r.below(47.0));
        assert_eq!(r.celsius(), None);
    }

    #[test]
    fn limit_edges() {
        let r = SensorReading::new(35.0);
        assert!(r.at_or_above(35.0));
        assert!(!r.below(35.0));
        assert!(r.below(35.5));
    }

    #[tokio::test(start_paused = true)]
    async fn read_returns_last_conversion_until_next_one() {
        let sensor = FakeSensor::with(vec![Ok(21.5), Ok(22.0)]);
        let (channel, acq) = sensor_channel(Some(sensor.clone()));
        let local = tokio::task::LocalSet::new();
        local.spawn_local(acq.run());

        local
            .run_until(async {
                assert!(!channel.read().valid);

                sleep(CONVERSION_TIME + Duration::from_millis(10)).await;
                let first = channel.read();
                assert_eq!(first, SensorReading::new(21.5));
                // nothing new until the settle delay has passed
                sleep(SETTLE_TIME / 2).await;
                assert_eq!(channel.read(), first);
                assert_eq!(channel.read(), first);

                sleep(SETTLE_TIME).await;
                assert_eq!(channel.read(), SensorReading::new(22.0));
            })
            .await;

        let s = sensor.0.borrow();
        assert_eq!(s.started, 2);
        assert!(!s.overlapped);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_read_keeps_previous_value() {
        let sensor = FakeSensor::with(vec![Ok(30.0), Err(anyhow::anyhow!("crc mismatch"))]);
        let (channel, acq) = sensor_channel(Some(sensor));
        let local = tokio::task::LocalSet::new();
        local.spawn_local(acq.run());

        local
            .run_until(async {
                sleep(CONVERSION_TIME + SETTLE_TIME + CONVERSION_TIME + Duration::from_secs(1))
                    .await;
                assert_eq!(channel.read(), SensorReading::new(30.0));
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn absent_sensor_stays_unknown() {
        let (channel, acq) = sensor_channel::<FakeSensor>(None);
        let local = tokio::task::LocalSet::new();
        let handle = local.spawn_local(acq.run());

        local
            .run_until(async {
                sleep(Duration::from_secs(60)).await;
                assert!(!channel.read().valid);
            })
            .await;
        assert!(!handle.is_finished());
    }
}

// EOF
