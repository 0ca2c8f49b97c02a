// control.rs

use crate::*;

pub const SAFETY_INTERVAL: Duration = Duration::from_secs(5);
pub const AUTOMATION_INTERVAL: Duration = Duration::from_secs(5);

/// Over-temperature cutoff for a forced-on relay. Returns true when it tripped.
///
/// Automatic mode is left alone: [`apply_schedule`] already keeps the relay
/// off while too hot.
pub fn enforce_cutoff(relay: &mut Relay, reading: SensorReading, max_temperature: f32) -> bool {
    let s = relay.state();
    if s.forced && s.relay_on && reading.at_or_above(max_temperature) {
        relay.trip();
        return true;
    }
    false
}

/// One automation step at minute `key`. Returns the decision, or None when
/// the relay is forced.
pub fn apply_schedule(
    relay: &mut Relay,
    key: u16,
    reading: SensorReading,
    schedule: &ScheduleTable,
) -> Option<bool> {
    let on = schedule.is_on_at(key) && reading.below(schedule.max_temperature);
    relay.schedule(on).then_some(on)
}

pub async fn safety_monitor(state: Arc<Pin<Box<MyState>>>) -> anyhow::Result<()> {
    let max = state.schedule.max_temperature;
    loop {
        sleep(SAFETY_INTERVAL).await;

        let reading = state.sensor.read();
        // no await between reading and writing the relay state
        let mut relay = state.relay.write().await;
        if enforce_cutoff(&mut relay, reading, max) {
            warn!(
                "Temperature {:.1}°C over {max:.1}°C, forced mode cancelled, relay off.",
                reading.temperature
            );
        }
    }
}

/// Schedule loop. Until the wall clock has been synchronized the time of day
/// is meaningless, so automatic mode keeps the relay off.
pub async fn automation(state: Arc<Pin<Box<MyState>>>) -> anyhow::Result<()> {
    loop {
        sleep(AUTOMATION_INTERVAL).await;

        let now = state.clock.synced_now().await;
        let reading = state.sensor.read();
        let mut relay = state.relay.write().await;
        let before = relay.state();
        let Some(now) = now else {
            if relay.schedule(false) && before.relay_on {
                warn!("Clock not set, relay off.");
            }
            continue;
        };

        let key = minute_key(&now);
        if let Some(on) = apply_schedule(&mut relay, key, reading, &state.schedule) {
            if before.relay_on != relay.state().relay_on {
                info!("Schedule at {key:04}: relay {}", if on { "on" } else { "off" });
            }
        }
    }
}


// EOF
