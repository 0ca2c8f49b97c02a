// clock.rs

use crate::*;

use anyhow::anyhow;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, TimeDelta};
use tokio::{
    net::UdpSocket,
    sync::RwLock,
    time::{timeout, Instant},
};

const NTP_PORT: u16 = 123;
/// Seconds from 1900-01-01 (NTP era 0) to 1970-01-01.
const NTP_DELTA: i64 = 2_208_988_800;
const NTP_PACKET_LEN: usize = 48;
const NTP_RECV_TIMEOUT: Duration = Duration::from_secs(4);
const NTP_RETRY_WINDOW: Duration = Duration::from_secs(5);
const NTP_RETRY_BACKOFF: Duration = Duration::from_millis(500);

pub const CLOCK_SYNC_INTERVAL: Duration = Duration::from_secs(1800);

/// Local wall clock. Keeps the last synchronized local time together with the
/// monotonic instant it was taken at. Until the first sync it counts from
/// 2000-01-01 00:00, like an unset RTC, and reports itself as unsynchronized.
#[derive(Debug)]
pub struct WallClock {
    anchor: RwLock<Anchor>,
}

#[derive(Clone, Copy, Debug)]
struct Anchor {
    at: Instant,
    local: NaiveDateTime,
    synced: bool,
}

impl WallClock {
    pub fn new() -> Self {
        let unset = NaiveDate::from_ymd_opt(2000, 1, 1)
            .unwrap_or_default()
            .and_time(NaiveTime::MIN);
        Self {
            anchor: RwLock::new(Anchor {
                at: Instant::now(),
                local: unset,
                synced: false,
            }),
        }
    }

    pub async fn set(&self, local: NaiveDateTime) {
        *self.anchor.write().await = Anchor {
            at: Instant::now(),
            local,
            synced: true,
        };
    }

    /// Current local time, synchronized or not.
    pub async fn now(&self) -> NaiveDateTime {
        let anchor = *self.anchor.read().await;
        anchor.local + elapsed_since(anchor.at)
    }

    /// Current local time, or None before the first successful sync.
    pub async fn synced_now(&self) -> Option<NaiveDateTime> {
        let anchor = *self.anchor.read().await;
        anchor
            .synced
            .then(|| anchor.local + elapsed_since(anchor.at))
    }
}

fn elapsed_since(at: Instant) -> TimeDelta {
    TimeDelta::from_std(at.elapsed()).unwrap_or_else(|_| TimeDelta::zero())
}

impl Default for WallClock {
    fn default() -> Self {
        Self::new()
    }
}

/// One SNTP request. Returns Unix seconds.
pub async fn get_ntp_time(host: &str, port: u16) -> anyhow::Result<i64> {
    let sock = UdpSocket::bind("0.0.0.0:0").await?;
    sock.connect((host, port)).await?;

    let mut query = [0u8; NTP_PACKET_LEN];
    // LI=0, VN=3, Mode=3 (client)
    query[0] = 0x1b;
    sock.send(&query).await?;

    let mut msg = [0u8; NTP_PACKET_LEN];
    let n = timeout(NTP_RECV_TIMEOUT, sock.recv(&mut msg))
        .await
        .map_err(|_| anyhow!("no reply from {host}"))??;
    if n < NTP_PACKET_LEN {
        bail!("short NTP reply ({n} bytes)");
    }

    let mut ts = [0u8; 4];
    ts.copy_from_slice(&msg[40..44]);
    Ok(u32::from_be_bytes(ts) as i64 - NTP_DELTA)
}

/// Fetch network time, retrying for a few seconds, and set the wall clock to
/// local time at `utc_offset_hours`.
pub async fn settime(
    clock: &WallClock,
    host: &str,
    port: u16,
    utc_offset_hours: i32,
) -> anyhow::Result<NaiveDateTime> {
    let start = Instant::now();
    let unix = loop {
        match get_ntp_time(host, port).await {
            Ok(t) => break t,
            Err(e) => {
                if start.elapsed() > NTP_RETRY_WINDOW {
                    bail!("Timeout, ntp server not responding: {e:#}");
                }
                debug!("NTP attempt failed: {e:#}");
                sleep(NTP_RETRY_BACKOFF).await;
            }
        }
    };

    let utc = DateTime::from_timestamp(unix, 0).ok_or_else(|| anyhow!("bad NTP time {unix}"))?;
    let local = utc.naive_utc() + TimeDelta::hours(utc_offset_hours as i64);
    clock.set(local).await;
    Ok(local)
}

/// Resynchronize the clock at boot and then every [`CLOCK_SYNC_INTERVAL`].
/// A failed sync keeps the current time and waits for the next cycle.
pub async fn clock_sync(state: Arc<Pin<Box<MyState>>>) -> anyhow::Result<()> {
    state.wait_for_wifi().await;

    let tz = state.schedule.timezone_offset_hours;
    loop {
        match settime(&state.clock, &state.config.ntp_server, NTP_PORT, tz).await {
            Ok(local) => info!("Clock set to {local} (UTC{tz:+})"),
            Err(e) => error!("Clock sync failed: {e:#}"),
        }
        sleep(CLOCK_SYNC_INTERVAL).await;
    }
}


// EOF
