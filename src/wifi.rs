// wifi.rs

use anyhow::anyhow;
use embedded_svc::wifi::{ClientConfiguration, Configuration};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    ipv4::{self, Mask, Subnet},
    netif::{EspNetif, NetifConfiguration, NetifStack},
    timer::EspTaskTimerService,
    wifi::{AsyncWifi, EspWifi, WifiDriver},
};

use crate::*;

/// How long one association attempt may take at boot.
const ASSOCIATE_TIMEOUT: Duration = Duration::from_secs(30);
const RETRY_PAUSE: Duration = Duration::from_secs(1);
const GIVE_UP_PAUSE: Duration = Duration::from_secs(5);

/// Station-mode link. Publishes `wifi_up`, `ip_addr` and `myid` in the shared
/// state; the API server and clock sync wait for `wifi_up`.
pub struct WifiLink {
    state: Arc<Pin<Box<MyState>>>,
}

fn station_netif(config: &MyConfig) -> anyhow::Result<EspNetif> {
    let client = if config.v4dhcp {
        ipv4::ClientConfiguration::DHCP(Default::default())
    } else {
        info!("Static IPv4 {}/{} gw {}", config.v4addr, config.v4mask, config.v4gw);
        ipv4::ClientConfiguration::Fixed(ipv4::ClientSettings {
            ip: config.v4addr,
            subnet: Subnet {
                gateway: config.v4gw,
                mask: Mask(config.v4mask),
            },
            dns: None,
            secondary_dns: None,
        })
    };

    Ok(EspNetif::new_with_conf(&NetifConfiguration {
        ip_configuration: Some(ipv4::Configuration::Client(client)),
        ..NetifConfiguration::wifi_default_client()
    })?)
}

fn client_config(config: &MyConfig) -> anyhow::Result<Configuration> {
    Ok(Configuration::Client(ClientConfiguration {
        ssid: config
            .wifi_ssid
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("SSID {:?} too long", config.wifi_ssid))?,
        password: config
            .wifi_pass
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("WiFi password too long"))?,
        ..Default::default()
    }))
}

impl WifiLink {
    pub fn new(state: Arc<Pin<Box<MyState>>>) -> Self {
        Self { state }
    }

    /// Bring the link up and keep it up. Restarts the device when the first
    /// association fails `wifi_retries` times in a row.
    pub async fn run(
        self,
        driver: WifiDriver<'static>,
        sysloop: EspSystemEventLoop,
        timer: EspTaskTimerService,
    ) -> anyhow::Result<()> {
        let netif = station_netif(&self.state.config)?;
        let mac = netif.get_mac()?;
        let id = format!(
            "esp32relay-{}",
            mac.iter().map(|b| format!("{b:02x}")).collect::<String>()
        );
        info!("Station id {id}");
        *self.state.myid.write().await = id;

        let wifi = EspWifi::wrap_all(driver, netif, EspNetif::new(NetifStack::Ap)?)?;
        let mut wifi = AsyncWifi::wrap(wifi, sysloop, timer)?;
        wifi.set_configuration(&client_config(&self.state.config)?)?;
        Box::pin(wifi.start()).await?;
        info!("WiFi started, associating with {:?}", self.state.config.wifi_ssid);

        if let Err(e) = Box::pin(self.associate(&mut wifi)).await {
            error!("{e:#}, restarting.");
            sleep(GIVE_UP_PAUSE).await;
            restart();
        }
        self.link_up(&wifi).await?;

        Box::pin(self.supervise(wifi)).await
    }

    async fn associate(&self, wifi: &mut AsyncWifi<EspWifi<'static>>) -> anyhow::Result<()> {
        let tries = self.state.config.wifi_retries.max(1);
        for n in 1..=tries {
            match connect(wifi, Some(ASSOCIATE_TIMEOUT)).await {
                Ok(()) => return Ok(()),
                Err(e) => warn!("WiFi association {n}/{tries} failed: {e:?}"),
            }
            sleep(RETRY_PAUSE).await;
        }
        bail!("no WiFi association after {tries} tries");
    }

    /// Reconnect forever after every drop.
    async fn supervise(self, mut wifi: AsyncWifi<EspWifi<'static>>) -> anyhow::Result<()> {
        loop {
            Box::pin(wifi.wifi_wait(|w| w.is_up(), None)).await.ok();
            warn!("WiFi link lost.");
            *self.state.wifi_up.write().await = false;

            match connect(&mut wifi, None).await {
                Ok(()) => self.link_up(&wifi).await?,
                Err(e) => {
                    error!("WiFi reconnect failed: {e:?}");
                    sleep(RETRY_PAUSE).await;
                }
            }
        }
    }

    async fn link_up(&self, wifi: &AsyncWifi<EspWifi<'static>>) -> anyhow::Result<()> {
        let ip_info = wifi.wifi().sta_netif().get_ip_info()?;
        info!("WiFi up: {ip_info:?}");
        *self.state.ip_addr.write().await = ip_info.ip;
        *self.state.wifi_up.write().await = true;
        Ok(())
    }
}

async fn connect(wifi: &mut AsyncWifi<EspWifi<'static>>, timeout: Option<Duration>) -> anyhow::Result<()> {
    // an error here still leaves the driver trying, the netif wait decides
    if let Err(e) = Box::pin(wifi.connect()).await {
        debug!("WiFi connect: {e:?}");
    }
    Box::pin(wifi.ip_wait_while(|w| w.is_up().map(|up| !up), timeout)).await?;
    Ok(())
}

// EOF
