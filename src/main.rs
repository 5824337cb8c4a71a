use std::time::Duration;

use tegschtuhr::captive_portal::{CaptivePortal, Connected, PortalConfig};
use tegschtuhr::network::Radio;

/// 连上后继续提供设置页面
fn serve_forever<R: Radio>(
    portal: &mut CaptivePortal<R>,
    connected: &Connected,
) -> anyhow::Result<()> {
    log::info!(
        "Connected to {} with IP {} (portal: {})",
        connected.ssid,
        connected.address,
        connected.via_portal
    );
    loop {
        portal.serve(Duration::from_millis(100))?;
    }
}

#[cfg(target_os = "espidf")]
fn main() -> anyhow::Result<()> {
    use esp_idf_svc::eventloop::EspSystemEventLoop;
    use tegschtuhr::esp::{EspRadio, NvsStorage};
    use tegschtuhr::setting::SettingStore;

    esp_idf_svc::sys::link_patches();
    esp_idf_svc::log::EspLogger::initialize_default();

    let peripherals = esp_idf_svc::hal::prelude::Peripherals::take()?;
    let sysloop = EspSystemEventLoop::take()?;
    let partition = esp_idf_svc::nvs::EspDefaultNvsPartition::take()?;

    let settings = SettingStore::load(Box::new(NvsStorage::new(partition.clone(), "setting")?));
    let radio = EspRadio::new(peripherals.modem, sysloop, Some(partition))?;

    let mut portal = CaptivePortal::new(PortalConfig::default(), radio, settings);
    match portal.start() {
        Ok(connected) => serve_forever(&mut portal, &connected),
        Err(e) => {
            log::error!("Captive portal failed: {}", e);
            drop(portal);
            unsafe { esp_idf_svc::sys::esp_restart() }
        }
    }
}

#[cfg(not(target_os = "espidf"))]
fn main() -> anyhow::Result<()> {
    use anyhow::Context;
    use tegschtuhr::setting::{FileStorage, SettingStore};

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let state_dir = std::env::var("TEGSCHTUHR_STATE_DIR").unwrap_or_else(|_| "state".to_string());
    let storage = FileStorage::open(&state_dir)
        .with_context(|| format!("failed to open state directory {}", state_dir))?;
    let settings = SettingStore::load(Box::new(storage));

    let config = host_config()?;
    log::info!(
        "Portal address {}, HTTP port {}, DNS port {}",
        config.address,
        config.http_port,
        config.dns_port
    );

    let networks = std::env::var("TEGSCHTUHR_SIM_NETWORKS").unwrap_or_default();
    let radio = sim_radio(&networks).context("invalid TEGSCHTUHR_SIM_NETWORKS")?;

    let mut portal = CaptivePortal::new(config, radio, settings);
    let connected = portal.start().context("captive portal failed")?;
    serve_forever(&mut portal, &connected)
}

/// 主机上用非特权端口，地址和超时可以用环境变量覆盖
#[cfg(not(target_os = "espidf"))]
fn host_config() -> anyhow::Result<PortalConfig> {
    use anyhow::Context;

    let mut config = PortalConfig {
        http_port: 8080,
        dns_port: 5353,
        ..Default::default()
    };

    if let Ok(address) = std::env::var("TEGSCHTUHR_PORTAL_ADDRESS") {
        config.address = address
            .parse()
            .context("invalid TEGSCHTUHR_PORTAL_ADDRESS")?;
    }
    if let Ok(port) = std::env::var("TEGSCHTUHR_HTTP_PORT") {
        config.http_port = port.parse().context("invalid TEGSCHTUHR_HTTP_PORT")?;
    }
    if let Ok(port) = std::env::var("TEGSCHTUHR_DNS_PORT") {
        config.dns_port = port.parse().context("invalid TEGSCHTUHR_DNS_PORT")?;
    }
    if let Ok(secs) = std::env::var("TEGSCHTUHR_TIMEOUT") {
        let secs: u64 = secs.parse().context("invalid TEGSCHTUHR_TIMEOUT")?;
        config.inactivity_timeout = Some(Duration::from_secs(secs));
    }
    Ok(config)
}

/// `ssid:password,ssid:password`
#[cfg(not(target_os = "espidf"))]
fn sim_radio(networks: &str) -> anyhow::Result<tegschtuhr::sim::SimRadio> {
    let mut radio = tegschtuhr::sim::SimRadio::new();
    for (i, entry) in networks.split(',').filter(|e| !e.is_empty()).enumerate() {
        let (ssid, password) = entry
            .split_once(':')
            .ok_or_else(|| anyhow::anyhow!("expected ssid:password, got {:?}", entry))?;
        let rssi = (-40i8).saturating_sub(i.min(8) as i8 * 10);
        radio = radio.with_network(ssid, password, rssi);
    }
    Ok(radio)
}
