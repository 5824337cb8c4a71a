//! ESP32 上的射频和 NVS 实现

use std::net::Ipv4Addr;

use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::modem::Modem,
    ipv4::{self, Mask, Subnet},
    netif::{EspNetif, NetifConfiguration},
    nvs::{EspDefaultNvs, EspDefaultNvsPartition},
    sys::EspError,
    wifi::{
        AccessPointConfiguration, AuthMethod, BlockingWifi, ClientConfiguration, Configuration,
        EspWifi,
    },
};

use crate::network::{AccessPointSettings, LinkStatus, NetworkInfo, Radio, RadioError};
use crate::setting::{Credentials, StoreError, Storage};

fn driver(e: EspError) -> RadioError {
    RadioError::Driver(e.to_string())
}

/// AP + STA 混合模式的 WiFi
pub struct EspRadio {
    wifi: BlockingWifi<EspWifi<'static>>,
    mac: [u8; 6],
    client: ClientConfiguration,
    ap: Option<AccessPointConfiguration>,
    ap_address: Option<Ipv4Addr>,
}

impl EspRadio {
    pub fn new(
        modem: Modem,
        sysloop: EspSystemEventLoop,
        nvs: Option<EspDefaultNvsPartition>,
    ) -> Result<Self, RadioError> {
        let wifi = EspWifi::new(modem, sysloop.clone(), nvs).map_err(driver)?;
        let wifi = BlockingWifi::wrap(wifi, sysloop).map_err(driver)?;
        let mac = wifi.wifi().sta_netif().get_mac().map_err(driver)?;

        Ok(Self {
            wifi,
            mac,
            client: ClientConfiguration::default(),
            ap: None,
            ap_address: None,
        })
    }

    fn apply(&mut self) -> Result<(), RadioError> {
        let conf = match &self.ap {
            Some(ap) => Configuration::Mixed(self.client.clone(), ap.clone()),
            None => Configuration::Client(self.client.clone()),
        };
        self.wifi.set_configuration(&conf).map_err(driver)?;
        if !self.wifi.is_started().map_err(driver)? {
            self.wifi.start().map_err(driver)?;
        }
        Ok(())
    }

    /// AP 网口使用固定地址，同时作为网关和 DNS
    fn set_ap_address(&mut self, address: Ipv4Addr, netmask: Ipv4Addr) -> Result<(), RadioError> {
        if self.ap_address == Some(address) {
            return Ok(());
        }

        let conf = NetifConfiguration {
            ip_configuration: Some(ipv4::Configuration::Router(ipv4::RouterConfiguration {
                subnet: Subnet {
                    gateway: address,
                    mask: Mask(u32::from(netmask).count_ones() as u8),
                },
                dhcp_enabled: true,
                dns: Some(address),
                secondary_dns: None,
            })),
            ..NetifConfiguration::wifi_default_router()
        };
        let netif = EspNetif::new_with_conf(&conf).map_err(driver)?;

        if self.wifi.is_started().map_err(driver)? {
            self.wifi.stop().map_err(driver)?;
        }
        self.wifi.wifi_mut().swap_netif_ap(netif).map_err(driver)?;
        self.ap_address = Some(address);
        Ok(())
    }
}

impl Radio for EspRadio {
    fn mac_address(&self) -> [u8; 6] {
        self.mac
    }

    fn start_access_point(&mut self, ap: &AccessPointSettings) -> Result<(), RadioError> {
        self.set_ap_address(ap.address, ap.netmask)?;
        self.ap = Some(AccessPointConfiguration {
            ssid: ap
                .ssid
                .as_str()
                .try_into()
                .map_err(|_| RadioError::InvalidConfig(format!("ssid {:?}", ap.ssid)))?,
            ssid_hidden: false,
            channel: ap.channel,
            auth_method: AuthMethod::None,
            max_connections: ap.max_connections,
            ..Default::default()
        });
        self.apply()
    }

    fn stop_access_point(&mut self) -> Result<(), RadioError> {
        if self.ap.take().is_some() && self.wifi.is_started().map_err(driver)? {
            self.apply()?;
        }
        Ok(())
    }

    fn access_point_active(&self) -> bool {
        self.ap.is_some()
    }

    fn connect(&mut self, credentials: &Credentials) -> Result<(), RadioError> {
        self.client = ClientConfiguration {
            ssid: credentials
                .ssid
                .as_str()
                .try_into()
                .map_err(|_| RadioError::InvalidConfig("ssid too long".to_string()))?,
            password: credentials
                .password
                .as_str()
                .try_into()
                .map_err(|_| RadioError::InvalidConfig("password too long".to_string()))?,
            auth_method: if credentials.password.is_empty() {
                AuthMethod::None
            } else {
                AuthMethod::WPA2Personal
            },
            ..Default::default()
        };
        self.apply()?;
        // 不等待连接结果，由调用方轮询 status
        self.wifi.wifi_mut().connect().map_err(driver)
    }

    fn status(&self) -> LinkStatus {
        if self.client.ssid.is_empty() {
            return LinkStatus::Idle;
        }
        match self.wifi.is_up() {
            Ok(true) => LinkStatus::Connected,
            Ok(false) => LinkStatus::Connecting,
            Err(e) => {
                log::warn!("Failed to get WiFi status: {:?}", e);
                LinkStatus::Failed
            }
        }
    }

    fn station_address(&self) -> Option<Ipv4Addr> {
        if !self.wifi.is_up().unwrap_or(false) {
            return None;
        }
        self.wifi
            .wifi()
            .sta_netif()
            .get_ip_info()
            .map_err(|e| log::error!("Failed to get IP info: {:?}", e))
            .ok()
            .map(|info| Ipv4Addr::from(info.ip.octets()))
            .filter(|ip| !ip.is_unspecified())
    }

    fn disconnect(&mut self) -> Result<(), RadioError> {
        let connected = self.wifi.is_started().map_err(driver)?
            && self.wifi.is_connected().map_err(driver)?;
        self.client = ClientConfiguration::default();
        if connected {
            self.wifi.disconnect().map_err(driver)?;
        }
        Ok(())
    }

    fn scan(&mut self) -> Result<Vec<NetworkInfo>, RadioError> {
        if !self.wifi.is_started().map_err(driver)? {
            self.apply()?;
        }
        let found = self.wifi.scan().map_err(driver)?;
        log::debug!("Scan found {} networks", found.len());

        Ok(found
            .into_iter()
            .map(|ap| NetworkInfo {
                ssid: ap.ssid.to_string(),
                rssi: ap.signal_strength,
                channel: ap.channel,
                secured: ap.auth_method.is_some_and(|m| m != AuthMethod::None),
            })
            .collect())
    }
}

/// 每个键存成一个 NVS blob
pub struct NvsStorage {
    nvs: EspDefaultNvs,
}

impl NvsStorage {
    pub fn new(partition: EspDefaultNvsPartition, namespace: &str) -> Result<Self, StoreError> {
        let nvs = EspDefaultNvs::new(partition, namespace, true).map_err(backend)?;
        Ok(Self { nvs })
    }
}

fn backend(e: EspError) -> StoreError {
    StoreError::Backend(e.to_string())
}

impl Storage for NvsStorage {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let Some(len) = self.nvs.blob_len(key).map_err(backend)? else {
            return Ok(None);
        };
        let mut buf = vec![0u8; len];
        Ok(self
            .nvs
            .get_blob(key, &mut buf)
            .map_err(backend)?
            .map(<[u8]>::to_vec))
    }

    fn set(&mut self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        self.nvs.set_blob(key, value).map_err(backend)
    }

    fn remove(&mut self, key: &str) -> Result<(), StoreError> {
        self.nvs.remove(key).map(|_| ()).map_err(backend)
    }
}
