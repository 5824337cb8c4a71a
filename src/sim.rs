//! 主机上使用的模拟射频
//!
//! 记住一组"附近的网络"，按凭据决定连接结果。状态检查次数可查询，
//! 方便测试重试策略。

use std::cell::Cell;
use std::net::Ipv4Addr;

use crate::network::{AccessPointSettings, LinkStatus, NetworkInfo, Radio, RadioError};
use crate::setting::Credentials;

#[derive(Debug)]
struct SimNetwork {
    info: NetworkInfo,
    password: String,
}

#[derive(Debug)]
pub struct SimRadio {
    mac: [u8; 6],
    networks: Vec<SimNetwork>,
    station_ip: Ipv4Addr,
    connect_delay: u32,

    ap: Option<AccessPointSettings>,
    ap_starts: u32,

    target: Option<Credentials>,
    countdown: Cell<u32>,
    connected: Cell<bool>,
    status_checks: Cell<u32>,
}

impl Default for SimRadio {
    fn default() -> Self {
        Self::new()
    }
}

impl SimRadio {
    pub fn new() -> Self {
        Self {
            mac: [0x24, 0x0a, 0xc4, 0x12, 0xab, 0xcd],
            networks: Vec::new(),
            station_ip: Ipv4Addr::new(192, 168, 1, 50),
            connect_delay: 1,
            ap: None,
            ap_starts: 0,
            target: None,
            countdown: Cell::new(0),
            connected: Cell::new(false),
            status_checks: Cell::new(0),
        }
    }

    pub fn with_network(mut self, ssid: &str, password: &str, rssi: i8) -> Self {
        let channel = (self.networks.len() % 13 + 1) as u8;
        self.networks.push(SimNetwork {
            info: NetworkInfo {
                ssid: ssid.to_string(),
                rssi,
                channel,
                secured: !password.is_empty(),
            },
            password: password.to_string(),
        });
        self
    }

    pub fn with_mac(mut self, mac: [u8; 6]) -> Self {
        self.mac = mac;
        self
    }

    pub fn with_station_address(mut self, ip: Ipv4Addr) -> Self {
        self.station_ip = ip;
        self
    }

    /// 连接成功前要经历几次 "Connecting"
    pub fn with_connect_delay(mut self, checks: u32) -> Self {
        self.connect_delay = checks;
        self
    }

    pub fn access_point(&self) -> Option<&AccessPointSettings> {
        self.ap.as_ref()
    }

    pub fn ap_starts(&self) -> u32 {
        self.ap_starts
    }

    pub fn status_checks(&self) -> u32 {
        self.status_checks.get()
    }
}

impl Radio for SimRadio {
    fn mac_address(&self) -> [u8; 6] {
        self.mac
    }

    fn start_access_point(&mut self, ap: &AccessPointSettings) -> Result<(), RadioError> {
        if ap.ssid.is_empty() || ap.ssid.len() > 32 {
            return Err(RadioError::InvalidConfig(format!("ssid {:?}", ap.ssid)));
        }
        self.ap = Some(ap.clone());
        self.ap_starts += 1;
        Ok(())
    }

    fn stop_access_point(&mut self) -> Result<(), RadioError> {
        self.ap = None;
        Ok(())
    }

    fn access_point_active(&self) -> bool {
        self.ap.is_some()
    }

    fn connect(&mut self, credentials: &Credentials) -> Result<(), RadioError> {
        self.target = Some(credentials.clone());
        self.countdown.set(self.connect_delay);
        self.connected.set(false);
        Ok(())
    }

    fn status(&self) -> LinkStatus {
        self.status_checks.set(self.status_checks.get() + 1);

        let Some(target) = &self.target else {
            return LinkStatus::Idle;
        };
        if self.connected.get() {
            return LinkStatus::Connected;
        }
        if self.countdown.get() > 0 {
            self.countdown.set(self.countdown.get() - 1);
            return LinkStatus::Connecting;
        }

        match self.networks.iter().find(|n| n.info.ssid == target.ssid) {
            Some(n) if n.password == target.password => {
                self.connected.set(true);
                LinkStatus::Connected
            }
            Some(_) => LinkStatus::WrongPassword,
            None => LinkStatus::NoApFound,
        }
    }

    fn station_address(&self) -> Option<Ipv4Addr> {
        self.connected.get().then_some(self.station_ip)
    }

    fn disconnect(&mut self) -> Result<(), RadioError> {
        self.target = None;
        self.connected.set(false);
        Ok(())
    }

    fn scan(&mut self) -> Result<Vec<NetworkInfo>, RadioError> {
        let mut found: Vec<NetworkInfo> = self.networks.iter().map(|n| n.info.clone()).collect();
        found.sort_by(|a, b| b.rssi.cmp(&a.rssi));
        Ok(found)
    }
}
