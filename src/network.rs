//! WiFi 射频抽象与 STA 连接重试
//!
//! 真机上由 `esp::EspRadio` 实现，主机上和测试里由 `sim::SimRadio` 实现。

use std::fmt;
use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::setting::Credentials;

#[derive(Debug)]
pub enum RadioError {
    /// 驱动返回错误
    Driver(String),
    /// 配置项不合法（SSID 过长等）
    InvalidConfig(String),
}

impl fmt::Display for RadioError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RadioError::Driver(msg) => write!(f, "radio driver error: {}", msg),
            RadioError::InvalidConfig(msg) => write!(f, "invalid radio config: {}", msg),
        }
    }
}

impl std::error::Error for RadioError {}

/// STA 接口的连接状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    Idle,
    Connecting,
    Connected,
    WrongPassword,
    NoApFound,
    Failed,
}

/// 扫描到的网络
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NetworkInfo {
    pub ssid: String,
    pub rssi: i8,
    pub channel: u8,
    pub secured: bool,
}

/// SoftAP 参数，地址同时作为网关和 DNS
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessPointSettings {
    pub ssid: String,
    pub address: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub channel: u8,
    pub max_connections: u16,
}

pub trait Radio {
    fn mac_address(&self) -> [u8; 6];

    /// 开启 AP，并把地址、网关和 DNS 都设成 `ap.address`
    fn start_access_point(&mut self, ap: &AccessPointSettings) -> Result<(), RadioError>;
    fn stop_access_point(&mut self) -> Result<(), RadioError>;
    fn access_point_active(&self) -> bool;

    /// 发起 STA 连接，不等待结果
    fn connect(&mut self, credentials: &Credentials) -> Result<(), RadioError>;
    fn status(&self) -> LinkStatus;
    fn station_address(&self) -> Option<Ipv4Addr>;
    fn disconnect(&mut self) -> Result<(), RadioError>;

    fn scan(&mut self) -> Result<Vec<NetworkInfo>, RadioError>;
}

pub fn format_mac(mac: &[u8; 6]) -> String {
    format!(
        "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
        mac[0], mac[1], mac[2], mac[3], mac[4], mac[5]
    )
}

/// AP 名称：前缀 + MAC 后 3 字节
pub fn ap_ssid(prefix: &str, mac: &[u8; 6]) -> String {
    format!("{}-{:02x}{:02x}{:02x}", prefix, mac[3], mac[4], mac[5])
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for JoinPolicy {
    fn default() -> Self {
        Self {
            attempts: 10,
            delay: Duration::from_secs(2),
        }
    }
}

#[derive(Debug)]
pub enum JoinError {
    /// 重试次数用完仍未连上
    Timeout { attempts: u32 },
    AuthRejected,
    NetworkNotFound,
    Radio(RadioError),
}

impl fmt::Display for JoinError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JoinError::Timeout { attempts } => {
                write!(f, "not connected after {} attempts", attempts)
            }
            JoinError::AuthRejected => write!(f, "authentication rejected"),
            JoinError::NetworkNotFound => write!(f, "network not found"),
            JoinError::Radio(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for JoinError {}

#[derive(Debug)]
pub enum JoinProgress {
    Pending,
    Joined(Ipv4Addr),
    Failed(JoinError),
}

/// 一次 STA 连接尝试：固定次数、固定间隔地检查连接状态。
///
/// 不阻塞，由调用方在事件循环里反复 `poll`。
#[derive(Debug)]
pub struct JoinAttempt {
    credentials: Credentials,
    policy: JoinPolicy,
    checks: u32,
    next_check: Instant,
}

impl JoinAttempt {
    pub fn begin(
        radio: &mut dyn Radio,
        credentials: &Credentials,
        policy: JoinPolicy,
        now: Instant,
    ) -> Result<Self, JoinError> {
        log::info!(
            "Trying to connect to SSID '{}' with password {}",
            credentials.ssid,
            "*".repeat(credentials.password.len())
        );
        radio.connect(credentials).map_err(JoinError::Radio)?;

        Ok(Self {
            credentials: credentials.clone(),
            policy,
            checks: 0,
            next_check: now,
        })
    }

    pub fn ssid(&self) -> &str {
        &self.credentials.ssid
    }

    /// 这次尝试使用的凭据
    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    pub fn checks(&self) -> u32 {
        self.checks
    }

    /// 距离下一次检查还要多久
    pub fn wait_time(&self, now: Instant) -> Duration {
        self.next_check.saturating_duration_since(now)
    }

    pub fn poll(&mut self, radio: &mut dyn Radio, now: Instant) -> JoinProgress {
        if now < self.next_check {
            return JoinProgress::Pending;
        }

        let status = radio.status();
        match status {
            LinkStatus::Connected => {
                // 连上但还没拿到 DHCP 地址时按未连上计数
                if let Some(ip) = radio.station_address() {
                    log::info!("Connected to {} with IP {}", self.credentials.ssid, ip);
                    return JoinProgress::Joined(ip);
                }
            }
            LinkStatus::WrongPassword => return JoinProgress::Failed(JoinError::AuthRejected),
            _ => {}
        }

        self.checks += 1;
        log::info!(
            "Connection attempt {}/{} ...",
            self.checks,
            self.policy.attempts
        );

        if self.checks >= self.policy.attempts {
            let err = match status {
                LinkStatus::NoApFound => JoinError::NetworkNotFound,
                _ => JoinError::Timeout {
                    attempts: self.checks,
                },
            };
            return JoinProgress::Failed(err);
        }

        self.next_check = now + self.policy.delay;
        JoinProgress::Pending
    }
}

/// 阻塞地连接，仅在还没有任何 socket 时使用
pub fn connect_blocking(
    radio: &mut dyn Radio,
    credentials: &Credentials,
    policy: JoinPolicy,
) -> Result<Ipv4Addr, JoinError> {
    let mut attempt = JoinAttempt::begin(radio, credentials, policy, Instant::now())?;
    loop {
        let now = Instant::now();
        match attempt.poll(radio, now) {
            JoinProgress::Pending => std::thread::sleep(attempt.wait_time(Instant::now())),
            JoinProgress::Joined(ip) => return Ok(ip),
            JoinProgress::Failed(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimRadio;

    fn fast_policy(attempts: u32) -> JoinPolicy {
        JoinPolicy {
            attempts,
            delay: Duration::from_millis(1),
        }
    }

    #[test]
    fn mac_formatting() {
        let mac = [0x24, 0x0a, 0xc4, 0x12, 0xab, 0xcd];
        assert_eq!(format_mac(&mac), "24:0A:C4:12:AB:CD");
        assert_eq!(ap_ssid("Tegschtuhr", &mac), "Tegschtuhr-12abcd");
    }

    #[test]
    fn joins_known_network() {
        let mut radio = SimRadio::new().with_network("Home", "secret", -40);
        let ip = connect_blocking(
            &mut radio,
            &Credentials::new("Home", "secret"),
            fast_policy(5),
        )
        .unwrap();
        assert_eq!(Some(ip), radio.station_address());
    }

    #[test]
    fn unknown_network_exhausts_attempts() {
        let mut radio = SimRadio::new();
        let err = connect_blocking(
            &mut radio,
            &Credentials::new("Nowhere", "secret"),
            fast_policy(3),
        )
        .unwrap_err();
        assert!(matches!(err, JoinError::NetworkNotFound), "{err}");
        assert_eq!(radio.status_checks(), 3);
    }

    #[test]
    fn wrong_password_fails_early() {
        let mut radio = SimRadio::new().with_network("Home", "secret", -40);
        let err = connect_blocking(
            &mut radio,
            &Credentials::new("Home", "nope"),
            fast_policy(10),
        )
        .unwrap_err();
        assert!(matches!(err, JoinError::AuthRejected), "{err}");
        assert!(radio.status_checks() < 10);
    }

    #[test]
    fn poll_waits_for_delay() {
        let mut radio = SimRadio::new();
        let now = Instant::now();
        let policy = JoinPolicy {
            attempts: 3,
            delay: Duration::from_secs(60),
        };
        let mut attempt =
            JoinAttempt::begin(&mut radio, &Credentials::new("X", ""), policy, now).unwrap();

        assert!(matches!(attempt.poll(&mut radio, now), JoinProgress::Pending));
        assert_eq!(attempt.checks(), 1);
        // 间隔未到，不计数
        assert!(matches!(attempt.poll(&mut radio, now), JoinProgress::Pending));
        assert_eq!(attempt.checks(), 1);
        assert_eq!(attempt.wait_time(now), Duration::from_secs(60));
    }
}
