//! 配网流程
//!
//! 先用保存的凭据连接路由器，失败后开启 AP、HTTP 和 DNS 劫持，
//! 等用户在网页上填写凭据。连上后 AP 再保留一段时间让网页能显示结果。

use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::{Duration, Instant};

use super::dns::DnsResponder;
use super::handlers::{self, HandlerContext, Hooks};
use super::reactor::{Reactor, DNS_SOCKET};
use super::response::SEGMENT_SIZE;
use super::server::{HttpConfig, HttpServer};
use crate::network::{
    ap_ssid, connect_blocking, format_mac, AccessPointSettings, JoinAttempt, JoinPolicy,
    JoinProgress, Radio, RadioError,
};
use crate::setting::SettingStore;

#[derive(Debug, Clone)]
pub struct PortalConfig {
    /// AP 的地址，同时也是网关和 DNS
    pub address: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub bind_address: IpAddr,
    pub http_port: u16,
    pub dns_port: u16,
    pub ssid_prefix: String,
    pub channel: u8,
    pub ap_max_clients: u16,
    pub poll_interval: Duration,
    /// 连上路由器后 AP 继续保留的时间
    pub ap_off_delay: Duration,
    pub join: JoinPolicy,
    pub max_connections: usize,
    pub segment_size: usize,
    pub max_request_bytes: usize,
    /// 不设置时使用 `DeviceConfig::timeout`
    pub inactivity_timeout: Option<Duration>,
}

impl Default for PortalConfig {
    fn default() -> Self {
        Self {
            address: Ipv4Addr::new(192, 168, 4, 1),
            netmask: Ipv4Addr::new(255, 255, 255, 0),
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            http_port: 80,
            dns_port: 53,
            ssid_prefix: "Tegschtuhr".to_string(),
            channel: 1,
            ap_max_clients: 4,
            poll_interval: Duration::from_millis(100),
            ap_off_delay: Duration::from_secs(10),
            join: JoinPolicy::default(),
            max_connections: 5,
            segment_size: SEGMENT_SIZE,
            max_request_bytes: 2048,
            inactivity_timeout: None,
        }
    }
}

impl PortalConfig {
    fn http_config(&self) -> HttpConfig {
        HttpConfig {
            bind: SocketAddr::new(self.bind_address, self.http_port),
            max_connections: self.max_connections,
            segment_size: self.segment_size,
            max_request_bytes: self.max_request_bytes,
        }
    }

    fn dns_bind(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.dns_port)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Idle,
    TryStoredCredentials,
    Serving,
    /// 仍在 SERVING，同时在后台检查 STA 连接
    Joining,
    WindDown,
    Connected,
    TimedOut,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connected {
    pub ssid: String,
    pub address: Ipv4Addr,
    /// 是否经过了配网页面
    pub via_portal: bool,
}

#[derive(Debug)]
pub enum PortalError {
    TimedOut { idle: Duration },
    NotConnected,
    Io(io::Error),
    Radio(RadioError),
}

impl fmt::Display for PortalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortalError::TimedOut { idle } => {
                write!(f, "captive portal timed out after {:?} without activity", idle)
            }
            PortalError::NotConnected => write!(f, "not connected to a WiFi network"),
            PortalError::Io(e) => write!(f, "socket error: {}", e),
            PortalError::Radio(e) => write!(f, "radio error: {}", e),
        }
    }
}

impl std::error::Error for PortalError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PortalError::Io(e) => Some(e),
            PortalError::Radio(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for PortalError {
    fn from(e: io::Error) -> Self {
        PortalError::Io(e)
    }
}

impl From<RadioError> for PortalError {
    fn from(e: RadioError) -> Self {
        PortalError::Radio(e)
    }
}

struct WindDown {
    since: Instant,
    connected: Connected,
}

/// 一次配网期间持有的 socket
struct Session {
    reactor: Reactor,
    http: Option<HttpServer>,
    dns: Option<DnsResponder>,
    join: Option<JoinAttempt>,
    wind_down: Option<WindDown>,
    last_activity: Instant,
}

pub struct CaptivePortal<R: Radio> {
    config: PortalConfig,
    radio: R,
    settings: SettingStore,
    hooks: Hooks,
    mac_address: String,
    mode: Mode,
    session: Option<Session>,
}

impl<R: Radio> CaptivePortal<R> {
    pub fn new(config: PortalConfig, radio: R, settings: SettingStore) -> Self {
        let mac_address = format_mac(&radio.mac_address());
        Self {
            config,
            radio,
            settings,
            hooks: Hooks::default(),
            mac_address,
            mode: Mode::Idle,
            session: None,
        }
    }

    pub fn with_hooks(mut self, hooks: Hooks) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn radio(&self) -> &R {
        &self.radio
    }

    pub fn settings(&self) -> &SettingStore {
        &self.settings
    }

    pub fn mac_address(&self) -> &str {
        &self.mac_address
    }

    pub fn http_addr(&self) -> Option<SocketAddr> {
        self.session
            .as_ref()?
            .http
            .as_ref()
            .and_then(|http| http.local_addr().ok())
    }

    pub fn dns_addr(&self) -> Option<SocketAddr> {
        self.session
            .as_ref()?
            .dns
            .as_ref()
            .and_then(|dns| dns.local_addr().ok())
    }

    /// 当前在 reactor 里注册的 socket 数
    pub fn registered_sources(&self) -> usize {
        self.session.as_ref().map_or(0, |s| s.reactor.registered())
    }

    fn inactivity_timeout(&self) -> Duration {
        self.config
            .inactivity_timeout
            .unwrap_or_else(|| self.settings.config().inactivity_timeout())
    }

    /// 先试保存的凭据，不行再开配网页面
    pub fn start(&mut self) -> Result<Connected, PortalError> {
        // 先断开，强制重新连接
        if let Err(e) = self.radio.disconnect() {
            log::warn!("Failed to disconnect station: {}", e);
        }
        if let Some(connected) = self.try_stored_credentials() {
            return Ok(connected);
        }
        self.run()
    }

    /// 阻塞地尝试保存的凭据。失败或凭据无效时删除凭据。
    pub fn try_stored_credentials(&mut self) -> Option<Connected> {
        self.mode = Mode::TryStoredCredentials;
        let stored = self.settings.credentials().cloned()?;

        if stored.is_valid() {
            match connect_blocking(&mut self.radio, &stored, self.config.join) {
                Ok(address) => {
                    self.mode = Mode::Connected;
                    return Some(Connected {
                        ssid: stored.ssid,
                        address,
                        via_portal: false,
                    });
                }
                Err(e) => log::warn!("Failed to connect to {}: {}", stored.ssid, e),
            }
            if let Err(e) = self.radio.disconnect() {
                log::warn!("Failed to disconnect station: {}", e);
            }
        } else {
            log::warn!("Stored credentials are invalid: {:?}", stored);
        }

        self.forget_credentials();
        None
    }

    /// 开启配网页面直到连上路由器或超时
    pub fn run(&mut self) -> Result<Connected, PortalError> {
        log::info!("Starting captive portal");
        if let Err(e) = self.open() {
            self.teardown();
            return Err(e);
        }

        loop {
            match self.tick() {
                Ok(Some(connected)) => return Ok(connected),
                Ok(None) => {}
                Err(e) => {
                    self.teardown();
                    return Err(e);
                }
            }
        }
    }

    /// AP_UP：重启 AP，启动 HTTP 和 DNS
    pub fn open(&mut self) -> Result<(), PortalError> {
        self.teardown();

        let ap = AccessPointSettings {
            ssid: ap_ssid(&self.config.ssid_prefix, &self.radio.mac_address()),
            address: self.config.address,
            netmask: self.config.netmask,
            channel: self.config.channel,
            max_connections: self.config.ap_max_clients,
        };
        // 有时需要先关掉 AP 才能正常开启
        self.radio.stop_access_point()?;
        self.radio.start_access_point(&ap)?;
        log::info!("AP mode configured: {} at {}", ap.ssid, ap.address);

        let mut reactor = Reactor::new(64)?;
        let http = HttpServer::start(
            &mut reactor,
            &self.config.http_config(),
            self.config.address,
            handlers::routes(),
        )?;
        let dns = DnsResponder::start(&mut reactor, self.config.dns_bind(), self.config.address)?;

        self.session = Some(Session {
            reactor,
            http: Some(http),
            dns: Some(dns),
            join: None,
            wind_down: None,
            last_activity: Instant::now(),
        });
        self.mode = Mode::Serving;
        Ok(())
    }

    /// 一轮：分发事件，检查 WiFi，检查超时。连上并关掉 AP 后返回 `Some`。
    pub fn tick(&mut self) -> Result<Option<Connected>, PortalError> {
        let handled = self.dispatch(self.config.poll_interval)?;
        let now = Instant::now();

        let Some(session) = self.session.as_mut() else {
            return Err(PortalError::NotConnected);
        };
        if handled > 0 {
            session.last_activity = now;
        }

        if let Some(connected) = self.check_wifi(now) {
            return Ok(Some(connected));
        }

        // 连接失败回到 SERVING 时会重置计时
        let idle = self
            .session
            .as_ref()
            .map_or(Duration::ZERO, |s| now.saturating_duration_since(s.last_activity));
        if self.mode == Mode::Serving && idle >= self.inactivity_timeout() {
            log::warn!("Captive portal idle for {:?}, giving up", idle);
            self.mode = Mode::TimedOut;
            return Err(PortalError::TimedOut { idle });
        }
        Ok(None)
    }

    /// 连上路由器后继续在局域网里提供设置页面
    pub fn serve(&mut self, timeout: Duration) -> Result<usize, PortalError> {
        if self.mode != Mode::Connected {
            return Err(PortalError::NotConnected);
        }

        let running = self.session.as_ref().is_some_and(|s| s.http.is_some());
        if !running {
            let address = self
                .radio
                .station_address()
                .ok_or(PortalError::NotConnected)?;
            let mut reactor = Reactor::new(16)?;
            let http = HttpServer::start(
                &mut reactor,
                &self.config.http_config(),
                address,
                handlers::routes(),
            )?;
            self.session = Some(Session {
                reactor,
                http: Some(http),
                dns: None,
                join: None,
                wind_down: None,
                last_activity: Instant::now(),
            });
        }

        self.dispatch(timeout)
    }

    /// 等待一次事件并全部处理，返回处理了的事件数
    fn dispatch(&mut self, timeout: Duration) -> Result<usize, PortalError> {
        let Some(session) = self.session.as_mut() else {
            return Ok(0);
        };

        let events = session.reactor.poll(timeout)?;
        let mut handled = 0;
        for event in &events {
            if event.token == DNS_SOCKET {
                if let Some(dns) = session.dns.as_mut() {
                    match dns.handle(event) {
                        Ok(_) => handled += 1,
                        Err(e) => log::warn!("DNS error: {}", e),
                    }
                }
                continue;
            }

            let Some(http) = session.http.as_mut() else {
                continue;
            };
            let mut ctx = HandlerContext {
                settings: &mut self.settings,
                radio: &mut self.radio,
                hooks: &mut self.hooks,
                address: http.address(),
                mac_address: &self.mac_address,
            };
            if http.handle(&mut session.reactor, event, &mut ctx) {
                handled += 1;
            }
        }
        Ok(handled)
    }

    fn check_wifi(&mut self, now: Instant) -> Option<Connected> {
        let session = self.session.as_mut()?;

        match self.mode {
            Mode::Serving => {
                let stored = self.settings.credentials().cloned()?;
                if !stored.is_valid() {
                    log::warn!("Received invalid credentials: {:?}", stored);
                    self.forget_credentials();
                    return None;
                }
                match JoinAttempt::begin(&mut self.radio, &stored, self.config.join, now) {
                    Ok(attempt) => {
                        session.join = Some(attempt);
                        self.mode = Mode::Joining;
                    }
                    Err(e) => {
                        log::warn!("Failed to start connecting to {}: {}", stored.ssid, e);
                        self.forget_credentials();
                    }
                }
                None
            }
            Mode::Joining => {
                let attempt = session.join.as_mut()?;
                match attempt.poll(&mut self.radio, now) {
                    JoinProgress::Pending => {}
                    JoinProgress::Joined(address) => {
                        log::info!(
                            "Connected to WiFi, turning off access point in {:?}",
                            self.config.ap_off_delay
                        );
                        session.wind_down = Some(WindDown {
                            since: now,
                            connected: Connected {
                                ssid: attempt.ssid().to_string(),
                                address,
                                via_portal: true,
                            },
                        });
                        session.join = None;
                        self.mode = Mode::WindDown;
                    }
                    JoinProgress::Failed(e) => {
                        log::warn!("Failed to connect to {}: {}", attempt.ssid(), e);
                        // 尝试期间用户可能又提交了新凭据，新凭据留给下一轮
                        let unchanged = self.settings.credentials() == Some(attempt.credentials());
                        session.join = None;
                        session.last_activity = now;

                        if let Err(e) = self.radio.disconnect() {
                            log::warn!("Failed to disconnect station: {}", e);
                        }
                        if unchanged {
                            self.forget_credentials();
                        } else {
                            log::info!("Credentials changed during the attempt, trying again");
                        }
                        self.mode = Mode::Serving;
                    }
                }
                None
            }
            Mode::WindDown => {
                let since = session.wind_down.as_ref()?.since;
                if now.saturating_duration_since(since) < self.config.ap_off_delay {
                    return None;
                }
                let WindDown { connected, .. } = session.wind_down.take()?;

                if let Some(dns) = session.dns.take() {
                    dns.stop(&mut session.reactor);
                }
                if let Err(e) = self.radio.stop_access_point() {
                    log::warn!("Failed to turn off access point: {}", e);
                } else {
                    log::info!("Turned off access point");
                }
                if let Some(http) = session.http.as_mut() {
                    http.set_address(connected.address);
                }
                self.mode = Mode::Connected;
                Some(connected)
            }
            _ => None,
        }
    }

    fn forget_credentials(&mut self) {
        if let Err(e) = self.settings.remove_credentials() {
            log::error!("Failed to remove credentials: {}", e);
        }
    }

    /// 关闭所有 socket 和 AP，可以重复调用
    pub fn teardown(&mut self) {
        if let Some(session) = self.session.as_mut() {
            if let Some(http) = session.http.take() {
                http.stop(&mut session.reactor);
            }
            if let Some(dns) = session.dns.take() {
                dns.stop(&mut session.reactor);
            }
            session.join = None;
            session.wind_down = None;
        }

        if self.radio.access_point_active() {
            match self.radio.stop_access_point() {
                Ok(()) => log::info!("Turned off access point"),
                Err(e) => log::warn!("Failed to turn off access point: {}", e),
            }
        }
    }
}

impl<R: Radio> Drop for CaptivePortal<R> {
    fn drop(&mut self) {
        self.teardown();
    }
}
