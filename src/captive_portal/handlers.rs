//! HTTP 路由处理器

use std::net::Ipv4Addr;
use std::str::FromStr;

use http::StatusCode;
use serde::Serialize;

use super::html;
use super::request::Params;
use super::response::Response;
use super::server::{Route, Routes, StaticResource};
use crate::network::{NetworkInfo, Radio};
use crate::setting::{Credentials, DeviceConfig, SettingStore};

/// 自定义像素矩阵的行列数
pub const MATRIX_ROWS: u8 = 12;
pub const MATRIX_COLS: u8 = 14;

/// 传感器快照，读不到的值为 `None`
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Measurements {
    pub temperature: Option<f32>,
    pub humidity: Option<f32>,
    pub pressure: Option<f32>,
    pub brightness: Option<f32>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FirmwareStatus {
    pub current_version: String,
    pub latest_version: Option<String>,
    pub update_available: bool,
}

impl Default for FirmwareStatus {
    fn default() -> Self {
        Self {
            current_version: env!("CARGO_PKG_VERSION").to_string(),
            latest_version: None,
            update_available: false,
        }
    }
}

/// 由应用注入的回调
pub struct Hooks {
    pub measurements: Box<dyn FnMut() -> Measurements>,
    pub set_brightness: Box<dyn FnMut(u8)>,
    pub check_update: Box<dyn FnMut()>,
    pub firmware: Box<dyn FnMut() -> FirmwareStatus>,
}

impl Default for Hooks {
    fn default() -> Self {
        Self {
            measurements: Box::new(Measurements::default),
            set_brightness: Box::new(|level| log::info!("Brightness preview: {}", level)),
            check_update: Box::new(|| log::info!("Update requested")),
            firmware: Box::new(FirmwareStatus::default),
        }
    }
}

/// 处理器能访问的所有状态
pub struct HandlerContext<'a> {
    pub settings: &'a mut SettingStore,
    pub radio: &'a mut dyn Radio,
    pub hooks: &'a mut Hooks,
    /// 当前对外的地址，重定向用
    pub address: Ipv4Addr,
    pub mac_address: &'a str,
}

pub fn index_page() -> &'static [u8] {
    html::INDEX_HTML.as_bytes()
}

/// 配网页面的全部路由
pub fn routes() -> Routes {
    let mut routes = Routes::new();
    routes.insert(
        "/",
        Route::Static(StaticResource::Embedded {
            content_type: "text/html; charset=utf-8",
            body: index_page(),
        }),
    );
    routes.insert("/get_info", Route::Handler(get_info));
    routes.insert("/login", Route::Handler(login));
    routes.insert("/settings", Route::Handler(settings));
    routes.insert("/update_software", Route::Handler(update_software));
    routes.insert("/lightprev", Route::Handler(light_preview));
    routes
}

#[derive(Serialize)]
struct Info<'a> {
    #[serde(flatten)]
    measurements: Measurements,
    mac_address: &'a str,
    ssid: Option<&'a str>,
    networks: Vec<NetworkInfo>,
    #[serde(flatten)]
    firmware: FirmwareStatus,
    #[serde(flatten)]
    config: &'a DeviceConfig,
}

fn get_info(ctx: &mut HandlerContext<'_>, _params: &Params) -> Response {
    let networks = ctx.radio.scan().unwrap_or_else(|e| {
        log::warn!("WiFi scan failed: {}", e);
        Vec::new()
    });

    let info = Info {
        measurements: (ctx.hooks.measurements)(),
        mac_address: ctx.mac_address,
        ssid: ctx.settings.credentials().map(|c| c.ssid.as_str()),
        networks,
        firmware: (ctx.hooks.firmware)(),
        config: ctx.settings.config(),
    };

    match serde_json::to_vec(&info) {
        Ok(body) => Response::ok("application/json", body),
        Err(e) => {
            log::error!("Failed to encode device info: {}", e);
            Response::new(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

fn login(ctx: &mut HandlerContext<'_>, params: &Params) -> Response {
    match params.get("ssid").filter(|ssid| !ssid.is_empty()) {
        Some(ssid) => {
            let password = params.get("password").map_or("", String::as_str);
            let credentials = Credentials::new(ssid.as_str(), password);
            log::info!("Received credentials {:?}", credentials);
            if let Err(e) = ctx.settings.set_credentials(credentials) {
                log::error!("Failed to store credentials: {}", e);
            }
        }
        None => log::warn!("Login without ssid ignored"),
    }
    Response::redirect(ctx.address)
}

fn settings(ctx: &mut HandlerContext<'_>, params: &Params) -> Response {
    let mut config = ctx.settings.config().clone();
    apply_settings(&mut config, params);

    if config != *ctx.settings.config() {
        match ctx.settings.set_config(config) {
            Ok(()) => log::info!("Settings saved"),
            Err(e) => log::error!("Failed to save settings: {}", e),
        }
    }
    Response::redirect(ctx.address)
}

fn update_software(ctx: &mut HandlerContext<'_>, _params: &Params) -> Response {
    (ctx.hooks.check_update)();
    Response::new(StatusCode::OK)
}

fn light_preview(ctx: &mut HandlerContext<'_>, params: &Params) -> Response {
    match params.get("level").map(|level| level.trim().parse::<u8>()) {
        Some(Ok(level)) => (ctx.hooks.set_brightness)(level),
        Some(Err(_)) => log::warn!("Ignoring invalid level {:?}", params.get("level")),
        None => log::debug!("Light preview without level"),
    }
    Response::redirect(ctx.address)
}

fn set_parsed<T: FromStr>(slot: &mut T, params: &Params, key: &str) {
    let Some(raw) = params.get(key) else {
        return;
    };
    match raw.trim().parse() {
        Ok(value) => *slot = value,
        Err(_) => log::warn!("Ignoring invalid {}={:?}", key, raw),
    }
}

fn is_checked(value: &str) -> bool {
    matches!(value, "on" | "1" | "true")
}

/// `pRR_CC` -> `[row, col]`
fn custom_position(key: &str) -> Option<[u8; 2]> {
    let (row, col) = key.strip_prefix('p')?.split_once('_')?;
    if row.len() != 2 || col.len() != 2 {
        return None;
    }
    let row: u8 = row.parse().ok()?;
    let col: u8 = col.parse().ok()?;
    (row < MATRIX_ROWS && col < MATRIX_COLS).then_some([row, col])
}

/// 把表单参数合并到配置里。
///
/// 缺少或解析失败的字段保留原值。复选框没勾选时浏览器不会提交，
/// 所以只要表单非空，`debug` 和自定义像素都以本次提交为准。
pub fn apply_settings(config: &mut DeviceConfig, params: &Params) {
    if params.is_empty() {
        return;
    }

    set_parsed(&mut config.lat, params, "lat");
    set_parsed(&mut config.lon, params, "lon");
    set_parsed(&mut config.foreindex, params, "foreindex");
    if let Some(ap_id) = params.get("ap_id") {
        config.ap_id = ap_id.trim().to_string();
    }
    set_parsed(&mut config.min_level, params, "min_level");
    set_parsed(&mut config.min_lum, params, "min_lum");
    set_parsed(&mut config.max_level, params, "max_level");
    set_parsed(&mut config.max_lum, params, "max_lum");

    let mut timeout = config.timeout;
    set_parsed(&mut timeout, params, "timeout");
    if timeout > 0 {
        config.timeout = timeout;
    }

    config.custom_pos = params
        .iter()
        .filter(|(_, value)| is_checked(value))
        .filter_map(|(key, _)| custom_position(key))
        .collect();
    config.debug = params.get("debug").is_some_and(|v| is_checked(v));
}
