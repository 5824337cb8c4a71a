//! SoftAP + Web 配网模块
//!
//! 在一个线程里用 `mio` 同时跑 DNS 劫持和 HTTP 服务器，
//! 手机连上 AP 后访问任意域名都会跳到配网页面。

pub mod dns;
pub mod handlers;
mod html;
pub mod portal;
pub mod reactor;
pub mod request;
pub mod response;
pub mod server;

pub use handlers::{FirmwareStatus, HandlerContext, Hooks, Measurements};
pub use portal::{CaptivePortal, Connected, Mode, PortalConfig, PortalError};
