//! Tegschtuhr 配网引擎
//!
//! 没有可用 WiFi 凭据时开启 AP，用 DNS 劫持把所有域名指向设备，
//! 在网页上填写 WiFi 和设备设置。

pub mod captive_portal;
pub mod network;
pub mod setting;
pub mod sim;

#[cfg(target_os = "espidf")]
pub mod esp;
