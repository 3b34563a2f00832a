pub mod addons;
pub mod encoding;

/// vision 流控的 flow 标识
pub const XRV: &str = "xtls-rprx-vision";
