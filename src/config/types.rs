use std::collections::HashMap;

use anyhow::Result;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub log: LogConfig,
    pub inbounds: Vec<InboundConfig>,
    pub outbounds: Vec<OutboundConfig>,
    #[serde(default)]
    pub router: RouterConfig,
    #[serde(default)]
    pub policy: PolicyConfig,
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.inbounds.is_empty() {
            anyhow::bail!("at least one inbound is required");
        }
        if self.outbounds.is_empty() {
            anyhow::bail!("at least one outbound is required");
        }
        let outbound_tags: Vec<&str> = self.outbounds.iter().map(|o| o.tag.as_str()).collect();
        if !outbound_tags.contains(&self.router.default.as_str()) {
            anyhow::bail!(
                "router default '{}' does not match any outbound tag",
                self.router.default
            );
        }
        for rule in &self.router.rules {
            if !outbound_tags.contains(&rule.outbound.as_str()) {
                anyhow::bail!(
                    "rule outbound '{}' does not match any outbound tag",
                    rule.outbound
                );
            }
        }
        for inbound in &self.inbounds {
            if inbound.protocol == "wireguard" {
                inbound.settings.validate_wireguard(&inbound.tag)?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Deserialize)]
pub struct InboundConfig {
    pub tag: String,
    pub protocol: String,
    #[serde(default = "default_listen")]
    pub listen: String,
    pub port: u16,
    #[serde(default)]
    pub settings: InboundSettings,
}

fn default_listen() -> String {
    "0.0.0.0".to_string()
}

#[derive(Debug, Default, Deserialize)]
pub struct InboundSettings {
    /// WireGuard 本端私钥（base64）
    pub private_key: Option<String>,
    /// 隧道内地址，如 "10.0.0.1/24"、"fd00::1/64"
    #[serde(default)]
    pub address: Vec<String>,
    #[serde(default)]
    pub peers: Vec<WireGuardPeerConfig>,
    pub mtu: Option<u16>,
    /// 解密队列深度系数
    pub num_workers: Option<usize>,
}

impl InboundSettings {
    fn validate_wireguard(&self, tag: &str) -> Result<()> {
        if self.private_key.is_none() {
            anyhow::bail!("wireguard inbound '{}' missing private_key", tag);
        }
        if self.peers.is_empty() {
            anyhow::bail!("wireguard inbound '{}' requires at least one peer", tag);
        }
        if self.address.is_empty() {
            anyhow::bail!("wireguard inbound '{}' requires a tunnel address", tag);
        }
        if let Some(mtu) = self.mtu {
            if mtu < 576 {
                anyhow::bail!("wireguard inbound '{}' mtu {} is too small", tag, mtu);
            }
        }
        Ok(())
    }

    pub fn normalized_mtu(&self) -> u16 {
        self.mtu.unwrap_or(1420)
    }
}

#[derive(Debug, Deserialize)]
pub struct WireGuardPeerConfig {
    pub public_key: String,
    pub preshared_key: Option<String>,
    #[serde(default)]
    pub allowed_ips: Vec<String>,
    pub keepalive: Option<u16>,
}

#[derive(Debug, Deserialize)]
pub struct OutboundConfig {
    pub tag: String,
    pub protocol: String,
    #[serde(default)]
    pub settings: OutboundSettings,
}

#[derive(Debug, Default, Deserialize)]
pub struct OutboundSettings {
    pub address: Option<String>,
    pub port: Option<u16>,
    #[serde(default)]
    pub transport: TransportConfig,
    pub tls: Option<TlsConfig>,
}

/// 传输层配置。splithttp 的字段与其它传输类型平铺在一起。
#[derive(Debug, Default, Clone, Deserialize)]
pub struct TransportConfig {
    #[serde(default)]
    pub transport_type: String,
    pub host: Option<String>,
    pub path: Option<String>,
    pub max_concurrent_uploads: Option<u32>,
    pub max_upload_size: Option<usize>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// TCP 连接超时（秒）
    pub connect_timeout: Option<u64>,
}

impl TransportConfig {
    /// 规范化路径：保证以 "/" 开头
    pub fn normalized_path(&self) -> String {
        match self.path.as_deref() {
            None | Some("") => "/".to_string(),
            Some(p) if p.starts_with('/') => p.to_string(),
            Some(p) => format!("/{}", p),
        }
    }

    pub fn normalized_max_concurrent_uploads(&self) -> u32 {
        match self.max_concurrent_uploads {
            Some(n) if n > 0 => n,
            _ => 10,
        }
    }

    pub fn normalized_max_upload_size(&self) -> usize {
        match self.max_upload_size {
            Some(n) if n > 0 => n,
            _ => 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TlsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub sni: Option<String>,
    pub alpn: Option<Vec<String>>,
    /// 浏览器指纹档位（chrome / firefox / safari / ...）
    pub fingerprint: Option<String>,
    #[serde(default)]
    pub allow_insecure: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
pub struct RouterConfig {
    #[serde(default)]
    pub rules: Vec<RuleConfig>,
    #[serde(default = "default_outbound")]
    pub default: String,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            rules: Vec::new(),
            default: "direct".to_string(),
        }
    }
}

fn default_outbound() -> String {
    "direct".to_string()
}

#[derive(Debug, Deserialize)]
pub struct RuleConfig {
    #[serde(rename = "type")]
    pub rule_type: String,
    pub values: Vec<String>,
    pub outbound: String,
}

/// 连接生命周期策略（level 0）
#[derive(Debug, Clone, Deserialize)]
pub struct PolicyConfig {
    #[serde(default = "default_connection_idle")]
    pub connection_idle: u64,
    #[serde(default = "default_uplink_only")]
    pub uplink_only: u64,
    #[serde(default = "default_downlink_only")]
    pub downlink_only: u64,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            connection_idle: default_connection_idle(),
            uplink_only: default_uplink_only(),
            downlink_only: default_downlink_only(),
        }
    }
}

fn default_connection_idle() -> u64 {
    300
}

fn default_uplink_only() -> u64 {
    2
}

fn default_downlink_only() -> u64 {
    5
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_config() -> Config {
        serde_yml::from_str(
            r#"
inbounds:
  - tag: wg-in
    protocol: wireguard
    port: 51820
    settings:
      private_key: "GCEp3sCqUpmFkTTTvBRHNSrUricSDSJdzNmbCZmMG0M="
      address: ["10.23.0.1/24"]
      peers:
        - public_key: "Jnr4cTNo2o2B8lZYAGy9KsaZa1WcPj0tCM/appkXNnM="
          allowed_ips: ["10.23.0.2/32"]
outbounds:
  - tag: direct
    protocol: direct
router:
  default: direct
"#,
        )
        .unwrap()
    }

    #[test]
    fn validate_ok() {
        assert!(minimal_config().validate().is_ok());
    }

    #[test]
    fn validate_no_inbounds() {
        let mut config = minimal_config();
        config.inbounds.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_router_default_missing() {
        let mut config = minimal_config();
        config.router.default = "nonexistent".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_wireguard_missing_peers() {
        let mut config = minimal_config();
        config.inbounds[0].settings.peers.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_wireguard_tiny_mtu() {
        let mut config = minimal_config();
        config.inbounds[0].settings.mtu = Some(100);
        assert!(config.validate().is_err());
    }

    #[test]
    fn normalized_path_defaults() {
        let tc = TransportConfig::default();
        assert_eq!(tc.normalized_path(), "/");

        let tc = TransportConfig {
            path: Some("tunnel".to_string()),
            ..Default::default()
        };
        assert_eq!(tc.normalized_path(), "/tunnel");

        let tc = TransportConfig {
            path: Some("/tunnel".to_string()),
            ..Default::default()
        };
        assert_eq!(tc.normalized_path(), "/tunnel");
    }

    #[test]
    fn normalized_upload_limits() {
        let tc = TransportConfig::default();
        assert_eq!(tc.normalized_max_concurrent_uploads(), 10);
        assert_eq!(tc.normalized_max_upload_size(), 1024 * 1024);

        let tc = TransportConfig {
            max_concurrent_uploads: Some(0),
            max_upload_size: Some(0),
            ..Default::default()
        };
        assert_eq!(tc.normalized_max_concurrent_uploads(), 10);
        assert_eq!(tc.normalized_max_upload_size(), 1024 * 1024);

        let tc = TransportConfig {
            max_concurrent_uploads: Some(2),
            max_upload_size: Some(4096),
            ..Default::default()
        };
        assert_eq!(tc.normalized_max_concurrent_uploads(), 2);
        assert_eq!(tc.normalized_max_upload_size(), 4096);
    }

    #[test]
    fn policy_defaults() {
        let p = PolicyConfig::default();
        assert_eq!(p.connection_idle, 300);
        assert_eq!(p.uplink_only, 2);
        assert_eq!(p.downlink_only, 5);
    }

    #[test]
    fn deserialize_splithttp_outbound() {
        let yaml = r#"
inbounds:
  - tag: wg-in
    protocol: wireguard
    port: 51820
    settings:
      private_key: "GCEp3sCqUpmFkTTTvBRHNSrUricSDSJdzNmbCZmMG0M="
      address: ["10.23.0.1/24"]
      peers:
        - public_key: "Jnr4cTNo2o2B8lZYAGy9KsaZa1WcPj0tCM/appkXNnM="
outbounds:
  - tag: relay
    protocol: direct
    settings:
      address: "cdn.example.com"
      port: 443
      transport:
        transport_type: splithttp
        path: /video
        max_concurrent_uploads: 4
        headers:
          User-Agent: "curl/8"
      tls:
        sni: cdn.example.com
        fingerprint: chrome
  - tag: direct
    protocol: direct
router:
  default: direct
"#;
        let config: Config = serde_yml::from_str(yaml).unwrap();
        assert!(config.validate().is_ok());
        let settings = &config.outbounds[0].settings;
        assert_eq!(settings.transport.transport_type, "splithttp");
        assert_eq!(settings.transport.normalized_path(), "/video");
        assert_eq!(settings.transport.normalized_max_concurrent_uploads(), 4);
        let tls = settings.tls.as_ref().unwrap();
        assert!(tls.enabled);
        assert_eq!(tls.fingerprint.as_deref(), Some("chrome"));
    }
}
