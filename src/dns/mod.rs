//! DNS 解析边界。
//!
//! 平台的 DNS 能力在这里收敛成一个 trait；WireGuard bind 在解析
//! 对端地址时按隧道栈的 v4/v6 能力过滤结果。

use std::net::IpAddr;

use anyhow::Result;
use async_trait::async_trait;

use crate::common::Error;

/// 地址族开关，由隧道栈的能力决定
#[derive(Debug, Clone, Copy)]
pub struct IpOption {
    pub v4_enable: bool,
    pub v6_enable: bool,
}

impl IpOption {
    pub fn allows(&self, ip: &IpAddr) -> bool {
        match ip {
            IpAddr::V4(_) => self.v4_enable,
            IpAddr::V6(_) => self.v6_enable,
        }
    }
}

#[async_trait]
pub trait DnsResolver: Send + Sync {
    async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>>;
}

/// 走操作系统解析器
pub struct SystemResolver;

#[async_trait]
impl DnsResolver for SystemResolver {
    async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>> {
        let addrs: Vec<IpAddr> = tokio::net::lookup_host((host, 0))
            .await
            .map_err(|e| Error::DnsResolution(format!("{}: {}", host, e)))?
            .map(|sa| sa.ip())
            .collect();
        if addrs.is_empty() {
            return Err(Error::DnsResolution(format!("no addresses for {}", host)).into());
        }
        Ok(addrs)
    }
}

/// 解析并按地址族过滤，返回第一个可用地址。
pub async fn resolve_filtered(
    resolver: &dyn DnsResolver,
    host: &str,
    option: IpOption,
) -> Result<IpAddr> {
    let addrs = resolver.resolve(host).await?;
    addrs
        .into_iter()
        .find(|ip| option.allows(ip))
        .ok_or_else(|| anyhow::anyhow!("no usable address family for {}", host))
}
