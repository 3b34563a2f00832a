pub mod fingerprint;
pub mod splithttp;
pub mod tls;

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::net::TcpStream;

use crate::common::ProxyStream;
use crate::config::types::{TlsConfig, TransportConfig};

/// 传输层抽象 trait
///
/// 负责建立到远端服务器的底层通道（TCP / TLS / SplitHTTP 等），
/// 上层协议在这条通道上收发。
#[async_trait]
pub trait StreamTransport: Send + Sync {
    async fn connect(&self) -> Result<ProxyStream>;
}

/// 根据配置构建传输层实例
pub fn build_transport(
    server_addr: &str,
    server_port: u16,
    transport_config: &TransportConfig,
    tls_config: Option<&TlsConfig>,
) -> Result<Box<dyn StreamTransport>> {
    match transport_config.transport_type.as_str() {
        "splithttp" | "xhttp" => {
            let transport = splithttp::SplitHttpTransport::new(
                server_addr.to_string(),
                server_port,
                transport_config.clone(),
                tls_config.cloned(),
            );
            Ok(Box::new(transport))
        }
        "tcp" | "" => {
            let transport = TcpTransport {
                server_addr: server_addr.to_string(),
                server_port,
                connect_timeout: transport_config.connect_timeout,
                tls: tls_config.cloned(),
            };
            Ok(Box::new(transport))
        }
        other => anyhow::bail!("unsupported transport type: {}", other),
    }
}

/// 建立 TCP 连接的辅助函数，各传输共用，保证拨号参数一致。
pub(crate) async fn dial_tcp(
    host: &str,
    port: u16,
    connect_timeout: Option<u64>,
) -> Result<TcpStream> {
    let timeout = Duration::from_secs(connect_timeout.unwrap_or(10));
    let addr = format!("{}:{}", host, port);
    let stream = tokio::time::timeout(timeout, TcpStream::connect(&addr))
        .await
        .map_err(|_| anyhow::anyhow!("connect timeout to {}", addr))??;
    stream.set_nodelay(true)?;
    Ok(stream)
}

/// 裸 TCP（可选 TLS）传输
struct TcpTransport {
    server_addr: String,
    server_port: u16,
    connect_timeout: Option<u64>,
    tls: Option<TlsConfig>,
}

#[async_trait]
impl StreamTransport for TcpTransport {
    async fn connect(&self) -> Result<ProxyStream> {
        let tcp = dial_tcp(&self.server_addr, self.server_port, self.connect_timeout).await?;
        match &self.tls {
            Some(tls_cfg) if tls_cfg.enabled => {
                let stream = tls::client_handshake(tcp, tls_cfg, &self.server_addr, None).await?;
                Ok(Box::new(stream))
            }
            _ => Ok(Box::new(tcp)),
        }
    }
}
