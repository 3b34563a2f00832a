//! 设备侧的 "UDP socket" 桥接。
//!
//! WireGuard 设备以为自己在收发 UDP，这里用一个严格 FIFO 的有界
//! 队列喂给它：入站处理循环每解出一个外层数据报就压入一个槽位，
//! 设备工作循环从队列弹出解密。回程方向把密文写回 endpoint 上
//! 挂着的外部连接。

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Mutex, RwLock};

use crate::dns::{self, DnsResolver, IpOption};

/// 回程数据报的写出端：一次 write 对应一个数据报
pub type DatagramWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// 对端 endpoint。持有最近一次看到的外部连接写端；
/// 外层连接 EOF 后清掉，设备便不再使用它。
pub struct NetEndpoint {
    addr: SocketAddr,
    conn: RwLock<Option<Arc<Mutex<DatagramWriter>>>>,
}

impl NetEndpoint {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub async fn set_conn(&self, writer: DatagramWriter) {
        *self.conn.write().await = Some(Arc::new(Mutex::new(writer)));
    }

    pub async fn clear_conn(&self) {
        *self.conn.write().await = None;
    }

    pub async fn has_conn(&self) -> bool {
        self.conn.read().await.is_some()
    }
}

/// 队列元素：一个待解密的外层数据报和它来自的 endpoint。
pub struct BindPacket {
    pub data: Bytes,
    pub endpoint: Arc<NetEndpoint>,
}

pub struct NetBind {
    queue_tx: mpsc::Sender<BindPacket>,
    queue_rx: Mutex<mpsc::Receiver<BindPacket>>,
    dns: Arc<dyn DnsResolver>,
    ip_option: IpOption,
}

impl NetBind {
    pub fn new(capacity: usize, dns: Arc<dyn DnsResolver>, ip_option: IpOption) -> Self {
        let (queue_tx, queue_rx) = mpsc::channel(capacity.max(1));
        Self {
            queue_tx,
            queue_rx: Mutex::new(queue_rx),
            dns,
            ip_option,
        }
    }

    /// 解析对端地址文本为 endpoint。域名经平台 DNS 解析，
    /// 地址族按隧道栈能力过滤。
    pub async fn parse_endpoint(&self, raw: &str) -> Result<Arc<NetEndpoint>> {
        let addr = if let Ok(addr) = raw.parse::<SocketAddr>() {
            addr
        } else {
            let (host, port) = raw
                .rsplit_once(':')
                .ok_or_else(|| anyhow::anyhow!("invalid endpoint address: {}", raw))?;
            let port: u16 = port
                .parse()
                .map_err(|_| anyhow::anyhow!("invalid endpoint port: {}", raw))?;
            let ip = dns::resolve_filtered(self.dns.as_ref(), host, self.ip_option).await?;
            SocketAddr::new(ip, port)
        };
        Ok(Arc::new(NetEndpoint {
            addr,
            conn: RwLock::new(None),
        }))
    }

    /// 入站侧：压入一个外层数据报。队列满时挂起，submission 顺序
    /// 即出队顺序。
    pub async fn inject(&self, data: Bytes, endpoint: Arc<NetEndpoint>) -> Result<()> {
        self.queue_tx
            .send(BindPacket { data, endpoint })
            .await
            .map_err(|_| anyhow::anyhow!("bind queue closed"))
    }

    /// 设备侧：弹出下一个数据报。队列关闭返回 None。
    pub async fn receive(&self) -> Option<BindPacket> {
        self.queue_rx.lock().await.recv().await
    }

    /// 设备侧：把密文数据报发回 endpoint 当前挂着的连接。
    pub async fn send(&self, data: &[u8], endpoint: &NetEndpoint) -> Result<()> {
        let conn = endpoint.conn.read().await.clone();
        match conn {
            Some(writer) => {
                let mut writer = writer.lock().await;
                writer.write_all(data).await?;
                writer.flush().await?;
                Ok(())
            }
            None => anyhow::bail!("endpoint {} has no connection", endpoint.addr),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::SystemResolver;
    use async_trait::async_trait;
    use std::net::IpAddr;

    fn bind() -> NetBind {
        NetBind::new(
            16,
            Arc::new(SystemResolver),
            IpOption {
                v4_enable: true,
                v6_enable: true,
            },
        )
    }

    #[tokio::test]
    async fn parse_literal_endpoint() {
        let ep = bind().parse_endpoint("203.0.113.9:51820").await.unwrap();
        assert_eq!(ep.addr(), "203.0.113.9:51820".parse().unwrap());
        assert!(!ep.has_conn().await);
    }

    #[tokio::test]
    async fn parse_invalid_endpoint_fails() {
        assert!(bind().parse_endpoint("not-an-endpoint").await.is_err());
        assert!(bind().parse_endpoint("host:notaport").await.is_err());
    }

    struct FixedResolver(IpAddr);

    #[async_trait]
    impl DnsResolver for FixedResolver {
        async fn resolve(&self, _host: &str) -> Result<Vec<IpAddr>> {
            Ok(vec![self.0])
        }
    }

    #[tokio::test]
    async fn parse_domain_endpoint_resolves() {
        let bind = NetBind::new(
            16,
            Arc::new(FixedResolver("198.51.100.7".parse().unwrap())),
            IpOption {
                v4_enable: true,
                v6_enable: false,
            },
        );
        let ep = bind.parse_endpoint("wg.example.com:51820").await.unwrap();
        assert_eq!(ep.addr(), "198.51.100.7:51820".parse().unwrap());
    }

    #[tokio::test]
    async fn queue_is_fifo() {
        let bind = bind();
        let ep = bind.parse_endpoint("203.0.113.9:51820").await.unwrap();
        for i in 0u8..4 {
            bind.inject(Bytes::from(vec![i]), ep.clone()).await.unwrap();
        }
        for i in 0u8..4 {
            let packet = bind.receive().await.unwrap();
            assert_eq!(packet.data.as_ref(), &[i]);
        }
    }

    #[tokio::test]
    async fn send_without_conn_fails() {
        let bind = bind();
        let ep = bind.parse_endpoint("203.0.113.9:51820").await.unwrap();
        assert!(bind.send(b"ciphertext", &ep).await.is_err());
    }

    #[tokio::test]
    async fn send_goes_to_attached_conn() {
        let bind = bind();
        let ep = bind.parse_endpoint("203.0.113.9:51820").await.unwrap();
        let (client, mut server) = tokio::io::duplex(256);
        ep.set_conn(Box::new(client)).await;

        bind.send(b"ciphertext", &ep).await.unwrap();

        use tokio::io::AsyncReadExt;
        let mut buf = [0u8; 32];
        let n = server.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ciphertext");

        ep.clear_conn().await;
        assert!(bind.send(b"again", &ep).await.is_err());
    }
}
