use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use anyhow::Result;
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpStream, UdpSocket};
use tracing::debug;

use crate::common::ProxyStream;
use crate::proxy::{Network, OutboundHandler, Session};

pub struct DirectOutbound {
    tag: String,
}

impl DirectOutbound {
    pub fn new(tag: String) -> Self {
        Self { tag }
    }
}

#[async_trait]
impl OutboundHandler for DirectOutbound {
    fn tag(&self) -> &str {
        &self.tag
    }

    async fn connect(&self, session: &Session) -> Result<ProxyStream> {
        let addr = session.target.resolve().await?;
        match session.network {
            Network::Tcp => {
                debug!(target = %session.target, resolved = %addr, "direct connect");
                let stream = TcpStream::connect(addr).await?;
                Ok(Box::new(stream))
            }
            Network::Udp => {
                let bind = if addr.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
                let socket = UdpSocket::bind(bind).await?;
                socket.connect(addr).await?;
                debug!(target = %session.target, resolved = %addr, "direct UDP associate");
                Ok(Box::new(UdpStream {
                    socket: Arc::new(socket),
                }))
            }
        }
    }
}

/// 把已连接的 UDP socket 当作流使用：一次 read 对应一个数据报，
/// 一次 write 发送一个数据报。
struct UdpStream {
    socket: Arc<UdpSocket>,
}

impl AsyncRead for UdpStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        self.socket.poll_recv(cx, buf)
    }
}

impl AsyncWrite for UdpStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.socket.poll_send(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}
