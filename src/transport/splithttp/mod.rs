//! SplitHTTP 出站传输。
//!
//! 在纯 HTTP 上模拟一条双向流：下载半边是一个长命 GET 响应体，
//! 上传半边是一串带序号的短 POST。上传先落进有界管道做批量与
//! 背压，再由上传泵在并发门限内发出。
//!
//! 会话由 128 位 UUID 标识，挂在每个请求的 `session` 查询参数上；
//! 上传序号从 0 起单调递增，服务端按 `seq` 重排，网络上的到达
//! 顺序没有保证。

pub mod client;
pub mod upload;

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use anyhow::Result;
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};
use tracing::debug;
use uuid::Uuid;

use crate::common::pipe::{self, PipeWriter};
use crate::common::{Error, ProxyStream};
use crate::config::types::{TlsConfig, TransportConfig};

use client::{ClientKey, DownloadBody};
use upload::spawn_uploader;

/// 下载流开头的 "ok" 应答标记长度。语义未见文档，照原样丢弃；
/// 若服务端合法地发出更短的体，这个探针会误读流载荷。
const RESPONSE_OK_PROBE_LEN: usize = 2;

pub struct SplitHttpTransport {
    server_addr: String,
    server_port: u16,
    config: TransportConfig,
    tls: Option<TlsConfig>,
}

impl SplitHttpTransport {
    pub fn new(
        server_addr: String,
        server_port: u16,
        config: TransportConfig,
        tls: Option<TlsConfig>,
    ) -> Self {
        let tls = tls.filter(|t| t.enabled);
        Self {
            server_addr,
            server_port,
            config,
            tls,
        }
    }

    pub async fn dial(&self) -> Result<SplitConn> {
        debug!(
            server = self.server_addr,
            port = self.server_port,
            "dialing splithttp"
        );

        // authority 优先取配置的 Host，否则退回目标的 host:port
        let authority = match self.config.host.as_deref() {
            Some(host) if !host.is_empty() => host.to_string(),
            _ => format!("{}:{}", self.server_addr, self.server_port),
        };
        let path = self.config.normalized_path();
        let headers = self.config.headers.clone();

        let key = ClientKey {
            address: self.server_addr.clone(),
            port: self.server_port,
            authority,
            tls: self.tls.is_some(),
            sni: self.tls.as_ref().and_then(|t| t.sni.clone()),
            fingerprint: self.tls.as_ref().and_then(|t| t.fingerprint.clone()),
        };
        let http_client =
            client::http_client(key, self.tls.as_ref(), self.config.connect_timeout).await?;

        let session_id = Uuid::new_v4().to_string();

        let download = http_client
            .get(&format!("{}?session={}", path, session_id), &headers)
            .await?;
        if download.status != 200 {
            return Err(Error::Protocol(format!(
                "invalid status code on download: {}",
                download.status
            ))
            .into());
        }

        let mut body = download.body;
        let mut probe = [0u8; RESPONSE_OK_PROBE_LEN];
        body.read_exact(&mut probe)
            .await
            .map_err(|_| Error::Protocol("failed to read initial response".to_string()))?;

        let (pipe_reader, pipe_writer) = pipe::new(self.config.normalized_max_upload_size());
        spawn_uploader(
            http_client,
            pipe_reader,
            format!("{}?session={}&seq=", path, session_id),
            headers,
            self.config.normalized_max_concurrent_uploads(),
        );

        Ok(SplitConn {
            reader: body,
            writer: pipe_writer,
            write_fut: None,
            local_addr: download.local_addr,
            remote_addr: download.remote_addr,
        })
    }
}

#[async_trait]
impl crate::transport::StreamTransport for SplitHttpTransport {
    async fn connect(&self) -> Result<ProxyStream> {
        let conn = self.dial().await?;
        Ok(Box::new(conn))
    }
}

type WriteFut = Pin<Box<dyn Future<Output = io::Result<usize>> + Send>>;

/// 返回给调用方的全双工端点。
///
/// 写方向进管道（每次写立即可见，保证延迟有界），读方向就是
/// 活着的下载响应体。两端地址取自下载连接拨号时的捕获。
pub struct SplitConn {
    reader: DownloadBody,
    writer: PipeWriter,
    write_fut: Option<WriteFut>,
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
}

impl SplitConn {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }
}

impl std::fmt::Debug for SplitConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SplitConn")
            .field("local_addr", &self.local_addr)
            .field("remote_addr", &self.remote_addr)
            .finish()
    }
}

impl AsyncRead for SplitConn {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.reader).poll_read(cx, buf)
    }
}

impl tokio::io::AsyncWrite for SplitConn {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let writer = this.writer.clone();
        let fut = this.write_fut.get_or_insert_with(|| {
            let data = buf.to_vec();
            Box::pin(async move { writer.write(&data).await })
        });
        match fut.as_mut().poll(cx) {
            Poll::Ready(result) => {
                this.write_fut = None;
                Poll::Ready(result)
            }
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // 管道写入对上传泵立即可见
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // 关管道 → 上传泵取完余量后退出，在飞的 POST 跑完
        self.writer.close();
        Poll::Ready(Ok(()))
    }
}

impl Drop for SplitConn {
    fn drop(&mut self) {
        self.writer.close();
    }
}
