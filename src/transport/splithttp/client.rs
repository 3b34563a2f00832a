//! 按 (目标, 流设置) 键控的 HTTP 客户端。
//!
//! 有 TLS 即走 HTTP/2（单连接多路复用 GET 与 POST），没有 TLS 走
//! 手写 HTTP/1.1（每个请求独立拨号）。进程级缓存表存在且每次拨号
//! 都写入，但命中查找保持停用：下载响应体从不读尽，复用连接
//! 是坏的。

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Mutex, OnceLock};
use std::sync::Arc;

use anyhow::{Context, Result};
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

use crate::common::buf::MultiBuffer;
use crate::common::ProxyStream;
use crate::config::types::TlsConfig;
use crate::transport::{dial_tcp, tls};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientKey {
    pub address: String,
    pub port: u16,
    pub authority: String,
    pub tls: bool,
    pub sni: Option<String>,
    pub fingerprint: Option<String>,
}

static CLIENT_CACHE: OnceLock<Mutex<HashMap<ClientKey, Arc<SplitHttpClient>>>> = OnceLock::new();

/// 为一次拨号取 HTTP 客户端。
///
/// 表只写不查，直到响应体被完整排干之前不能恢复复用。
pub async fn http_client(
    key: ClientKey,
    tls_config: Option<&TlsConfig>,
    connect_timeout: Option<u64>,
) -> Result<Arc<SplitHttpClient>> {
    let client = Arc::new(build_client(&key, tls_config, connect_timeout).await?);
    let cache = CLIENT_CACHE.get_or_init(|| Mutex::new(HashMap::new()));
    cache
        .lock()
        .unwrap()
        .insert(key, client.clone());
    Ok(client)
}

async fn build_client(
    key: &ClientKey,
    tls_config: Option<&TlsConfig>,
    connect_timeout: Option<u64>,
) -> Result<SplitHttpClient> {
    match tls_config {
        Some(tls_cfg) => {
            let client = H2Client::connect(key, tls_cfg, connect_timeout).await?;
            Ok(SplitHttpClient::H2(client))
        }
        None => Ok(SplitHttpClient::H1(H1Client {
            address: key.address.clone(),
            port: key.port,
            authority: key.authority.clone(),
            connect_timeout,
        })),
    }
}

pub enum SplitHttpClient {
    H2(H2Client),
    H1(H1Client),
}

/// 一次 GET 的结果：状态码、响应体、底层连接两端地址
pub struct DownloadResponse {
    pub status: u16,
    pub body: DownloadBody,
    pub local_addr: SocketAddr,
    pub remote_addr: SocketAddr,
}

impl SplitHttpClient {
    pub async fn get(
        &self,
        path_and_query: &str,
        headers: &HashMap<String, String>,
    ) -> Result<DownloadResponse> {
        match self {
            SplitHttpClient::H2(client) => client.get(path_and_query, headers).await,
            SplitHttpClient::H1(client) => client.get(path_and_query, headers).await,
        }
    }

    pub async fn post(
        &self,
        path_and_query: &str,
        headers: &HashMap<String, String>,
        body: MultiBuffer,
    ) -> Result<u16> {
        match self {
            SplitHttpClient::H2(client) => client.post(path_and_query, headers, body).await,
            SplitHttpClient::H1(client) => client.post(path_and_query, headers, body).await,
        }
    }
}

// ─── HTTP/2 over TLS ─────────────────────────────────────────────

pub struct H2Client {
    send_request: h2::client::SendRequest<Bytes>,
    authority: String,
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
}

impl H2Client {
    async fn connect(
        key: &ClientKey,
        tls_config: &TlsConfig,
        connect_timeout: Option<u64>,
    ) -> Result<Self> {
        let tcp = dial_tcp(&key.address, key.port, connect_timeout).await?;
        let local_addr = tcp.local_addr()?;
        let remote_addr = tcp.peer_addr()?;

        // SplitHTTP 的 TLS 分支强制 h2
        let stream = tls::client_handshake(tcp, tls_config, &key.address, Some(&["h2"])).await?;
        let stream: ProxyStream = Box::new(stream);

        let (send_request, connection) = h2::client::handshake(stream)
            .await
            .map_err(|e| anyhow::anyhow!("h2 handshake failed: {}", e))?;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                debug!(error = %e, "h2 connection terminated");
            }
        });

        Ok(Self {
            send_request,
            authority: key.authority.clone(),
            local_addr,
            remote_addr,
        })
    }

    fn build_request(
        &self,
        method: http::Method,
        path_and_query: &str,
        headers: &HashMap<String, String>,
    ) -> Result<http::Request<()>> {
        let uri = format!("https://{}{}", self.authority, path_and_query);
        let mut request = http::Request::builder()
            .method(method)
            .uri(uri)
            .version(http::Version::HTTP_2);
        for (name, value) in headers {
            if name.eq_ignore_ascii_case("host") {
                continue;
            }
            request = request.header(name.as_str(), value.as_str());
        }
        request
            .body(())
            .map_err(|e| anyhow::anyhow!("failed to build request: {}", e))
    }

    async fn get(
        &self,
        path_and_query: &str,
        headers: &HashMap<String, String>,
    ) -> Result<DownloadResponse> {
        let request = self.build_request(http::Method::GET, path_and_query, headers)?;
        let mut sender = self
            .send_request
            .clone()
            .ready()
            .await
            .map_err(|e| anyhow::anyhow!("h2 not ready: {}", e))?;
        let (response, _) = sender
            .send_request(request, true)
            .map_err(|e| anyhow::anyhow!("h2 send_request failed: {}", e))?;
        let response = response
            .await
            .map_err(|e| anyhow::anyhow!("h2 response failed: {}", e))?;
        let status = response.status().as_u16();
        let body = DownloadBody::H2 {
            recv: response.into_body(),
            buffer: BytesMut::new(),
        };
        Ok(DownloadResponse {
            status,
            body,
            local_addr: self.local_addr,
            remote_addr: self.remote_addr,
        })
    }

    async fn post(
        &self,
        path_and_query: &str,
        headers: &HashMap<String, String>,
        body: MultiBuffer,
    ) -> Result<u16> {
        let request = self.build_request(http::Method::POST, path_and_query, headers)?;
        let mut sender = self
            .send_request
            .clone()
            .ready()
            .await
            .map_err(|e| anyhow::anyhow!("h2 not ready: {}", e))?;
        let (response, mut send_stream) = sender
            .send_request(request, false)
            .map_err(|e| anyhow::anyhow!("h2 send_request failed: {}", e))?;

        if body.is_empty() {
            send_stream
                .send_data(Bytes::new(), true)
                .map_err(|e| anyhow::anyhow!("h2 send_data failed: {}", e))?;
        } else {
            let last = body.len() - 1;
            for (i, chunk) in body.into_iter().enumerate() {
                send_stream
                    .send_data(chunk, i == last)
                    .map_err(|e| anyhow::anyhow!("h2 send_data failed: {}", e))?;
            }
        }

        let response = response
            .await
            .map_err(|e| anyhow::anyhow!("h2 response failed: {}", e))?;
        Ok(response.status().as_u16())
    }
}

// ─── 明文 HTTP/1.1 ───────────────────────────────────────────────

pub struct H1Client {
    address: String,
    port: u16,
    authority: String,
    connect_timeout: Option<u64>,
}

impl H1Client {
    async fn get(
        &self,
        path_and_query: &str,
        headers: &HashMap<String, String>,
    ) -> Result<DownloadResponse> {
        let mut tcp = dial_tcp(&self.address, self.port, self.connect_timeout).await?;
        let local_addr = tcp.local_addr()?;
        let remote_addr = tcp.peer_addr()?;

        let request = build_h1_request("GET", path_and_query, &self.authority, headers, None);
        tcp.write_all(request.as_bytes()).await?;

        let status = read_h1_response_head(&mut tcp).await?;
        Ok(DownloadResponse {
            status,
            body: DownloadBody::H1 { stream: tcp },
            local_addr,
            remote_addr,
        })
    }

    async fn post(
        &self,
        path_and_query: &str,
        headers: &HashMap<String, String>,
        body: MultiBuffer,
    ) -> Result<u16> {
        // 每个 POST 独立拨号，不做连接复用
        let mut tcp = dial_tcp(&self.address, self.port, self.connect_timeout).await?;

        let content_length: usize = body.iter().map(|b| b.len()).sum();
        let request = build_h1_request(
            "POST",
            path_and_query,
            &self.authority,
            headers,
            Some(content_length),
        );
        tcp.write_all(request.as_bytes()).await?;
        for chunk in &body {
            tcp.write_all(chunk).await?;
        }
        tcp.flush().await?;

        read_h1_response_head(&mut tcp).await
    }
}

fn build_h1_request(
    method: &str,
    path_and_query: &str,
    authority: &str,
    headers: &HashMap<String, String>,
    content_length: Option<usize>,
) -> String {
    let mut request = format!(
        "{} {} HTTP/1.1\r\nHost: {}\r\n",
        method, path_and_query, authority
    );
    for (name, value) in headers {
        if name.eq_ignore_ascii_case("host") {
            continue;
        }
        request.push_str(&format!("{}: {}\r\n", name, value));
    }
    if let Some(length) = content_length {
        request.push_str(&format!("Content-Length: {}\r\nConnection: close\r\n", length));
    }
    request.push_str("\r\n");
    request
}

/// 读状态行并跳过响应头，返回状态码。
async fn read_h1_response_head(stream: &mut TcpStream) -> Result<u16> {
    let status_line = read_http_line(stream).await?;
    let status = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse::<u16>().ok())
        .ok_or_else(|| anyhow::anyhow!("invalid http response: {}", status_line.trim()))?;
    loop {
        let line = read_http_line(stream).await?;
        if line.trim().is_empty() {
            break;
        }
    }
    Ok(status)
}

/// 逐字节读一行（到 \n 为止），避免读过头吃掉响应体
async fn read_http_line(stream: &mut TcpStream) -> Result<String> {
    let mut line = Vec::with_capacity(128);
    loop {
        let mut byte = [0u8; 1];
        stream
            .read_exact(&mut byte)
            .await
            .context("failed to read http response")?;
        line.push(byte[0]);
        if byte[0] == b'\n' {
            break;
        }
        if line.len() > 8192 {
            anyhow::bail!("http response line too long");
        }
    }
    Ok(String::from_utf8_lossy(&line).to_string())
}

// ─── 下载体 ──────────────────────────────────────────────────────

/// 下载半边：h2 的 RecvStream 或明文分支的裸 TCP 流。
pub enum DownloadBody {
    H2 {
        recv: h2::RecvStream,
        buffer: BytesMut,
    },
    H1 {
        stream: TcpStream,
    },
}

impl tokio::io::AsyncRead for DownloadBody {
    fn poll_read(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        match &mut *self {
            DownloadBody::H2 { recv, buffer } => {
                // 先消费缓冲残留
                if !buffer.is_empty() {
                    let n = buffer.len().min(buf.remaining());
                    let data = buffer.split_to(n);
                    buf.put_slice(&data);
                    return std::task::Poll::Ready(Ok(()));
                }
                match recv.poll_data(cx) {
                    std::task::Poll::Ready(Some(Ok(data))) => {
                        let _ = recv.flow_control().release_capacity(data.len());
                        let n = data.len().min(buf.remaining());
                        buf.put_slice(&data[..n]);
                        if n < data.len() {
                            buffer.extend_from_slice(&data[n..]);
                        }
                        std::task::Poll::Ready(Ok(()))
                    }
                    std::task::Poll::Ready(Some(Err(e))) => {
                        std::task::Poll::Ready(Err(std::io::Error::other(e)))
                    }
                    std::task::Poll::Ready(None) => std::task::Poll::Ready(Ok(())),
                    std::task::Poll::Pending => std::task::Poll::Pending,
                }
            }
            DownloadBody::H1 { stream } => std::pin::Pin::new(stream).poll_read(cx, buf),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn h1_request_format() {
        let mut headers = HashMap::new();
        headers.insert("User-Agent".to_string(), "curl/8".to_string());
        headers.insert("Host".to_string(), "ignored.example".to_string());

        let req = build_h1_request("GET", "/tunnel?session=abc", "cdn.example.com", &headers, None);
        assert!(req.starts_with("GET /tunnel?session=abc HTTP/1.1\r\n"));
        assert!(req.contains("Host: cdn.example.com\r\n"));
        assert!(req.contains("User-Agent: curl/8\r\n"));
        // 配置里的 Host 头不能覆盖 authority
        assert!(!req.contains("ignored.example"));
        assert!(req.ends_with("\r\n\r\n"));

        let req = build_h1_request("POST", "/t?seq=0", "h", &HashMap::new(), Some(12));
        assert!(req.contains("Content-Length: 12\r\n"));
    }

    #[tokio::test]
    async fn h1_response_head_parsing() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            sock.write_all(b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\n\r\nbody")
                .await
                .unwrap();
        });

        let mut tcp = TcpStream::connect(addr).await.unwrap();
        let status = read_h1_response_head(&mut tcp).await.unwrap();
        assert_eq!(status, 200);

        // 响应体一个字节没被吃掉
        let mut body = [0u8; 4];
        tcp.read_exact(&mut body).await.unwrap();
        assert_eq!(&body, b"body");
    }

    #[tokio::test]
    async fn client_cache_is_write_only() {
        let key = ClientKey {
            address: "127.0.0.1".to_string(),
            port: 1,
            authority: "127.0.0.1:1".to_string(),
            tls: false,
            sni: None,
            fingerprint: None,
        };
        let first = http_client(key.clone(), None, Some(1)).await.unwrap();
        let second = http_client(key, None, Some(1)).await.unwrap();
        // 每次拨号都是新客户端，不从缓存取
        assert!(!Arc::ptr_eq(&first, &second));
    }
}
