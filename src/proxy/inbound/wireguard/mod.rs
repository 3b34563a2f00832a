//! WireGuard 入站：在进程内的用户态 TUN 上终结 WireGuard。
//!
//! 外部连接送来的每个数据报经 bind 队列进设备解密，明文 IP 包落进
//! 用户态协议栈；栈拦截到的 TCP/UDP 流被重新注入路由分发器，受
//! 每连接的空闲超时监督。

pub mod bind;
pub mod device;
pub mod stack;

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use anyhow::{Context as _, Result};
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::app::dispatcher::Dispatcher;
use crate::app::policy::PolicyManager;
use crate::common::ProxyStream;
use crate::config::types::InboundConfig;
use crate::dns::{DnsResolver, IpOption};
use crate::proxy::relay::{forward_flow, FlowContext};
use crate::proxy::Network;

use bind::NetBind;
use device::WgDevice;
use stack::{FlowHandler, NetStack, NetStackConfig};

/// 单个外层数据报的读缓冲
const DATAGRAM_BUF_SIZE: usize = 65536;
/// num_workers 换算成 bind 队列深度的系数
const QUEUE_DEPTH_PER_WORKER: usize = 64;

/// 每次 Process 调用捕获一次的路由信息，这个设备孵化的所有流共享。
#[derive(Clone)]
struct RoutingInfo {
    dispatcher: Arc<Dispatcher>,
    inbound_tag: String,
}

pub struct WireGuardInbound {
    tag: String,
    bind: Arc<NetBind>,
    #[allow(dead_code)]
    device: Arc<WgDevice>,
    info: Arc<RwLock<Option<RoutingInfo>>>,
    cancel: CancellationToken,
}

impl WireGuardInbound {
    pub fn new(
        config: &InboundConfig,
        policy: Arc<PolicyManager>,
        dns: Arc<dyn DnsResolver>,
    ) -> Result<Arc<Self>> {
        let settings = &config.settings;
        let private_key = settings
            .private_key
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("wireguard inbound missing private_key"))?;

        let addresses: Vec<ipnet::IpNet> = settings
            .address
            .iter()
            .map(|s| {
                s.parse::<ipnet::IpNet>()
                    .or_else(|_| s.parse::<std::net::IpAddr>().map(ipnet::IpNet::from))
                    .map_err(|_| anyhow::anyhow!("invalid tunnel address: {}", s))
            })
            .collect::<Result<_>>()?;

        let info: Arc<RwLock<Option<RoutingInfo>>> = Arc::new(RwLock::new(None));
        let policy_level0 = policy.for_level(0);

        // 栈转发器回调：每条流独立成任务，慢分发不会阻塞别的流
        let handler_info = info.clone();
        let tag = config.tag.clone();
        let handler: FlowHandler = Arc::new(move |dest, network, flow| {
            let info = handler_info.clone();
            let tag = tag.clone();
            tokio::spawn(async move {
                let Some(routing) = info.read().await.clone() else {
                    debug!(dest = %dest, "flow before first datagram, dropping");
                    return;
                };
                let ctx = FlowContext {
                    dispatcher: routing.dispatcher,
                    policy: policy_level0,
                    inbound_tag: tag,
                };
                forward_flow(ctx, dest, network, Box::new(flow) as ProxyStream).await;
            });
        });

        let (net_stack, outbound_rx) = NetStack::new(
            NetStackConfig::new(addresses, settings.normalized_mtu()),
            handler,
        );

        let ip_option = IpOption {
            v4_enable: net_stack.has_v4(),
            v6_enable: net_stack.has_v6(),
        };
        let queue_depth = settings.num_workers.unwrap_or(4).max(1) * QUEUE_DEPTH_PER_WORKER;
        let net_bind = Arc::new(NetBind::new(queue_depth, dns, ip_option));

        let device = WgDevice::new(private_key, &settings.peers, net_bind.clone(), net_stack)
            .context("failed to bring wireguard device up")?;

        let cancel = CancellationToken::new();
        device.start(outbound_rx, cancel.clone());

        info!(
            tag = config.tag,
            peers = settings.peers.len(),
            mtu = settings.normalized_mtu(),
            "wireguard inbound up"
        );

        Ok(Arc::new(Self {
            tag: config.tag.clone(),
            bind: net_bind,
            device,
            info,
            cancel,
        }))
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// 这个入站只声明 UDP
    pub fn network(&self) -> &'static [Network] {
        &[Network::Udp]
    }

    /// 处理一条承载 WireGuard 数据报的外部连接。
    ///
    /// 一次 read 对应一个数据报。EOF 时解绑 endpoint 上的连接并
    /// 正常返回；孵化出去的流不跟随本连接的生命周期。
    pub async fn process(
        &self,
        conn: ProxyStream,
        remote: SocketAddr,
        dispatcher: Arc<Dispatcher>,
    ) -> Result<()> {
        *self.info.write().await = Some(RoutingInfo {
            dispatcher,
            inbound_tag: self.tag.clone(),
        });

        let endpoint = self.bind.parse_endpoint(&remote.to_string()).await?;
        let (mut reader, writer) = tokio::io::split(conn);
        endpoint.set_conn(Box::new(writer)).await;

        let mut buf = vec![0u8; DATAGRAM_BUF_SIZE];
        loop {
            let n = match reader.read(&mut buf).await {
                Ok(0) => {
                    endpoint.clear_conn().await;
                    return Ok(());
                }
                Ok(n) => n,
                Err(e) => {
                    endpoint.clear_conn().await;
                    return Err(e.into());
                }
            };
            self.bind
                .inject(Bytes::copy_from_slice(&buf[..n]), endpoint.clone())
                .await?;
        }
    }

    /// 裸 UDP 引导：按来源地址把数据报拆成连接，逐个交给
    /// [`process`](Self::process)。
    pub async fn serve(
        self: Arc<Self>,
        socket: UdpSocket,
        dispatcher: Arc<Dispatcher>,
    ) -> Result<()> {
        let socket = Arc::new(socket);
        let mut conns: HashMap<SocketAddr, mpsc::Sender<Bytes>> = HashMap::new();
        let mut buf = vec![0u8; DATAGRAM_BUF_SIZE];

        info!(tag = self.tag, addr = %socket.local_addr()?, "wireguard inbound listening");

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                result = socket.recv_from(&mut buf) => {
                    let (n, peer) = result?;
                    let payload = Bytes::copy_from_slice(&buf[..n]);
                    if let Some(tx) = conns.get(&peer) {
                        if tx.send(payload).await.is_ok() {
                            continue;
                        }
                        conns.remove(&peer);
                        continue;
                    }

                    let (tx, rx) = mpsc::channel(64);
                    let conn = DatagramConn {
                        rx,
                        socket: socket.clone(),
                        peer,
                    };
                    let _ = tx.send(payload).await;
                    conns.insert(peer, tx);

                    let server = self.clone();
                    let dispatcher = dispatcher.clone();
                    tokio::spawn(async move {
                        if let Err(e) = server.process(Box::new(conn), peer, dispatcher).await {
                            debug!(error = %e, peer = %peer, "wireguard process ended");
                        }
                    });
                }
            }
        }
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

/// 把共享 UDP socket 上某个来源的数据报序列当作一条连接：
/// 读出队列里的数据报，写回即 send_to 对端。
struct DatagramConn {
    rx: mpsc::Receiver<Bytes>,
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
}

impl AsyncRead for DatagramConn {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(data)) => {
                let n = data.len().min(buf.remaining());
                buf.put_slice(&data[..n]);
                Poll::Ready(Ok(()))
            }
            Poll::Ready(None) => Poll::Ready(Ok(())),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl AsyncWrite for DatagramConn {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let peer = self.peer;
        self.socket.poll_send_to(cx, buf, peer)
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}
