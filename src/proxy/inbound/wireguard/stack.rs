//! Userspace TCP/IP stack for the WireGuard TUN.
//!
//! Bridges decrypted IP packets from the device to the proxy's stream
//! abstraction: reassembles guest TCP segments into ordered byte streams,
//! tracks UDP associations as datagram flows, and hands every new flow to
//! a forwarder callback in its own task so a slow dispatch never blocks
//! the packet loop.
//!
//! 转发器视角的一个反转值得强调：流标识里的 "local" 地址其实是
//! 客户端想访问的目的地址。[`FlowId::destination`] 把它固化下来。

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use crate::proxy::Network;

/// TCP 转发积压上限
pub const TCP_MAX_FLOWS: usize = 65535;
/// UDP 关联数上限
pub const UDP_MAX_FLOWS: usize = 2048;
/// UDP 流关闭后的滞留期：期间滞留的回程数据照常送达
pub const UDP_LINGER: Duration = Duration::from_secs(15);
/// 每条流的包队列深度
const FLOW_CHANNEL_SIZE: usize = 256;

const TCP_FLAG_FIN: u8 = 0x01;
const TCP_FLAG_SYN: u8 = 0x02;
const TCP_FLAG_RST: u8 = 0x04;
const TCP_FLAG_PSH: u8 = 0x08;
const TCP_FLAG_ACK: u8 = 0x10;

/// 流标识。`guest` 是隧道内客户端的源地址，`dialed` 是它拨号的
/// 目的地址（转发器视角下的 local endpoint）。
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq)]
pub struct FlowId {
    pub guest: SocketAddr,
    pub dialed: SocketAddr,
}

impl FlowId {
    /// 这条流应当被分发到的目的地址
    pub fn destination(&self) -> SocketAddr {
        self.dialed
    }
}

/// 新流回调：(目的地址, 网络类型, 流)
pub type FlowHandler = Arc<dyn Fn(SocketAddr, Network, FlowStream) + Send + Sync>;

/// 从栈里提出来的一条流，按 AsyncRead + AsyncWrite 使用。
/// TCP 流承载有序字节，UDP 流一次读写对应一个数据报。
pub struct FlowStream {
    rx: mpsc::Receiver<Vec<u8>>,
    tx: mpsc::Sender<Vec<u8>>,
    read_buf: Vec<u8>,
    read_pos: usize,
    read_closed: bool,
}

impl FlowStream {
    fn new(rx: mpsc::Receiver<Vec<u8>>, tx: mpsc::Sender<Vec<u8>>) -> Self {
        Self {
            rx,
            tx,
            read_buf: Vec::new(),
            read_pos: 0,
            read_closed: false,
        }
    }
}

impl tokio::io::AsyncRead for FlowStream {
    fn poll_read(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        // 先吐出上次没读完的残留
        if self.read_pos < self.read_buf.len() {
            let remaining = &self.read_buf[self.read_pos..];
            let to_copy = remaining.len().min(buf.remaining());
            buf.put_slice(&remaining[..to_copy]);
            self.read_pos += to_copy;
            if self.read_pos >= self.read_buf.len() {
                self.read_buf.clear();
                self.read_pos = 0;
            }
            return std::task::Poll::Ready(Ok(()));
        }

        if self.read_closed {
            return std::task::Poll::Ready(Ok(()));
        }

        match self.rx.poll_recv(cx) {
            std::task::Poll::Ready(Some(data)) => {
                if data.is_empty() {
                    // 空块是栈侧的 EOF 信号
                    self.read_closed = true;
                    return std::task::Poll::Ready(Ok(()));
                }
                let to_copy = data.len().min(buf.remaining());
                buf.put_slice(&data[..to_copy]);
                if to_copy < data.len() {
                    self.read_buf = data;
                    self.read_pos = to_copy;
                }
                std::task::Poll::Ready(Ok(()))
            }
            std::task::Poll::Ready(None) => {
                self.read_closed = true;
                std::task::Poll::Ready(Ok(()))
            }
            std::task::Poll::Pending => std::task::Poll::Pending,
        }
    }
}

impl tokio::io::AsyncWrite for FlowStream {
    fn poll_write(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<std::io::Result<usize>> {
        let data = buf.to_vec();
        let len = data.len();
        match self.tx.try_send(data) {
            Ok(()) => std::task::Poll::Ready(Ok(len)),
            Err(mpsc::error::TrySendError::Full(_)) => {
                cx.waker().wake_by_ref();
                std::task::Poll::Pending
            }
            Err(mpsc::error::TrySendError::Closed(_)) => std::task::Poll::Ready(Err(
                std::io::Error::new(std::io::ErrorKind::BrokenPipe, "flow closed"),
            )),
        }
    }

    fn poll_flush(
        self: std::pin::Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn poll_shutdown(
        self: std::pin::Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        let _ = self.tx.try_send(Vec::new());
        std::task::Poll::Ready(Ok(()))
    }
}

/// 虚拟网卡参数：隧道内地址决定了栈的地址族能力。
#[derive(Debug, Clone)]
pub struct NetStackConfig {
    pub addresses: Vec<ipnet::IpNet>,
    pub mtu: u16,
    pub max_tcp_flows: usize,
    pub max_udp_flows: usize,
    pub udp_linger: Duration,
}

impl NetStackConfig {
    pub fn new(addresses: Vec<ipnet::IpNet>, mtu: u16) -> Self {
        Self {
            addresses,
            mtu,
            max_tcp_flows: TCP_MAX_FLOWS,
            max_udp_flows: UDP_MAX_FLOWS,
            udp_linger: UDP_LINGER,
        }
    }
}

#[derive(Debug)]
struct TcpState {
    /// 对端（guest）下一个期望序号，即我们的 ACK 值
    guest_next: u32,
    /// 我们下一个要发出的序号
    our_next: u32,
    fin_received: bool,
}

#[derive(Clone)]
struct TcpFlowEntry {
    to_stream: mpsc::Sender<Vec<u8>>,
    state: Arc<Mutex<TcpState>>,
}

#[derive(Clone)]
struct UdpFlowEntry {
    to_stream: mpsc::Sender<Vec<u8>>,
}

pub struct NetStack {
    config: NetStackConfig,
    handler: FlowHandler,
    outbound: mpsc::Sender<Vec<u8>>,
    tcp_flows: Mutex<HashMap<FlowId, TcpFlowEntry>>,
    udp_flows: Mutex<HashMap<FlowId, UdpFlowEntry>>,
    active_tcp: AtomicUsize,
    active_udp: AtomicUsize,
}

impl NetStack {
    /// 创建栈；返回的接收端吐出发往 guest 的 IP 包（待加密）。
    pub fn new(config: NetStackConfig, handler: FlowHandler) -> (Arc<Self>, mpsc::Receiver<Vec<u8>>) {
        let (outbound_tx, outbound_rx) = mpsc::channel(1024);
        (
            Arc::new(Self {
                config,
                handler,
                outbound: outbound_tx,
                tcp_flows: Mutex::new(HashMap::new()),
                udp_flows: Mutex::new(HashMap::new()),
                active_tcp: AtomicUsize::new(0),
                active_udp: AtomicUsize::new(0),
            }),
            outbound_rx,
        )
    }

    pub fn has_v4(&self) -> bool {
        self.config.addresses.iter().any(|n| matches!(n, ipnet::IpNet::V4(_)))
    }

    pub fn has_v6(&self) -> bool {
        self.config.addresses.iter().any(|n| matches!(n, ipnet::IpNet::V6(_)))
    }

    pub fn active_tcp_count(&self) -> usize {
        self.active_tcp.load(Ordering::Relaxed)
    }

    pub fn active_udp_count(&self) -> usize {
        self.active_udp.load(Ordering::Relaxed)
    }

    /// 注入一个来自设备的明文 IP 包。
    pub async fn inject(self: &Arc<Self>, packet: &[u8]) {
        let parsed = match parse_ip_packet(packet) {
            Ok(p) => p,
            Err(e) => {
                debug!(error = %e, "failed to parse tunneled packet");
                return;
            }
        };

        match parsed.protocol {
            TransportProtocol::Tcp => self.handle_tcp_segment(&parsed, packet).await,
            TransportProtocol::Udp => self.handle_udp_datagram(&parsed, packet).await,
            TransportProtocol::Other(proto) => {
                debug!(protocol = proto, "unsupported tunneled protocol, dropping");
            }
        }
    }

    async fn send_packet(&self, packet: Vec<u8>) {
        if self.outbound.send(packet).await.is_err() {
            debug!("stack outbound channel closed");
        }
    }

    async fn handle_tcp_segment(self: &Arc<Self>, parsed: &ParsedPacket, raw: &[u8]) {
        let guest = SocketAddr::new(parsed.src_ip, parsed.src_port);
        let dialed = SocketAddr::new(parsed.dst_ip, parsed.dst_port);
        let key = FlowId { guest, dialed };

        let tcp_off = parsed.payload_offset;
        if raw.len() < tcp_off + 20 {
            return;
        }
        let flags = raw[tcp_off + 13];
        let syn = flags & TCP_FLAG_SYN != 0;
        let fin = flags & TCP_FLAG_FIN != 0;
        let rst = flags & TCP_FLAG_RST != 0;

        let seq = u32::from_be_bytes([
            raw[tcp_off + 4],
            raw[tcp_off + 5],
            raw[tcp_off + 6],
            raw[tcp_off + 7],
        ]);

        let data_offset = ((raw[tcp_off + 12] >> 4) as usize) * 4;
        let payload_start = tcp_off + data_offset;
        let payload: &[u8] = if raw.len() > payload_start {
            &raw[payload_start..]
        } else {
            &[]
        };

        let existing = { self.tcp_flows.lock().await.get(&key).cloned() };
        if let Some(entry) = existing {
            if rst {
                let _ = entry.to_stream.send(Vec::new()).await;
                self.remove_tcp_flow(&key).await;
                return;
            }

            let mut state = entry.state.lock().await;

            if !payload.is_empty() {
                if seq == state.guest_next {
                    state.guest_next = state.guest_next.wrapping_add(payload.len() as u32);
                    let _ = entry.to_stream.send(payload.to_vec()).await;
                }
                // 乱序或重传一律回 ACK 当前期望值
                let ack = build_tcp_packet(
                    dialed,
                    guest,
                    state.our_next,
                    state.guest_next,
                    TCP_FLAG_ACK,
                    &[],
                );
                if let Ok(pkt) = ack {
                    self.send_packet(pkt).await;
                }
            }

            if fin && !state.fin_received {
                state.fin_received = true;
                state.guest_next = state.guest_next.wrapping_add(1);
                let ack = build_tcp_packet(
                    dialed,
                    guest,
                    state.our_next,
                    state.guest_next,
                    TCP_FLAG_ACK,
                    &[],
                );
                if let Ok(pkt) = ack {
                    self.send_packet(pkt).await;
                }
                // EOF 交给转发管道
                let _ = entry.to_stream.send(Vec::new()).await;
            }
            return;
        }

        if !syn {
            // 未知流的纯 ACK / FIN 忽略；带数据的段回 RST
            if !payload.is_empty() && !rst {
                if let Ok(pkt) = build_tcp_packet(dialed, guest, 0, seq, TCP_FLAG_RST, &[]) {
                    self.send_packet(pkt).await;
                }
            }
            return;
        }

        // 新连接：相当于转发器的 endpoint 创建，失败即回 RST
        if self.active_tcp_count() >= self.config.max_tcp_flows {
            warn!(guest = %guest, dialed = %dialed, "tcp flow table full, resetting");
            let ack = seq.wrapping_add(1);
            if let Ok(pkt) = build_tcp_packet(dialed, guest, 0, ack, TCP_FLAG_RST | TCP_FLAG_ACK, &[]) {
                self.send_packet(pkt).await;
            }
            return;
        }

        let (stack_tx, stream_rx) = mpsc::channel::<Vec<u8>>(FLOW_CHANNEL_SIZE);
        let (stream_tx, mut stack_rx) = mpsc::channel::<Vec<u8>>(FLOW_CHANNEL_SIZE);
        let stream = FlowStream::new(stream_rx, stream_tx);

        let isn: u32 = rand::random();
        let state = Arc::new(Mutex::new(TcpState {
            guest_next: seq.wrapping_add(1),
            our_next: isn.wrapping_add(1),
            fin_received: false,
        }));

        // 三次握手：SYN-ACK，guest 的最终 ACK 会作为未知纯 ACK 被忽略
        {
            let st = state.lock().await;
            if let Ok(pkt) = build_tcp_packet(
                dialed,
                guest,
                isn,
                st.guest_next,
                TCP_FLAG_SYN | TCP_FLAG_ACK,
                &[],
            ) {
                self.send_packet(pkt).await;
            }
        }

        self.tcp_flows.lock().await.insert(
            key,
            TcpFlowEntry {
                to_stream: stack_tx,
                state: state.clone(),
            },
        );
        self.active_tcp.fetch_add(1, Ordering::Relaxed);

        debug!(guest = %guest, dest = %dialed, "new tcp flow accepted");

        // 回程写泵：流写端 → 数据段；写端关闭后发 FIN 收尾
        let this = Arc::clone(self);
        let writer_state = state;
        tokio::spawn(async move {
            while let Some(data) = stack_rx.recv().await {
                if data.is_empty() {
                    break;
                }
                for chunk in data.chunks(this.config.mtu as usize - 40) {
                    let mut st = writer_state.lock().await;
                    let pkt = build_tcp_packet(
                        dialed,
                        guest,
                        st.our_next,
                        st.guest_next,
                        TCP_FLAG_PSH | TCP_FLAG_ACK,
                        chunk,
                    );
                    st.our_next = st.our_next.wrapping_add(chunk.len() as u32);
                    drop(st);
                    match pkt {
                        Ok(pkt) => this.send_packet(pkt).await,
                        Err(e) => {
                            debug!(error = %e, "tcp reply build failed");
                            break;
                        }
                    }
                }
            }
            let mut st = writer_state.lock().await;
            let fin = build_tcp_packet(
                dialed,
                guest,
                st.our_next,
                st.guest_next,
                TCP_FLAG_FIN | TCP_FLAG_ACK,
                &[],
            );
            st.our_next = st.our_next.wrapping_add(1);
            drop(st);
            if let Ok(pkt) = fin {
                this.send_packet(pkt).await;
            }
            this.remove_tcp_flow(&key).await;
        });

        (self.handler)(key.destination(), Network::Tcp, stream);
    }

    async fn remove_tcp_flow(&self, key: &FlowId) {
        if self.tcp_flows.lock().await.remove(key).is_some() {
            self.active_tcp.fetch_sub(1, Ordering::Relaxed);
        }
    }

    async fn handle_udp_datagram(self: &Arc<Self>, parsed: &ParsedPacket, raw: &[u8]) {
        let guest = SocketAddr::new(parsed.src_ip, parsed.src_port);
        let dialed = SocketAddr::new(parsed.dst_ip, parsed.dst_port);
        let key = FlowId { guest, dialed };

        let udp_off = parsed.payload_offset;
        if raw.len() < udp_off + 8 {
            return;
        }
        let declared = u16::from_be_bytes([raw[udp_off + 4], raw[udp_off + 5]]) as usize;
        if declared < 8 {
            return;
        }
        let available = raw.len() - udp_off;
        let payload = &raw[udp_off + 8..udp_off + declared.min(available)];
        if payload.is_empty() {
            return;
        }

        let existing = { self.udp_flows.lock().await.get(&key).cloned() };
        if let Some(entry) = existing {
            // 队列满则按数据报语义丢弃
            let _ = entry.to_stream.try_send(payload.to_vec());
            return;
        }

        if self.active_udp_count() >= self.config.max_udp_flows {
            warn!(guest = %guest, dialed = %dialed, "udp flow table full, dropping");
            return;
        }

        let (stack_tx, stream_rx) = mpsc::channel::<Vec<u8>>(FLOW_CHANNEL_SIZE);
        let (stream_tx, mut stack_rx) = mpsc::channel::<Vec<u8>>(FLOW_CHANNEL_SIZE);
        let stream = FlowStream::new(stream_rx, stream_tx);

        let _ = stack_tx.try_send(payload.to_vec());
        self.udp_flows.lock().await.insert(
            key,
            UdpFlowEntry {
                to_stream: stack_tx,
            },
        );
        self.active_udp.fetch_add(1, Ordering::Relaxed);

        debug!(guest = %guest, dest = %dialed, "new udp flow accepted");

        // 回程写泵。流关闭后先把滞留的回程包发完，再滞留 linger
        // 时间才释放关联。
        let this = Arc::clone(self);
        let linger = this.config.udp_linger;
        tokio::spawn(async move {
            while let Some(data) = stack_rx.recv().await {
                if data.is_empty() {
                    break;
                }
                match build_udp_packet(dialed, guest, &data) {
                    Ok(pkt) => this.send_packet(pkt).await,
                    Err(e) => {
                        debug!(error = %e, "udp reply build failed");
                    }
                }
            }
            tokio::time::sleep(linger).await;
            if this.udp_flows.lock().await.remove(&key).is_some() {
                this.active_udp.fetch_sub(1, Ordering::Relaxed);
            }
        });

        (self.handler)(key.destination(), Network::Udp, stream);
    }
}

// ─── IP 包解析与构造 ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportProtocol {
    Tcp,
    Udp,
    Other(u8),
}

#[derive(Debug, Clone)]
pub struct ParsedPacket {
    pub src_ip: IpAddr,
    pub dst_ip: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
    pub protocol: TransportProtocol,
    /// 传输层头在原始包里的偏移
    pub payload_offset: usize,
}

pub fn parse_ip_packet(packet: &[u8]) -> Result<ParsedPacket> {
    if packet.is_empty() {
        anyhow::bail!("empty packet");
    }
    match packet[0] >> 4 {
        4 => parse_ipv4(packet),
        6 => parse_ipv6(packet),
        other => anyhow::bail!("unsupported ip version: {}", other),
    }
}

fn parse_ipv4(packet: &[u8]) -> Result<ParsedPacket> {
    if packet.len() < 20 {
        anyhow::bail!("packet too short for ipv4 header");
    }
    let ihl = ((packet[0] & 0x0F) as usize) * 4;
    if ihl < 20 || packet.len() < ihl + 4 {
        anyhow::bail!("invalid ipv4 header length");
    }
    let protocol = match packet[9] {
        6 => TransportProtocol::Tcp,
        17 => TransportProtocol::Udp,
        other => TransportProtocol::Other(other),
    };
    let src_ip = Ipv4Addr::new(packet[12], packet[13], packet[14], packet[15]);
    let dst_ip = Ipv4Addr::new(packet[16], packet[17], packet[18], packet[19]);
    let src_port = u16::from_be_bytes([packet[ihl], packet[ihl + 1]]);
    let dst_port = u16::from_be_bytes([packet[ihl + 2], packet[ihl + 3]]);
    Ok(ParsedPacket {
        src_ip: IpAddr::V4(src_ip),
        dst_ip: IpAddr::V4(dst_ip),
        src_port,
        dst_port,
        protocol,
        payload_offset: ihl,
    })
}

fn parse_ipv6(packet: &[u8]) -> Result<ParsedPacket> {
    if packet.len() < 44 {
        anyhow::bail!("packet too short for ipv6 header");
    }
    // 不解析扩展头；隧道流量里它们极罕见
    let protocol = match packet[6] {
        6 => TransportProtocol::Tcp,
        17 => TransportProtocol::Udp,
        other => TransportProtocol::Other(other),
    };
    let mut src = [0u8; 16];
    src.copy_from_slice(&packet[8..24]);
    let mut dst = [0u8; 16];
    dst.copy_from_slice(&packet[24..40]);
    let src_port = u16::from_be_bytes([packet[40], packet[41]]);
    let dst_port = u16::from_be_bytes([packet[42], packet[43]]);
    Ok(ParsedPacket {
        src_ip: IpAddr::V6(Ipv6Addr::from(src)),
        dst_ip: IpAddr::V6(Ipv6Addr::from(dst)),
        src_port,
        dst_port,
        protocol,
        payload_offset: 40,
    })
}

pub fn build_tcp_packet(
    src: SocketAddr,
    dst: SocketAddr,
    seq: u32,
    ack: u32,
    flags: u8,
    payload: &[u8],
) -> Result<Vec<u8>> {
    let mut tcp = vec![0u8; 20 + payload.len()];
    tcp[0..2].copy_from_slice(&src.port().to_be_bytes());
    tcp[2..4].copy_from_slice(&dst.port().to_be_bytes());
    tcp[4..8].copy_from_slice(&seq.to_be_bytes());
    tcp[8..12].copy_from_slice(&ack.to_be_bytes());
    tcp[12] = 5 << 4;
    tcp[13] = flags;
    tcp[14..16].copy_from_slice(&65535u16.to_be_bytes());
    tcp[20..].copy_from_slice(payload);

    wrap_ip(src, dst, 6, tcp)
}

pub fn build_udp_packet(src: SocketAddr, dst: SocketAddr, payload: &[u8]) -> Result<Vec<u8>> {
    let udp_len = 8 + payload.len();
    if udp_len > u16::MAX as usize {
        anyhow::bail!("udp payload too large: {} bytes", payload.len());
    }
    let mut udp = vec![0u8; udp_len];
    udp[0..2].copy_from_slice(&src.port().to_be_bytes());
    udp[2..4].copy_from_slice(&dst.port().to_be_bytes());
    udp[4..6].copy_from_slice(&(udp_len as u16).to_be_bytes());
    udp[8..].copy_from_slice(payload);

    wrap_ip(src, dst, 17, udp)
}

/// 给传输层段包上 IP 头并填校验和
fn wrap_ip(src: SocketAddr, dst: SocketAddr, proto: u8, mut segment: Vec<u8>) -> Result<Vec<u8>> {
    match (src.ip(), dst.ip()) {
        (IpAddr::V4(src_ip), IpAddr::V4(dst_ip)) => {
            let total_len = 20 + segment.len();
            if total_len > u16::MAX as usize {
                anyhow::bail!("packet too large: {} bytes", total_len);
            }
            let csum = transport_checksum_v4(src_ip, dst_ip, proto, &segment);
            patch_transport_checksum(proto, &mut segment, csum);

            let mut packet = vec![0u8; total_len];
            packet[0] = 0x45;
            packet[2..4].copy_from_slice(&(total_len as u16).to_be_bytes());
            packet[8] = 64;
            packet[9] = proto;
            packet[12..16].copy_from_slice(&src_ip.octets());
            packet[16..20].copy_from_slice(&dst_ip.octets());
            let header_csum = ipv4_header_checksum(&packet[..20]);
            packet[10..12].copy_from_slice(&header_csum.to_be_bytes());
            packet[20..].copy_from_slice(&segment);
            Ok(packet)
        }
        (IpAddr::V6(src_ip), IpAddr::V6(dst_ip)) => {
            if segment.len() > u16::MAX as usize {
                anyhow::bail!("packet too large: {} bytes", segment.len());
            }
            let csum = transport_checksum_v6(src_ip, dst_ip, proto, &segment);
            patch_transport_checksum(proto, &mut segment, csum);

            let mut packet = vec![0u8; 40 + segment.len()];
            packet[0] = 0x60;
            packet[4..6].copy_from_slice(&(segment.len() as u16).to_be_bytes());
            packet[6] = proto;
            packet[7] = 64;
            packet[8..24].copy_from_slice(&src_ip.octets());
            packet[24..40].copy_from_slice(&dst_ip.octets());
            packet[40..].copy_from_slice(&segment);
            Ok(packet)
        }
        _ => anyhow::bail!("mixed address families in one flow"),
    }
}

fn patch_transport_checksum(proto: u8, segment: &mut [u8], csum: u16) {
    let offset = match proto {
        6 => 16,
        17 => 6,
        _ => return,
    };
    segment[offset..offset + 2].copy_from_slice(&csum.to_be_bytes());
}

fn ipv4_header_checksum(header: &[u8]) -> u16 {
    let mut sum = 0u32;
    let mut i = 0;
    while i + 1 < header.len() {
        if i == 10 {
            i += 2;
            continue;
        }
        sum = sum.wrapping_add(u16::from_be_bytes([header[i], header[i + 1]]) as u32);
        i += 2;
    }
    fold_checksum(sum)
}

fn transport_checksum_v4(src: Ipv4Addr, dst: Ipv4Addr, proto: u8, segment: &[u8]) -> u16 {
    let mut sum = 0u32;
    for chunk in src.octets().chunks(2).chain(dst.octets().chunks(2)) {
        sum = sum.wrapping_add(u16::from_be_bytes([chunk[0], chunk[1]]) as u32);
    }
    sum = sum.wrapping_add(proto as u32);
    sum = sum.wrapping_add(segment.len() as u32);
    sum_segment(sum, segment)
}

fn transport_checksum_v6(src: Ipv6Addr, dst: Ipv6Addr, proto: u8, segment: &[u8]) -> u16 {
    let mut sum = 0u32;
    for chunk in src.octets().chunks(2).chain(dst.octets().chunks(2)) {
        sum = sum.wrapping_add(u16::from_be_bytes([chunk[0], chunk[1]]) as u32);
    }
    sum = sum.wrapping_add(segment.len() as u32);
    sum = sum.wrapping_add(proto as u32);
    sum_segment(sum, segment)
}

fn sum_segment(mut sum: u32, segment: &[u8]) -> u16 {
    let mut i = 0;
    while i + 1 < segment.len() {
        sum = sum.wrapping_add(u16::from_be_bytes([segment[i], segment[i + 1]]) as u32);
        i += 2;
    }
    if i < segment.len() {
        sum = sum.wrapping_add((segment[i] as u32) << 8);
    }
    fold_checksum(sum)
}

fn fold_checksum(mut sum: u32) -> u16 {
    while (sum >> 16) != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}
