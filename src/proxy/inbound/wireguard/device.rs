//! 驱动 boringtun 噪声设备。
//!
//! 三个长驻循环：bind 队列 → 解密 → 注入栈；栈回程包 → 按
//! allowed-ips 选 peer → 加密 → 写回 endpoint；定时器滴答驱动
//! 握手重试与 keepalive。握手与加解密全部委托给 boringtun。

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use boringtun::noise::{Tunn, TunnResult};
use boringtun::x25519::{PublicKey, StaticSecret};
use ipnet::IpNet;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::types::WireGuardPeerConfig;

use super::bind::{BindPacket, NetBind};
use super::stack::NetStack;

/// 解密缓冲区；密文最多比明文多一个封装开销
const PACKET_BUF_SIZE: usize = 65535 + 64;
/// 定时器滴答间隔
const TIMER_TICK: Duration = Duration::from_millis(250);

pub fn parse_base64_key(raw: &str) -> Result<[u8; 32]> {
    use base64::Engine;
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(raw.trim())
        .map_err(|e| anyhow::anyhow!("invalid base64 key: {}", e))?;
    bytes
        .try_into()
        .map_err(|_| anyhow::anyhow!("key must be exactly 32 bytes"))
}

pub struct WgPeer {
    tunn: Mutex<Tunn>,
    allowed_ips: Vec<IpNet>,
    endpoint: RwLock<Option<Arc<super::bind::NetEndpoint>>>,
}

impl WgPeer {
    async fn set_endpoint(&self, endpoint: Arc<super::bind::NetEndpoint>) {
        *self.endpoint.write().await = Some(endpoint);
    }

    async fn current_endpoint(&self) -> Option<Arc<super::bind::NetEndpoint>> {
        self.endpoint.read().await.clone()
    }
}

pub struct WgDevice {
    peers: Vec<Arc<WgPeer>>,
    bind: Arc<NetBind>,
    stack: Arc<NetStack>,
}

enum Decapsulated {
    /// keepalive 或握手内部状态更新，无输出
    Consumed,
    /// 回给对端的握手/keepalive 报文
    Network(Vec<Vec<u8>>),
    /// 解出的明文 IP 包
    Tunnel(Vec<u8>),
    /// 不是这个 peer 的流量
    NotMine,
}

impl WgDevice {
    pub fn new(
        private_key: &str,
        peer_configs: &[WireGuardPeerConfig],
        bind: Arc<NetBind>,
        stack: Arc<NetStack>,
    ) -> Result<Arc<Self>> {
        let secret = StaticSecret::from(parse_base64_key(private_key)?);

        let mut peers = Vec::with_capacity(peer_configs.len());
        for (index, pc) in peer_configs.iter().enumerate() {
            let public_key = PublicKey::from(parse_base64_key(&pc.public_key)?);
            let preshared_key = pc
                .preshared_key
                .as_deref()
                .map(parse_base64_key)
                .transpose()?;

            let tunn = Tunn::new(
                secret.clone(),
                public_key,
                preshared_key,
                pc.keepalive,
                index as u32,
                None,
            )
            .map_err(|e| anyhow::anyhow!("failed to create wireguard tunnel: {}", e))?;

            let allowed_ips: Vec<IpNet> = pc
                .allowed_ips
                .iter()
                .filter_map(|s| s.parse().ok())
                .collect();

            peers.push(Arc::new(WgPeer {
                tunn: Mutex::new(tunn),
                allowed_ips,
                endpoint: RwLock::new(None),
            }));
        }

        if peers.is_empty() {
            anyhow::bail!("wireguard device requires at least one peer");
        }

        Ok(Arc::new(Self { peers, bind, stack }))
    }

    /// 启动设备循环。`outbound_rx` 是栈的回程包出口。
    pub fn start(
        self: &Arc<Self>,
        mut outbound_rx: mpsc::Receiver<Vec<u8>>,
        cancel: CancellationToken,
    ) {
        let device = Arc::clone(self);
        let recv_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = recv_cancel.cancelled() => break,
                    packet = device.bind.receive() => {
                        match packet {
                            Some(packet) => device.process_incoming(packet).await,
                            None => break,
                        }
                    }
                }
            }
        });

        let device = Arc::clone(self);
        let send_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = send_cancel.cancelled() => break,
                    packet = outbound_rx.recv() => {
                        match packet {
                            Some(packet) => device.process_outgoing(&packet).await,
                            None => break,
                        }
                    }
                }
            }
        });

        let device = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(TIMER_TICK);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => device.tick_timers().await,
                }
            }
        });
    }

    async fn process_incoming(&self, packet: BindPacket) {
        let mut dst = vec![0u8; PACKET_BUF_SIZE];
        for peer in &self.peers {
            let step = {
                let mut tunn = peer.tunn.lock().await;
                match tunn.decapsulate(None, &packet.data, &mut dst) {
                    TunnResult::Done => Decapsulated::Consumed,
                    TunnResult::Err(e) => {
                        debug!(error = ?e, "decapsulate rejected, trying next peer");
                        Decapsulated::NotMine
                    }
                    TunnResult::WriteToNetwork(first) => {
                        let mut out = vec![first.to_vec()];
                        // 握手后冲掉排队的报文
                        loop {
                            match tunn.decapsulate(None, &[], &mut dst) {
                                TunnResult::WriteToNetwork(more) => out.push(more.to_vec()),
                                _ => break,
                            }
                        }
                        Decapsulated::Network(out)
                    }
                    TunnResult::WriteToTunnelV4(plain, _) => Decapsulated::Tunnel(plain.to_vec()),
                    TunnResult::WriteToTunnelV6(plain, _) => Decapsulated::Tunnel(plain.to_vec()),
                }
            };

            match step {
                Decapsulated::NotMine => continue,
                Decapsulated::Consumed => {
                    peer.set_endpoint(packet.endpoint).await;
                    return;
                }
                Decapsulated::Network(frames) => {
                    peer.set_endpoint(packet.endpoint.clone()).await;
                    for frame in frames {
                        if let Err(e) = self.bind.send(&frame, &packet.endpoint).await {
                            debug!(error = %e, "bind send failed");
                        }
                    }
                    return;
                }
                Decapsulated::Tunnel(plain) => {
                    peer.set_endpoint(packet.endpoint).await;
                    self.stack.inject(&plain).await;
                    return;
                }
            }
        }
        debug!(from = %packet.endpoint.addr(), "datagram matched no peer, dropping");
    }

    async fn process_outgoing(&self, ip_packet: &[u8]) {
        let Some(dst_ip) = packet_dst_ip(ip_packet) else {
            debug!("outgoing packet has no parseable destination, dropping");
            return;
        };
        let Some(peer) = self.select_peer(&dst_ip) else {
            debug!(dst = %dst_ip, "no peer allows destination, dropping");
            return;
        };
        let Some(endpoint) = peer.current_endpoint().await else {
            debug!(dst = %dst_ip, "peer has no live endpoint, dropping");
            return;
        };

        let mut dst = vec![0u8; PACKET_BUF_SIZE];
        let frame = {
            let mut tunn = peer.tunn.lock().await;
            match tunn.encapsulate(ip_packet, &mut dst) {
                TunnResult::WriteToNetwork(b) => Some(b.to_vec()),
                TunnResult::Done => None,
                TunnResult::Err(e) => {
                    warn!(error = ?e, "encapsulate failed");
                    None
                }
                _ => None,
            }
        };
        if let Some(frame) = frame {
            if let Err(e) = self.bind.send(&frame, &endpoint).await {
                debug!(error = %e, "bind send failed");
            }
        }
    }

    async fn tick_timers(&self) {
        let mut dst = vec![0u8; PACKET_BUF_SIZE];
        for peer in &self.peers {
            let frame = {
                let mut tunn = peer.tunn.lock().await;
                match tunn.update_timers(&mut dst) {
                    TunnResult::WriteToNetwork(b) => Some(b.to_vec()),
                    TunnResult::Err(e) => {
                        debug!(error = ?e, "timer update");
                        None
                    }
                    _ => None,
                }
            };
            if let Some(frame) = frame {
                if let Some(endpoint) = peer.current_endpoint().await {
                    if let Err(e) = self.bind.send(&frame, &endpoint).await {
                        debug!(error = %e, "bind send failed");
                    }
                }
            }
        }
    }

    /// 按 allowed-ips 最长前缀匹配选 peer；没有命中时退回第一个
    fn select_peer(&self, target: &IpAddr) -> Option<&Arc<WgPeer>> {
        let mut best: Option<(&Arc<WgPeer>, u8)> = None;
        for peer in &self.peers {
            for net in &peer.allowed_ips {
                if net.contains(target) {
                    let prefix = net.prefix_len();
                    if best.is_none() || prefix > best.unwrap().1 {
                        best = Some((peer, prefix));
                    }
                }
            }
        }
        best.map(|(p, _)| p).or_else(|| self.peers.first())
    }
}

/// 提取 IP 包的目的地址（v4 / v6）
fn packet_dst_ip(packet: &[u8]) -> Option<IpAddr> {
    if packet.is_empty() {
        return None;
    }
    match packet[0] >> 4 {
        4 if packet.len() >= 20 => {
            Some(IpAddr::from([packet[16], packet[17], packet[18], packet[19]]))
        }
        6 if packet.len() >= 40 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&packet[24..40]);
            Some(IpAddr::from(octets))
        }
        _ => None,
    }
}
