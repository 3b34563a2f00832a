use std::sync::Arc;

use anyhow::Result;
use tracing::info;

use crate::common::ProxyStream;
use crate::proxy::Session;
use crate::router::Router;

use super::outbound_manager::OutboundManager;

/// 路由分发边界：由会话选出出站并建立到目标的连接。
///
/// 返回的流就是转发管道的 link，两个方向各取一半。
pub struct Dispatcher {
    router: Arc<Router>,
    outbound_manager: Arc<OutboundManager>,
}

impl Dispatcher {
    pub fn new(router: Arc<Router>, outbound_manager: Arc<OutboundManager>) -> Self {
        Self {
            router,
            outbound_manager,
        }
    }

    pub async fn dispatch_stream(&self, session: &Session) -> Result<ProxyStream> {
        let outbound_tag = self.router.route(session);

        let outbound = self
            .outbound_manager
            .get(outbound_tag)
            .ok_or_else(|| anyhow::anyhow!("outbound '{}' not found", outbound_tag))?;

        info!(
            dest = %session.target,
            network = %session.network,
            inbound = session.inbound_tag,
            outbound = outbound.tag(),
            "dispatching"
        );

        outbound.connect(session).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Address;
    use crate::config::types::{OutboundConfig, OutboundSettings, RouterConfig};
    use crate::proxy::Network;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn build_dispatcher() -> Dispatcher {
        let router = Arc::new(Router::new(&RouterConfig {
            rules: Vec::new(),
            default: "direct".to_string(),
        }));
        let manager = Arc::new(
            OutboundManager::new(&[OutboundConfig {
                tag: "direct".to_string(),
                protocol: "direct".to_string(),
                settings: OutboundSettings::default(),
            }])
            .unwrap(),
        );
        Dispatcher::new(router, manager)
    }

    #[tokio::test]
    async fn dispatch_tcp_to_loopback() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4];
            sock.read_exact(&mut buf).await.unwrap();
            sock.write_all(&buf).await.unwrap();
        });

        let dispatcher = build_dispatcher();
        let session = Session {
            target: Address::Ip(addr),
            source: None,
            inbound_tag: "test-in".to_string(),
            network: Network::Tcp,
        };
        let mut stream = dispatcher.dispatch_stream(&session).await.unwrap();
        stream.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test]
    async fn dispatch_unknown_outbound_fails() {
        let router = Arc::new(Router::new(&RouterConfig {
            rules: Vec::new(),
            default: "missing".to_string(),
        }));
        let manager = Arc::new(OutboundManager::new(&[]).unwrap());
        let dispatcher = Dispatcher::new(router, manager);
        let session = Session {
            target: Address::Ip("127.0.0.1:1".parse().unwrap()),
            source: None,
            inbound_tag: "test-in".to_string(),
            network: Network::Tcp,
        };
        assert!(dispatcher.dispatch_stream(&session).await.is_err());
    }
}
