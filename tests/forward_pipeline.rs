//! 转发管道的集成测试：分发、半关闭与活动超时。

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::Mutex;

use wirebound::app::dispatcher::Dispatcher;
use wirebound::app::outbound_manager::OutboundManager;
use wirebound::app::policy::PolicyManager;
use wirebound::common::ProxyStream;
use wirebound::config::types::{OutboundConfig, OutboundSettings, PolicyConfig, RouterConfig};
use wirebound::proxy::relay::{forward_flow, FlowContext};
use wirebound::proxy::{Network, OutboundHandler, Session};
use wirebound::router::Router;

/// 每次 connect 交出预先准备的 duplex 一端
struct StubOutbound {
    streams: Mutex<Vec<DuplexStream>>,
}

#[async_trait]
impl OutboundHandler for StubOutbound {
    fn tag(&self) -> &str {
        "stub"
    }

    async fn connect(&self, _session: &Session) -> Result<ProxyStream> {
        let stream = self
            .streams
            .lock()
            .await
            .pop()
            .ok_or_else(|| anyhow::anyhow!("no stub stream left"))?;
        Ok(Box::new(stream))
    }
}

fn flow_context(outbound_stream: DuplexStream, policy: &PolicyConfig) -> FlowContext {
    let router = Arc::new(Router::new(&RouterConfig {
        rules: Vec::new(),
        default: "stub".to_string(),
    }));
    let mut manager = OutboundManager::new(&[]).unwrap();
    manager.insert(Arc::new(StubOutbound {
        streams: Mutex::new(vec![outbound_stream]),
    }));
    let dispatcher = Arc::new(Dispatcher::new(router, Arc::new(manager)));
    FlowContext {
        dispatcher,
        policy: PolicyManager::new(policy).for_level(0),
        inbound_tag: "test-in".to_string(),
    }
}

fn default_policy() -> PolicyConfig {
    PolicyConfig {
        connection_idle: 300,
        uplink_only: 2,
        downlink_only: 5,
    }
}

#[tokio::test]
async fn forwards_both_directions_until_close() -> Result<()> {
    let (guest_side, conn) = duplex(1024);
    let (outbound_local, outbound_remote) = duplex(1024);

    let ctx = flow_context(outbound_local, &default_policy());
    let flow = tokio::spawn(forward_flow(
        ctx,
        "10.0.0.1:80".parse().unwrap(),
        Network::Tcp,
        Box::new(conn),
    ));

    // 远端：回显然后关闭
    let echo = tokio::spawn(async move {
        let (mut r, mut w) = tokio::io::split(outbound_remote);
        let mut buf = vec![0u8; 64];
        loop {
            let n = r.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            w.write_all(&buf[..n]).await.unwrap();
        }
        w.shutdown().await.unwrap();
    });

    let (mut guest_read, mut guest_write) = tokio::io::split(guest_side);
    guest_write.write_all(b"request-bytes").await?;
    guest_write.shutdown().await?;

    let mut out = Vec::new();
    guest_read.read_to_end(&mut out).await?;
    assert_eq!(out, b"request-bytes");

    tokio::time::timeout(Duration::from_secs(5), flow).await??;
    echo.await?;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn idle_flow_is_cancelled_after_connection_idle() {
    let (_guest_side, conn) = duplex(64);
    let (outbound_local, _outbound_remote) = duplex(64);

    let policy = PolicyConfig {
        connection_idle: 3,
        uplink_only: 1,
        downlink_only: 1,
    };
    let ctx = flow_context(outbound_local, &policy);

    let started = tokio::time::Instant::now();
    forward_flow(
        ctx,
        "10.0.0.1:80".parse().unwrap(),
        Network::Tcp,
        Box::new(conn),
    )
    .await;

    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(3));
    assert!(elapsed < Duration::from_secs(10));
}

#[tokio::test(start_paused = true)]
async fn half_closed_flow_uses_downlink_timeout() {
    let (guest_side, conn) = duplex(64);
    let (outbound_local, outbound_remote) = duplex(64);

    let policy = PolicyConfig {
        connection_idle: 300,
        uplink_only: 1,
        downlink_only: 4,
    };
    let ctx = flow_context(outbound_local, &policy);

    let started = tokio::time::Instant::now();
    let flow = tokio::spawn(forward_flow(
        ctx,
        "10.0.0.1:80".parse().unwrap(),
        Network::Tcp,
        Box::new(conn),
    ));

    // 请求半边收尾：guest 关写，远端一直不响应
    let (_guest_read, mut guest_write) = tokio::io::split(guest_side);
    guest_write.write_all(b"ping").await.unwrap();
    guest_write.shutdown().await.unwrap();

    // 远端读掉请求但既不回也不关
    let keeper = tokio::spawn(async move {
        let (mut r, w) = tokio::io::split(outbound_remote);
        let mut buf = vec![0u8; 16];
        let _ = r.read(&mut buf).await;
        // 挂住写端
        std::future::pending::<()>().await;
        drop(w);
    });

    flow.await.unwrap();
    let elapsed = started.elapsed();
    // 流在 downlink_only 窗口内结束，而不是等满 connection_idle
    assert!(elapsed >= Duration::from_secs(4));
    assert!(elapsed < Duration::from_secs(60));
    keeper.abort();
}

#[tokio::test]
async fn dispatch_failure_ends_flow_immediately() {
    let router = Arc::new(Router::new(&RouterConfig {
        rules: Vec::new(),
        default: "missing".to_string(),
    }));
    let dispatcher = Arc::new(Dispatcher::new(
        router,
        Arc::new(OutboundManager::new(&[OutboundConfig {
            tag: "direct".to_string(),
            protocol: "direct".to_string(),
            settings: OutboundSettings::default(),
        }])
        .unwrap()),
    ));
    let ctx = FlowContext {
        dispatcher,
        policy: PolicyManager::new(&default_policy()).for_level(0),
        inbound_tag: "test-in".to_string(),
    };

    let (_guest_side, conn) = duplex(64);
    // 分发失败必须立刻返回，而不是抱着死链路空转
    tokio::time::timeout(
        Duration::from_secs(2),
        forward_flow(ctx, "10.0.0.1:80".parse().unwrap(), Network::Tcp, Box::new(conn)),
    )
    .await
    .expect("flow should end immediately on dispatch failure");
}
