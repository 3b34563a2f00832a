//! 转发管道：双向拷贝 + 活动驱动取消。
//!
//! 每搬运一块数据就重整一次计时器；一侧收尾后切换到更紧的
//! 半关闭超时。计时器到期即整条流终止，这不是错误路径。

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;
use tracing::{debug, error, info};

use crate::app::dispatcher::Dispatcher;
use crate::app::policy::Policy;
use crate::common::{Address, ProxyStream};
use crate::proxy::{Network, Session};

const COPY_BUF_SIZE: usize = 32 * 1024;

/// 活动计时器：每次数据搬运调用 [`update`](Self::update) 推后
/// 截止时间；超时时长可以在运行中切换。
pub struct ActivityTimer {
    last: Mutex<Instant>,
    timeout: Mutex<Duration>,
}

impl ActivityTimer {
    pub fn new(timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            last: Mutex::new(Instant::now()),
            timeout: Mutex::new(timeout),
        })
    }

    pub fn update(&self) {
        *self.last.lock().unwrap() = Instant::now();
    }

    /// 切换超时时长，同时视作一次活动
    pub fn set_timeout(&self, timeout: Duration) {
        *self.timeout.lock().unwrap() = timeout;
        self.update();
    }

    fn deadline(&self) -> Instant {
        *self.last.lock().unwrap() + *self.timeout.lock().unwrap()
    }

    /// 挂起直到截止时间且期间无新活动
    pub async fn expired(&self) {
        loop {
            let deadline = self.deadline();
            if Instant::now() >= deadline {
                return;
            }
            tokio::time::sleep_until(deadline).await;
        }
    }
}

async fn copy_with_activity<R, W>(
    reader: &mut R,
    writer: &mut W,
    timer: &ActivityTimer,
) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; COPY_BUF_SIZE];
    let mut total = 0u64;
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(total);
        }
        writer.write_all(&buf[..n]).await?;
        timer.update();
        total += n as u64;
    }
}

/// 转发流水线的运行环境。
///
/// 刻意不持有任何来自入站数据报连接的取消信号：承载 WG 数据报的
/// 外层连接断开不应拖垮同一设备上其它对端孵化出来的流，流的存活
/// 只由活动计时器决定。
#[derive(Clone)]
pub struct FlowContext {
    pub dispatcher: Arc<Dispatcher>,
    pub policy: Policy,
    pub inbound_tag: String,
}

/// 把栈转发器交出的一条流接入路由分发器并双向搬运。
pub async fn forward_flow(ctx: FlowContext, dest: SocketAddr, network: Network, conn: ProxyStream) {
    let timeouts = ctx.policy.timeouts;
    let timer = ActivityTimer::new(timeouts.connection_idle);

    info!(from = "0.0.0.0:0", to = %dest, network = %network, "connection accepted");

    let session = Session {
        target: Address::Ip(dest),
        source: None,
        inbound_tag: ctx.inbound_tag.clone(),
        network,
    };

    let outbound = match ctx.dispatcher.dispatch_stream(&session).await {
        Ok(stream) => stream,
        Err(e) => {
            error!(error = %e, dest = %dest, "dispatch connection");
            return;
        }
    };

    let (mut conn_read, mut conn_write) = tokio::io::split(conn);
    let (mut out_read, mut out_write) = tokio::io::split(outbound);

    let request_timer = timer.clone();
    let request = async {
        let copied = copy_with_activity(&mut conn_read, &mut out_write, &request_timer).await;
        request_timer.set_timeout(timeouts.downlink_only);
        let _ = out_write.shutdown().await;
        copied.map_err(|e| io::Error::new(e.kind(), format!("failed to transport request: {}", e)))
    };

    let response_timer = timer.clone();
    let response = async {
        let copied = copy_with_activity(&mut out_read, &mut conn_write, &response_timer).await;
        response_timer.set_timeout(timeouts.uplink_only);
        let _ = conn_write.shutdown().await;
        copied.map_err(|e| io::Error::new(e.kind(), format!("failed to transport response: {}", e)))
    };

    tokio::select! {
        result = async { tokio::try_join!(request, response) } => {
            match result {
                Ok((up, down)) => {
                    debug!(dest = %dest, up = up, down = down, "connection ends");
                }
                Err(e) => {
                    debug!(dest = %dest, error = %e, "connection ends");
                }
            }
        }
        _ = timer.expired() => {
            debug!(dest = %dest, "connection idle, closing");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn activity_timer_expires_without_activity() {
        let timer = ActivityTimer::new(Duration::from_millis(30));
        let start = Instant::now();
        timer.expired().await;
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[tokio::test]
    async fn activity_timer_rearmed_by_updates() {
        let timer = ActivityTimer::new(Duration::from_millis(80));
        let ticker = timer.clone();
        let feeder = tokio::spawn(async move {
            for _ in 0..5 {
                tokio::time::sleep(Duration::from_millis(20)).await;
                ticker.update();
            }
        });
        let start = Instant::now();
        timer.expired().await;
        // 5 次活动把截止时间推到 ~100ms + 80ms 之后
        assert!(start.elapsed() >= Duration::from_millis(150));
        feeder.await.unwrap();
    }

    #[tokio::test]
    async fn timeout_switch_takes_effect() {
        let timer = ActivityTimer::new(Duration::from_secs(60));
        timer.set_timeout(Duration::from_millis(30));
        let start = Instant::now();
        timer.expired().await;
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn copy_updates_timer_and_reports_bytes() {
        let (mut tx, rx) = duplex(256);
        let (sink_in, mut sink_out) = duplex(256);

        let timer = ActivityTimer::new(Duration::from_secs(60));
        let timer_for_copy = timer.clone();
        let copier = tokio::spawn(async move {
            let (mut r, _) = tokio::io::split(rx);
            let (_, mut w) = tokio::io::split(sink_in);
            copy_with_activity(&mut r, &mut w, &timer_for_copy).await
        });

        use tokio::io::AsyncWriteExt;
        tx.write_all(b"0123456789").await.unwrap();
        tx.shutdown().await.unwrap();

        let mut out = Vec::new();
        sink_out.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"0123456789");
        assert_eq!(copier.await.unwrap().unwrap(), 10);
    }
}
