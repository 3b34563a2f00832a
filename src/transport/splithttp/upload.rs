//! 上传泵：管道 → 编号 POST。
//!
//! 管道的批量读取把调用方的多次小写合并成一个大 POST，摊薄 HTTP
//! 开销；信号量把在飞 POST 数压在上限内。上传对客户端是
//! fire-and-forget 的：失败记日志后丢弃，重试由上层整条重拨。

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::common::pipe::PipeReader;

use super::client::SplitHttpClient;

pub(crate) fn spawn_uploader(
    client: Arc<SplitHttpClient>,
    reader: PipeReader,
    upload_path_prefix: String,
    headers: HashMap<String, String>,
    max_concurrent_uploads: u32,
) {
    tokio::spawn(async move {
        let gate = Arc::new(Semaphore::new(max_concurrent_uploads as usize));
        let mut seq: u64 = 0;

        loop {
            // 管道关闭即退出；在飞的 POST 自己跑完
            let chunk = match reader.read_multi_buffer().await {
                Ok(chunk) => chunk,
                Err(_) => break,
            };

            let permit = match gate.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };

            let path_and_query = format!("{}{}", upload_path_prefix, seq);
            seq += 1;

            let client = client.clone();
            let headers = headers.clone();
            tokio::spawn(async move {
                let _permit = permit;
                match client.post(&path_and_query, &headers, chunk).await {
                    Ok(200) => {}
                    Ok(status) => {
                        warn!(status = status, "failed to send upload, bad status code");
                    }
                    Err(e) => {
                        warn!(error = %e, "failed to send upload");
                    }
                }
            });
        }
        debug!("uploader drained, exiting");
    });
}
