//! 有界多缓冲区管道。
//!
//! 写端把每次写入切块后追加到内部队列；队列字节数达到上限后
//! 写入挂起（背压）。读端一次取走队列里累积的全部块，多次小写
//! 自然合并成一次大的批量读取。

use std::io;
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

use super::buf::{self, MultiBuffer};

struct State {
    chunks: MultiBuffer,
    buffered: usize,
    write_closed: bool,
    read_closed: bool,
}

struct Shared {
    state: Mutex<State>,
    size_limit: usize,
    readable: Notify,
    writable: Notify,
}

/// 创建一个字节数上限为 `size_limit` 的管道。
pub fn new(size_limit: usize) -> (PipeReader, PipeWriter) {
    let shared = Arc::new(Shared {
        state: Mutex::new(State {
            chunks: Vec::new(),
            buffered: 0,
            write_closed: false,
            read_closed: false,
        }),
        size_limit,
        readable: Notify::new(),
        writable: Notify::new(),
    });
    (
        PipeReader {
            shared: shared.clone(),
        },
        PipeWriter { shared },
    )
}

#[derive(Clone)]
pub struct PipeWriter {
    shared: Arc<Shared>,
}

impl PipeWriter {
    /// 写入一段字节。队列满时挂起直到读端取走数据。
    pub async fn write(&self, data: &[u8]) -> io::Result<usize> {
        if data.is_empty() {
            return Ok(0);
        }
        loop {
            {
                let mut state = self.shared.state.lock().unwrap();
                if state.read_closed || state.write_closed {
                    return Err(io::Error::new(io::ErrorKind::BrokenPipe, "pipe closed"));
                }
                if state.buffered < self.shared.size_limit {
                    let mut chunks = buf::split_chunks(data);
                    state.buffered += data.len();
                    state.chunks.append(&mut chunks);
                    drop(state);
                    self.shared.readable.notify_one();
                    return Ok(data.len());
                }
            }
            self.shared.writable.notified().await;
        }
    }

    /// 写入已经成块的数据，保留块边界。
    pub async fn write_multi_buffer(&self, mb: MultiBuffer) -> io::Result<()> {
        let len = buf::total_len(&mb);
        if len == 0 {
            return Ok(());
        }
        loop {
            {
                let mut state = self.shared.state.lock().unwrap();
                if state.read_closed || state.write_closed {
                    return Err(io::Error::new(io::ErrorKind::BrokenPipe, "pipe closed"));
                }
                if state.buffered < self.shared.size_limit {
                    state.buffered += len;
                    state.chunks.extend(mb);
                    drop(state);
                    self.shared.readable.notify_one();
                    return Ok(());
                }
            }
            self.shared.writable.notified().await;
        }
    }

    /// 关闭写端。读端取完剩余数据后收到 EOF。
    pub fn close(&self) {
        let mut state = self.shared.state.lock().unwrap();
        state.write_closed = true;
        drop(state);
        self.shared.readable.notify_one();
        self.shared.writable.notify_waiters();
    }
}

pub struct PipeReader {
    shared: Arc<Shared>,
}

impl PipeReader {
    /// 取走当前累积的全部块。队列为空时挂起；写端关闭且
    /// 数据取尽后返回 `UnexpectedEof`。
    pub async fn read_multi_buffer(&self) -> io::Result<MultiBuffer> {
        loop {
            {
                let mut state = self.shared.state.lock().unwrap();
                if !state.chunks.is_empty() {
                    let mb = std::mem::take(&mut state.chunks);
                    state.buffered = 0;
                    drop(state);
                    self.shared.writable.notify_one();
                    return Ok(mb);
                }
                if state.write_closed {
                    return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "pipe closed"));
                }
                if state.read_closed {
                    return Err(io::Error::new(io::ErrorKind::BrokenPipe, "pipe closed"));
                }
            }
            self.shared.readable.notified().await;
        }
    }

    /// 关闭读端，后续写入立即失败。
    pub fn close(&self) {
        let mut state = self.shared.state.lock().unwrap();
        state.read_closed = true;
        drop(state);
        self.shared.writable.notify_waiters();
        self.shared.readable.notify_one();
    }
}

impl Drop for PipeReader {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn small_writes_batch_into_one_read() {
        let (reader, writer) = new(1024);
        writer.write(b"abc").await.unwrap();
        writer.write(b"def").await.unwrap();

        let mb = reader.read_multi_buffer().await.unwrap();
        assert_eq!(mb.len(), 2);
        assert_eq!(buf::concat(&mb), b"abcdef");
    }

    #[tokio::test]
    async fn write_blocks_when_full() {
        let (reader, writer) = new(4);
        writer.write(b"1234").await.unwrap();

        // 队列已满，下一次写必须等读端排空
        let pending = writer.write(b"5678");
        tokio::pin!(pending);
        assert!(
            tokio::time::timeout(Duration::from_millis(50), pending.as_mut())
                .await
                .is_err()
        );

        let mb = reader.read_multi_buffer().await.unwrap();
        assert_eq!(buf::concat(&mb), b"1234");

        pending.await.unwrap();
        let mb = reader.read_multi_buffer().await.unwrap();
        assert_eq!(buf::concat(&mb), b"5678");
    }

    #[tokio::test]
    async fn close_write_drains_then_eof() {
        let (reader, writer) = new(1024);
        writer.write(b"tail").await.unwrap();
        writer.close();

        let mb = reader.read_multi_buffer().await.unwrap();
        assert_eq!(buf::concat(&mb), b"tail");

        let err = reader.read_multi_buffer().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn close_read_fails_writer() {
        let (reader, writer) = new(1024);
        reader.close();
        let err = writer.write(b"x").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }

    #[tokio::test]
    async fn chunk_boundaries_preserved() {
        let (reader, writer) = new(usize::MAX);
        let big = vec![7u8; buf::BUF_SIZE + 1];
        writer.write(&big).await.unwrap();
        let mb = reader.read_multi_buffer().await.unwrap();
        assert_eq!(mb.len(), 2);
        assert_eq!(mb[0].len(), buf::BUF_SIZE);
        assert_eq!(mb[1].len(), 1);
    }
}
