use bytes::Bytes;

/// 单个缓冲区的容量上限。长度分帧编解码按此粒度切块。
pub const BUF_SIZE: usize = 8192;

/// 多缓冲区：一组有序的、各自不超过 [`BUF_SIZE`] 的字节块。
///
/// 管道和分帧编解码都以多缓冲区为单位搬运数据，块边界在
/// 写入端保留，供上传批处理和 UDP 分帧使用。
pub type MultiBuffer = Vec<Bytes>;

/// 多缓冲区的总字节数
pub fn total_len(mb: &MultiBuffer) -> usize {
    mb.iter().map(|b| b.len()).sum()
}

/// 把一段字节按 [`BUF_SIZE`] 切成多缓冲区，保留输入顺序。
pub fn split_chunks(data: &[u8]) -> MultiBuffer {
    data.chunks(BUF_SIZE).map(Bytes::copy_from_slice).collect()
}

/// 拼接为连续字节串（测试与小数据路径使用）
pub fn concat(mb: &MultiBuffer) -> Vec<u8> {
    let mut out = Vec::with_capacity(total_len(mb));
    for b in mb {
        out.extend_from_slice(b);
    }
    out
}
