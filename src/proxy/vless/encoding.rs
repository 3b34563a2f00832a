//! 长度分帧编解码与 addons 头部编解码。
//!
//! 数据报走流式传输时用 16 位大端长度前缀保留报文边界；
//! addons 记录用单字节长度前缀携带在握手头里。

use anyhow::{Context, Result};
use bytes::{BufMut, Bytes, BytesMut};
use prost::Message;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::common::buf::{self, MultiBuffer, BUF_SIZE};

use super::addons::Addons;

/// 把整个多缓冲区编成一条 `[len_hi][len_lo][payload]` 记录。
pub struct LengthPacketWriter<W> {
    writer: W,
    cache: Vec<u8>,
}

impl<W: AsyncWrite + Unpin> LengthPacketWriter<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            cache: Vec::with_capacity(65536),
        }
    }

    pub async fn write_multi_buffer(&mut self, mb: MultiBuffer) -> Result<()> {
        let length = buf::total_len(&mb);
        if length == 0 {
            return Ok(());
        }
        if length > u16::MAX as usize {
            anyhow::bail!("packet too large: {} bytes", length);
        }
        self.cache.clear();
        self.cache.push((length >> 8) as u8);
        self.cache.push(length as u8);
        for b in mb {
            self.cache.extend_from_slice(&b);
        }
        self.writer
            .write_all(&self.cache)
            .await
            .context("failed to write a packet")?;
        self.writer.flush().await.context("failed to write a packet")?;
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

/// 逐块分帧：每个元素单独携带长度前缀。
///
/// 空块和装不进一个缓冲区（长度 + 2 字节前缀超过 [`BUF_SIZE`]）
/// 的块被静默丢弃，调用方不会得到反馈。
pub struct MultiLengthPacketWriter<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin> MultiLengthPacketWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub async fn write_multi_buffer(&mut self, mb: MultiBuffer) -> Result<()> {
        let mut framed = BytesMut::new();
        for b in &mb {
            let length = b.len();
            if length == 0 || length + 2 > BUF_SIZE {
                continue;
            }
            framed.put_u8((length >> 8) as u8);
            framed.put_u8(length as u8);
            framed.extend_from_slice(b);
        }
        if framed.is_empty() {
            return Ok(());
        }
        self.writer
            .write_all(&framed)
            .await
            .context("failed to write a packet")?;
        self.writer.flush().await.context("failed to write a packet")?;
        Ok(())
    }
}

/// 读取一条长度分帧记录，按 [`BUF_SIZE`] 粒度切成多缓冲区。
pub struct LengthPacketReader<R> {
    reader: R,
}

impl<R: AsyncRead + Unpin> LengthPacketReader<R> {
    pub fn new(reader: R) -> Self {
        Self { reader }
    }

    pub async fn read_multi_buffer(&mut self) -> Result<MultiBuffer> {
        let mut header = [0u8; 2];
        self.reader
            .read_exact(&mut header)
            .await
            .context("failed to read packet length")?;
        let mut length = ((header[0] as usize) << 8) | header[1] as usize;

        let mut mb: MultiBuffer = Vec::with_capacity(length / BUF_SIZE + 1);
        while length > 0 {
            let size = length.min(BUF_SIZE);
            let mut chunk = vec![0u8; size];
            self.reader
                .read_exact(&mut chunk)
                .await
                .context("failed to read packet payload")?;
            mb.push(Bytes::from(chunk));
            length -= size;
        }
        Ok(mb)
    }
}

/// 编码握手头里的 addons 段。
///
/// vision 流控或启用 seed 时携带序列化记录，其余情况只写一个
/// 零字节。序列化超过 255 字节视为错误。
pub fn encode_header_addons(buffer: &mut BytesMut, addons: &Addons) -> Result<()> {
    if addons.carries_payload() {
        let encoded = addons.encode_to_vec();
        if encoded.len() > u8::MAX as usize {
            anyhow::bail!("addons too large: {} bytes", encoded.len());
        }
        buffer.put_u8(encoded.len() as u8);
        buffer.extend_from_slice(&encoded);
    } else {
        buffer.put_u8(0);
    }
    Ok(())
}

/// 解码握手头里的 addons 段。零长度直接返回空记录。
pub async fn decode_header_addons<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Addons> {
    let length = reader
        .read_u8()
        .await
        .context("failed to read addons length")?;
    if length == 0 {
        return Ok(Addons::default());
    }
    let mut raw = vec![0u8; length as usize];
    reader
        .read_exact(&mut raw)
        .await
        .context("failed to read addons value")?;
    let addons = Addons::decode(raw.as_slice()).context("failed to decode addons value")?;
    Ok(addons)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::vless::addons::populate_seed;
    use crate::proxy::vless::XRV;
    use std::io::Cursor;

    #[tokio::test]
    async fn length_packet_round_trip() {
        let mut writer = LengthPacketWriter::new(Vec::new());
        let payload: MultiBuffer = vec![Bytes::from_static(b"hello"), Bytes::from_static(b"world")];
        writer.write_multi_buffer(payload).await.unwrap();
        let encoded = writer.into_inner();

        assert_eq!(&encoded[..2], &[0, 10]);
        assert_eq!(&encoded[2..], b"helloworld");

        let mut reader = LengthPacketReader::new(Cursor::new(encoded));
        let mb = reader.read_multi_buffer().await.unwrap();
        assert_eq!(buf::concat(&mb), b"helloworld");
    }

    #[tokio::test]
    async fn length_packet_chunked_read() {
        let payload = vec![0x5Au8; BUF_SIZE + 10];
        let mut writer = LengthPacketWriter::new(Vec::new());
        writer
            .write_multi_buffer(vec![Bytes::from(payload.clone())])
            .await
            .unwrap();
        let encoded = writer.into_inner();

        let mut reader = LengthPacketReader::new(Cursor::new(encoded));
        let mb = reader.read_multi_buffer().await.unwrap();
        assert_eq!(mb.len(), 2);
        assert_eq!(mb[0].len(), BUF_SIZE);
        assert_eq!(mb[1].len(), 10);
        assert_eq!(buf::concat(&mb), payload);
    }

    #[tokio::test]
    async fn length_packet_empty_is_noop() {
        let mut writer = LengthPacketWriter::new(Vec::new());
        writer.write_multi_buffer(Vec::new()).await.unwrap();
        assert!(writer.into_inner().is_empty());
    }

    #[tokio::test]
    async fn length_packet_read_errors_are_wrapped() {
        // 只有 1 字节，长度都读不全
        let mut reader = LengthPacketReader::new(Cursor::new(vec![0x00u8]));
        let err = reader.read_multi_buffer().await.unwrap_err();
        assert!(err.to_string().contains("failed to read packet length"));

        // 长度声称 4 字节但载荷只有 2 字节
        let mut reader = LengthPacketReader::new(Cursor::new(vec![0x00, 0x04, 0xAA, 0xBB]));
        let err = reader.read_multi_buffer().await.unwrap_err();
        assert!(err.to_string().contains("failed to read packet payload"));
    }

    #[tokio::test]
    async fn multi_length_writer_filters_and_frames() {
        let mut writer = MultiLengthPacketWriter::new(Vec::new());
        let oversized = Bytes::from(vec![1u8; BUF_SIZE - 1]);
        let mb: MultiBuffer = vec![
            Bytes::new(),                  // 空块丢弃
            Bytes::from_static(b"ab"),     // 保留
            oversized,                     // len + 2 > BUF_SIZE，丢弃
            Bytes::from_static(b"cde"),    // 保留
        ];
        writer.write_multi_buffer(mb).await.unwrap();
        let encoded = writer.writer;
        assert_eq!(encoded, vec![0, 2, b'a', b'b', 0, 3, b'c', b'd', b'e']);
    }

    #[tokio::test]
    async fn multi_length_writer_all_filtered_is_noop() {
        let mut writer = MultiLengthPacketWriter::new(Vec::new());
        writer
            .write_multi_buffer(vec![Bytes::new()])
            .await
            .unwrap();
        assert!(writer.writer.is_empty());
    }

    #[tokio::test]
    async fn addons_round_trip_with_seed() {
        let mut addons = Addons::default();
        populate_seed("1", &mut addons);

        let mut buffer = BytesMut::new();
        encode_header_addons(&mut buffer, &addons).unwrap();
        assert!(buffer[0] > 0);

        let mut cursor = Cursor::new(buffer.to_vec());
        let decoded = decode_header_addons(&mut cursor).await.unwrap();
        assert_eq!(decoded, addons);
    }

    #[tokio::test]
    async fn addons_round_trip_with_flow() {
        let addons = Addons {
            flow: XRV.to_string(),
            ..Default::default()
        };

        let mut buffer = BytesMut::new();
        encode_header_addons(&mut buffer, &addons).unwrap();

        let mut cursor = Cursor::new(buffer.to_vec());
        let decoded = decode_header_addons(&mut cursor).await.unwrap();
        assert_eq!(decoded.flow, XRV);
    }

    #[tokio::test]
    async fn addons_empty_encodes_zero_byte() {
        let addons = Addons::default();
        let mut buffer = BytesMut::new();
        encode_header_addons(&mut buffer, &addons).unwrap();
        assert_eq!(&buffer[..], &[0x00]);

        let mut cursor = Cursor::new(buffer.to_vec());
        let decoded = decode_header_addons(&mut cursor).await.unwrap();
        assert_eq!(decoded, Addons::default());
    }

    #[tokio::test]
    async fn addons_decode_garbage_fails() {
        let mut cursor = Cursor::new(vec![3u8, 0xFF, 0xFF, 0xFF]);
        assert!(decode_header_addons(&mut cursor).await.is_err());
    }

    #[test]
    fn addons_oversized_encoding_fails() {
        let addons = Addons {
            flow: XRV.to_string(),
            seed: vec![0u8; 300],
            ..Default::default()
        };
        let mut buffer = BytesMut::new();
        assert!(encode_header_addons(&mut buffer, &addons).is_err());
    }
}
