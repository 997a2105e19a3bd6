//! 换出块（Index Table 页 / Filter 块）的二进制格式
//!
//! ```text
//! ┌──────────────────────────────────┐
//! │ block_id     (u64 LE)            │
//! │ elem_count   (u32 LE)            │
//! │ width        (u8)                │  每个元素的字节数（Filter 块为 0）
//! │ uncomp_size  (u32 LE)            │
//! │ compression  (u8)                │
//! │ payload      (compressed)        │
//! │ CRC32        (u32 LE)            │
//! └──────────────────────────────────┘
//! ```

use std::io::Cursor;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::common::{BlockId, OlapError, Result};
use crate::compression::{self, CompressionType};

const HEADER_LEN: usize = 8 + 4 + 1 + 4 + 1;

/// 解码后的块头
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    pub block_id:   BlockId,
    pub elem_count: u32,
    pub width:      u8,
}

/// 序列化为块字节（compress → 加 header+CRC）
pub fn encode_block(
    header:      BlockHeader,
    raw:         &[u8],
    compression: CompressionType,
) -> Result<Vec<u8>> {
    let payload = compression::compress(raw, compression)?;

    let mut out = Vec::with_capacity(HEADER_LEN + payload.len() + 4);
    // Vec<u8> 的写入不会失败
    out.write_u64::<LittleEndian>(header.block_id).map_err(io_err)?;
    out.write_u32::<LittleEndian>(header.elem_count).map_err(io_err)?;
    out.write_u8(header.width).map_err(io_err)?;
    out.write_u32::<LittleEndian>(raw.len() as u32).map_err(io_err)?;
    out.write_u8(compression.tag()).map_err(io_err)?;
    out.extend_from_slice(&payload);

    let crc = crc32fast::hash(&out);
    out.write_u32::<LittleEndian>(crc).map_err(io_err)?;
    Ok(out)
}

/// 校验 CRC 并解压，返回块头与原始字节
pub fn decode_block(data: &[u8]) -> Result<(BlockHeader, Vec<u8>)> {
    if data.len() < HEADER_LEN + 4 {
        return Err(OlapError::Corrupted("block data too short".into()));
    }
    let payload_end = data.len() - 4;
    let stored_crc  = Cursor::new(&data[payload_end..]).read_u32::<LittleEndian>().map_err(io_err)?;
    if stored_crc != crc32fast::hash(&data[..payload_end]) {
        return Err(OlapError::ChecksumMismatch);
    }

    let mut rd      = Cursor::new(&data[..HEADER_LEN]);
    let block_id    = rd.read_u64::<LittleEndian>().map_err(io_err)?;
    let elem_count  = rd.read_u32::<LittleEndian>().map_err(io_err)?;
    let width       = rd.read_u8().map_err(io_err)?;
    let uncomp_size = rd.read_u32::<LittleEndian>().map_err(io_err)? as usize;
    let codec       = CompressionType::from_tag(rd.read_u8().map_err(io_err)?)?;

    let raw = compression::decompress(&data[HEADER_LEN..payload_end], codec, uncomp_size)?;
    if raw.len() != uncomp_size {
        return Err(OlapError::Corrupted(format!(
            "block {block_id}: expected {uncomp_size} bytes, got {}", raw.len()
        )));
    }
    Ok((BlockHeader { block_id, elem_count, width }, raw))
}

fn io_err(e: std::io::Error) -> OlapError {
    OlapError::Corrupted(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lz4_block_survives_encode_decode() {
        let raw: Vec<u8> = (0..4096u32).flat_map(|i| (i / 7).to_le_bytes()).collect();
        let header = BlockHeader { block_id: 42, elem_count: 4096, width: 4 };
        let bytes = encode_block(header, &raw, CompressionType::Lz4).unwrap();
        assert!(bytes.len() < raw.len());
        let (h, back) = decode_block(&bytes).unwrap();
        assert_eq!(h, header);
        assert_eq!(back, raw);
    }

    #[test]
    fn flipped_byte_is_rejected() {
        let header = BlockHeader { block_id: 1, elem_count: 3, width: 2 };
        let mut bytes = encode_block(header, &[1, 0, 2, 0, 3, 0], CompressionType::None).unwrap();
        bytes[HEADER_LEN] ^= 0xff;
        assert!(matches!(decode_block(&bytes), Err(OlapError::ChecksumMismatch)));
    }
}
