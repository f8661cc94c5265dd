//! Literal table normalization (`LitT` → `LitU`).
//!
//! The compiler writes the literal table as a 4-byte big-endian prefix
//! followed by either raw literal data (prefix = 0) or zlib data whose
//! uncompressed size is the prefix. The runtime only loads the raw form, so
//! the table is always rewritten under the unambiguous `LitU` tag.

use std::io::Read;

use flate2::read::ZlibDecoder;
use tracing::debug;

use crate::{chunk::ChunkMap, ByteReader, ChunkTag, CoreError, CoreResult};

/// Decode one `LitT` payload into raw literal data.
pub fn decode_literal_table(chunk: &[u8]) -> CoreResult<Vec<u8>> {
    let mut r = ByteReader::new(chunk);
    let declared = r
        .read_u32_be()
        .map_err(|_| CoreError::literal(format!("chunk too short ({} bytes)", chunk.len())))?;
    let body = r.rest();
    if declared == 0 {
        return Ok(body.to_vec());
    }

    // one byte past the prefix is enough to detect an oversized stream
    let mut out = Vec::new();
    ZlibDecoder::new(body)
        .take(u64::from(declared) + 1)
        .read_to_end(&mut out)
        .map_err(|e| CoreError::literal(format!("inflate: {e}")))?;
    let declared = declared as usize;
    if out.len() > declared {
        return Err(CoreError::literal(format!("inflated more than {declared} bytes, header declares {declared}")));
    }
    if out.len() < declared {
        return Err(CoreError::literal(format!("inflated {} bytes, header declares {declared}", out.len())));
    }
    Ok(out)
}

/// Replace `LitT` by `LitU` in place (same position in the chunk order).
///
/// Modules without a literal table are left untouched.
pub fn normalize_literals(chunks: &mut ChunkMap) -> CoreResult<()> {
    let Some(table) = chunks.get(&ChunkTag::LITT) else {
        return Ok(());
    };
    let mut raw = Some(decode_literal_table(table)?);
    debug!(bytes = raw.as_ref().map_or(0, Vec::len), "literal table normalized");

    // a stale LitU from an earlier pass is superseded
    let rebuilt: ChunkMap = chunks
        .drain(..)
        .filter_map(|(tag, data)| match tag {
            ChunkTag::LITT => raw.take().map(|r| (ChunkTag::LITU, r)),
            ChunkTag::LITU => None,
            _ => Some((tag, data)),
        })
        .collect();
    *chunks = rebuilt;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use flate2::{write::ZlibEncoder, Compression};
    use pretty_assertions::assert_eq;

    use super::*;

    fn compressed(data: &[u8]) -> Vec<u8> {
        let mut enc = ZlibEncoder::new(Vec::new(), Compression::default());
        enc.write_all(data).unwrap();
        let mut out = (data.len() as u32).to_be_bytes().to_vec();
        out.extend(enc.finish().unwrap());
        out
    }

    #[test]
    fn zero_prefix_is_verbatim() -> CoreResult<()> {
        let mut chunk = vec![0, 0, 0, 0];
        chunk.extend_from_slice(b"\0\0\0\x01raw literal bytes");
        assert_eq!(decode_literal_table(&chunk)?, b"\0\0\0\x01raw literal bytes".to_vec());
        Ok(())
    }

    #[test]
    fn nonzero_prefix_is_inflated() -> CoreResult<()> {
        let data = b"literal literal literal".repeat(8);
        assert_eq!(decode_literal_table(&compressed(&data))?, data);
        Ok(())
    }

    #[test]
    fn garbage_raises_literal_error() {
        let chunk = [0, 0, 0, 16, 0xde, 0xad, 0xbe, 0xef, 1, 2, 3];
        assert!(matches!(decode_literal_table(&chunk), Err(CoreError::LiteralDecode(_))));
        assert!(matches!(decode_literal_table(&[0, 1]), Err(CoreError::LiteralDecode(_))));
    }

    #[test]
    fn size_mismatch_raises_literal_error() {
        let mut chunk = compressed(b"abcdef");
        chunk[3] = 99;
        assert!(matches!(decode_literal_table(&chunk), Err(CoreError::LiteralDecode(_))));
    }

    #[test]
    fn oversized_stream_stops_past_declared_size() {
        let mut enc = ZlibEncoder::new(Vec::new(), Compression::best());
        let zeros = vec![0u8; 1 << 20];
        for _ in 0..64 {
            enc.write_all(&zeros).unwrap();
        }
        let mut chunk = 16u32.to_be_bytes().to_vec();
        chunk.extend(enc.finish().unwrap());

        let Err(CoreError::LiteralDecode(msg)) = decode_literal_table(&chunk) else {
            panic!("64 MiB stream under a 16-byte prefix must fail");
        };
        assert_eq!(msg, "inflated more than 16 bytes, header declares 16");
    }

    #[test]
    fn normalize_replaces_tag_in_place() -> CoreResult<()> {
        let mut chunks = ChunkMap::new();
        chunks.insert(ChunkTag::ATU8, vec![1]);
        chunks.insert(ChunkTag::LITT, compressed(b"payload"));
        chunks.insert(ChunkTag::CODE, vec![2]);
        normalize_literals(&mut chunks)?;
        let tags: Vec<_> = chunks.keys().copied().collect();
        assert_eq!(tags, vec![ChunkTag::ATU8, ChunkTag::LITU, ChunkTag::CODE]);
        assert_eq!(chunks[&ChunkTag::LITU], b"payload".to_vec());
        Ok(())
    }

    #[test]
    fn absent_table_is_noop() -> CoreResult<()> {
        let mut chunks = ChunkMap::new();
        chunks.insert(ChunkTag::CODE, vec![2]);
        normalize_literals(&mut chunks)?;
        assert_eq!(chunks.len(), 1);
        Ok(())
    }
}
