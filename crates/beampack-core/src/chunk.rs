//! Chunked module container (`FOR1` / `BEAM`) decoding and re-encoding.
//!
//! ```text
//! "FOR1" | form size u32 BE (= total length - 8) | "BEAM"
//! [chunk]*
//!   chunk = TAG[4] | len u32 BE | data[len] | zero padding to 4
//! ```
//!
//! The padding of the final chunk may be missing in files produced by older
//! tools; decoding tolerates that, encoding always pads.

use indexmap::IndexMap;

use crate::{padding_for, ByteReader, ByteWriter, ChunkTag, CoreError, CoreResult};

const FORM_MAGIC: &[u8; 4] = b"FOR1";
const FORM_TYPE: &[u8; 4] = b"BEAM";
const HEADER_LEN: usize = 12;

/// Ordered `tag -> bytes` mapping, one entry per tag.
pub type ChunkMap = IndexMap<ChunkTag, Vec<u8>>;

/// Decode a compiled module blob into its chunks, in file order.
pub fn decode(blob: &[u8]) -> CoreResult<ChunkMap> {
    if blob.len() < HEADER_LEN {
        return Err(CoreError::malformed(format!("blob too short ({} bytes)", blob.len())));
    }
    let mut r = ByteReader::new(blob);
    if r.read_bytes(4)? != FORM_MAGIC {
        return Err(CoreError::malformed("missing FOR1 header"));
    }
    let form_size = r.read_u32_be()? as usize;
    if form_size + 8 != blob.len() {
        return Err(CoreError::malformed(format!(
            "form size {form_size} does not match blob length {}",
            blob.len()
        )));
    }
    if r.read_bytes(4)? != FORM_TYPE {
        return Err(CoreError::malformed("form type is not BEAM"));
    }

    let mut chunks = ChunkMap::new();
    while !r.is_empty() {
        let at = r.offset();
        let tag = r
            .read_tag()
            .map_err(|_| CoreError::malformed(format!("truncated chunk header at {at}")))?;
        if !tag.is_well_formed() {
            return Err(CoreError::malformed(format!("invalid chunk tag {tag} at {at}")));
        }
        let len = r
            .read_u32_be()
            .map_err(|_| CoreError::malformed(format!("truncated length for chunk {tag}")))?
            as usize;
        let data = r.read_bytes(len).map_err(|_| {
            CoreError::malformed(format!("chunk {tag} declares {len} bytes, {} left", r.remaining()))
        })?;
        if chunks.insert(tag, data.to_vec()).is_some() {
            return Err(CoreError::malformed(format!("duplicate chunk {tag}")));
        }
        let pad = padding_for(len, 4).min(r.remaining());
        r.skip(pad)?;
    }
    Ok(chunks)
}

/// Encode chunks (in map order) into a module blob of the same family.
pub fn encode(chunks: &ChunkMap) -> Vec<u8> {
    let body_len: usize = chunks
        .values()
        .map(|data| 8 + data.len() + padding_for(data.len(), 4))
        .sum();

    let mut w = ByteWriter::with_capacity(HEADER_LEN + body_len);
    w.write_bytes(FORM_MAGIC);
    w.write_u32_be((4 + body_len) as u32);
    w.write_bytes(FORM_TYPE);
    for (tag, data) in chunks {
        w.write_tag(*tag);
        w.write_u32_be(data.len() as u32);
        w.write_bytes(data);
        w.pad_to(4);
    }
    w.into_vec()
}

/// Keep only the chunks whose tag is in `allowed`, preserving order.
pub fn retain_tags(chunks: &mut ChunkMap, allowed: &[ChunkTag]) -> Vec<ChunkTag> {
    let mut dropped = Vec::new();
    chunks.retain(|tag, _| {
        let keep = allowed.contains(tag);
        if !keep {
            dropped.push(*tag);
        }
        keep
    });
    dropped
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sample() -> ChunkMap {
        let mut m = ChunkMap::new();
        m.insert(ChunkTag::ATU8, vec![0, 0, 0, 1, 3, b'f', b'o', b'o']);
        m.insert(ChunkTag::CODE, vec![1, 2, 3]);
        m.insert(ChunkTag(*b"Dbgi"), vec![9; 5]);
        m
    }

    #[test]
    fn encode_layout() {
        let blob = encode(&sample());
        assert_eq!(&blob[..4], b"FOR1");
        assert_eq!(&blob[8..12], b"BEAM");
        assert_eq!(blob.len() % 4, 0);
        let size = u32::from_be_bytes([blob[4], blob[5], blob[6], blob[7]]) as usize;
        assert_eq!(size + 8, blob.len());
        // AtU8 (8 bytes) + Code (3 + 1 pad) + Dbgi (5 + 3 pad) + 3 headers
        assert_eq!(blob.len(), 12 + (8 + 8) + (8 + 4) + (8 + 8));
    }

    #[test]
    fn roundtrip_preserves_order() -> CoreResult<()> {
        let original = sample();
        let decoded = decode(&encode(&original))?;
        assert_eq!(decoded, original);
        assert_eq!(decoded.keys().copied().collect::<Vec<_>>(), original.keys().copied().collect::<Vec<_>>());
        assert_eq!(decode(&encode(&decoded))?, decoded);
        Ok(())
    }

    #[test]
    fn unpadded_final_chunk_is_accepted() -> CoreResult<()> {
        let mut blob = encode(&sample());
        blob.truncate(blob.len() - 3);
        let size = (blob.len() - 8) as u32;
        blob[4..8].copy_from_slice(&size.to_be_bytes());
        let decoded = decode(&blob)?;
        assert_eq!(decoded[&ChunkTag(*b"Dbgi")], vec![9; 5]);
        Ok(())
    }

    #[test]
    fn rejects_corrupt_blobs() {
        let good = encode(&sample());

        let mut bad_magic = good.clone();
        bad_magic[0] = b'X';
        assert!(matches!(decode(&bad_magic), Err(CoreError::MalformedContainer(_))));

        let mut bad_size = good.clone();
        bad_size[7] = bad_size[7].wrapping_add(4);
        assert!(matches!(decode(&bad_size), Err(CoreError::MalformedContainer(_))));

        let mut truncated = good[..good.len() - 8].to_vec();
        let size = (truncated.len() - 8) as u32;
        truncated[4..8].copy_from_slice(&size.to_be_bytes());
        assert!(matches!(decode(&truncated), Err(CoreError::MalformedContainer(_))));

        let mut bad_tag = good.clone();
        bad_tag[12] = 0;
        assert!(matches!(decode(&bad_tag), Err(CoreError::MalformedContainer(_))));

        assert!(matches!(decode(b"FOR1"), Err(CoreError::MalformedContainer(_))));
    }

    #[test]
    fn rejects_duplicate_tags() {
        let mut blob = encode(&sample());
        // rename the Dbgi chunk to Code
        let pos = blob.windows(4).position(|w| w == b"Dbgi").unwrap();
        blob[pos..pos + 4].copy_from_slice(b"Code");
        assert!(matches!(decode(&blob), Err(CoreError::MalformedContainer(_))));
    }

    #[test]
    fn retain_reports_dropped() {
        let mut m = sample();
        let dropped = retain_tags(&mut m, &[ChunkTag::ATU8, ChunkTag::CODE]);
        assert_eq!(dropped, vec![ChunkTag(*b"Dbgi")]);
        assert_eq!(m.len(), 2);
    }
}
