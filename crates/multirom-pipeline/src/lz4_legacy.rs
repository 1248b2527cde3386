//! LZ4 legacy frame format, as used by Linux initramfs
//!
//! The stream is the magic followed by chunks of `[u32 LE compressed size]
//! [LZ4 block]`. Each block decompresses to at most 8 MiB.

use multirom_core::{Error, Result, MAX_RAMDISK_SIZE};

/// Legacy frame magic, little-endian
pub const LZ4_LEGACY_MAGIC: u32 = 0x184C_2102;

/// Uncompressed size of a full block
pub const LEGACY_BLOCK_SIZE: usize = 8 * 1024 * 1024;

fn read_u32(data: &[u8], offset: usize) -> Option<u32> {
    data.get(offset..offset + 4)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

/// Decompress a legacy LZ4 stream
pub fn decompress(data: &[u8]) -> Result<Vec<u8>> {
    if read_u32(data, 0) != Some(LZ4_LEGACY_MAGIC) {
        return Err(Error::invalid_archive("missing LZ4 legacy magic"));
    }

    let mut out = Vec::new();
    let mut block = vec![0u8; LEGACY_BLOCK_SIZE];
    let mut offset = 4;

    while let Some(size) = read_u32(data, offset) {
        offset += 4;

        // Concatenated streams repeat the magic
        if size == LZ4_LEGACY_MAGIC {
            continue;
        }
        if size == 0 {
            break;
        }

        let end = offset
            .checked_add(size as usize)
            .filter(|end| *end <= data.len())
            .ok_or_else(|| Error::invalid_archive("truncated LZ4 block"))?;

        let n = lz4_flex::block::decompress_into(&data[offset..end], &mut block)
            .map_err(|e| Error::invalid_archive(format!("LZ4 block: {}", e)))?;
        offset = end;

        if out.len() + n > MAX_RAMDISK_SIZE {
            return Err(Error::invalid_archive(format!(
                "ramdisk exceeds {} bytes",
                MAX_RAMDISK_SIZE
            )));
        }
        out.extend_from_slice(&block[..n]);
    }

    Ok(out)
}

/// Compress into a single legacy LZ4 stream
pub fn compress(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() / 2 + 4);
    out.extend_from_slice(&LZ4_LEGACY_MAGIC.to_le_bytes());

    for chunk in data.chunks(LEGACY_BLOCK_SIZE) {
        let block = lz4_flex::block::compress(chunk);
        out.extend_from_slice(&(block.len() as u32).to_le_bytes());
        out.extend_from_slice(&block);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_multiple_blocks() {
        let data: Vec<u8> = (0..LEGACY_BLOCK_SIZE + 12345).map(|i| (i % 251) as u8).collect();
        let packed = compress(&data);
        assert_eq!(&packed[..4], &[0x02, 0x21, 0x4C, 0x18]);
        assert_eq!(decompress(&packed).unwrap(), data);
    }

    #[test]
    fn test_concatenated_streams() {
        let mut packed = compress(b"first ");
        packed.extend_from_slice(&compress(b"second"));
        assert_eq!(decompress(&packed).unwrap(), b"first second");
    }

    #[test]
    fn test_truncated_block() {
        let mut packed = compress(b"some ramdisk content");
        packed.truncate(packed.len() - 3);
        assert!(matches!(decompress(&packed), Err(Error::InvalidArchive(_))));
    }

    #[test]
    fn test_bad_magic() {
        assert!(decompress(b"\x1f\x8b\x08\x00").is_err());
    }
}
