//! Ramdisk compression detection and codecs
//!
//! The codec is picked once from the ramdisk's magic bytes and then used for
//! both directions, so a patched ramdisk is written back in its original
//! format.

use std::fmt;
use std::io::{Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use liblzma::read::XzDecoder;
use liblzma::stream::Stream;

use multirom_core::{Error, Result, MAX_RAMDISK_SIZE};

use crate::lz4_legacy;

const GZIP_MAGIC: [u8; 2] = [0x1F, 0x8B];
const LZMA_MAGIC: [[u8; 4]; 2] = [[0x5D, 0x00, 0x00, 0x00], [0x5D, 0x00, 0x00, 0x80]];

/// Compression of a boot image ramdisk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionKind {
    Gzip,
    Lz4,
    Lzma,
    Unknown,
}

impl CompressionKind {
    /// Identify the compression from the first bytes of the ramdisk
    pub fn detect(magic: &[u8]) -> Self {
        if magic.len() >= 2 && magic[..2] == GZIP_MAGIC {
            return CompressionKind::Gzip;
        }
        if magic.len() >= 4 {
            let head = [magic[0], magic[1], magic[2], magic[3]];
            if u32::from_le_bytes(head) == lz4_legacy::LZ4_LEGACY_MAGIC {
                return CompressionKind::Lz4;
            }
            if LZMA_MAGIC.contains(&head) {
                return CompressionKind::Lzma;
            }
        }
        CompressionKind::Unknown
    }

    /// Like [`CompressionKind::detect`], failing with the raw bytes when unknown
    pub fn sniff(data: &[u8]) -> Result<Self> {
        match Self::detect(data) {
            CompressionKind::Unknown => {
                let mut magic = [0u8; 4];
                let n = data.len().min(4);
                magic[..n].copy_from_slice(&data[..n]);
                tracing::error!("Unknown ramdisk compression ({:02X?})", magic);
                Err(Error::UnknownCompression(magic))
            }
            kind => {
                tracing::info!("Ramdisk uses {} compression", kind);
                Ok(kind)
            }
        }
    }

    /// The codec for this kind
    pub fn codec(&self) -> Result<&'static dyn RamdiskCodec> {
        match self {
            CompressionKind::Gzip => Ok(&GzipCodec),
            CompressionKind::Lz4 => Ok(&Lz4Codec),
            CompressionKind::Lzma => Ok(&LzmaCodec),
            CompressionKind::Unknown => Err(Error::UnknownCompression([0; 4])),
        }
    }
}

impl fmt::Display for CompressionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CompressionKind::Gzip => "GZIP",
            CompressionKind::Lz4 => "LZ4",
            CompressionKind::Lzma => "LZMA",
            CompressionKind::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// One compression format, both directions
pub trait RamdiskCodec: Sync {
    fn kind(&self) -> CompressionKind;

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>>;

    fn compress(&self, cpio: &[u8]) -> Result<Vec<u8>>;

    /// Whether [`RamdiskCodec::compress`] is available
    fn can_compress(&self) -> bool {
        true
    }
}

/// Read a decoder to the end, bounded by the ramdisk size limit
fn read_bounded(reader: impl Read, what: &str) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    reader
        .take(MAX_RAMDISK_SIZE as u64 + 1)
        .read_to_end(&mut out)
        .map_err(|e| Error::invalid_archive(format!("{} ramdisk: {}", what, e)))?;

    if out.len() > MAX_RAMDISK_SIZE {
        return Err(Error::invalid_archive(format!(
            "{} ramdisk exceeds {} bytes",
            what, MAX_RAMDISK_SIZE
        )));
    }
    Ok(out)
}

pub struct GzipCodec;

impl RamdiskCodec for GzipCodec {
    fn kind(&self) -> CompressionKind {
        CompressionKind::Gzip
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        read_bounded(GzDecoder::new(data), "GZIP")
    }

    fn compress(&self, cpio: &[u8]) -> Result<Vec<u8>> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(cpio)?;
        Ok(encoder.finish()?)
    }
}

pub struct Lz4Codec;

impl RamdiskCodec for Lz4Codec {
    fn kind(&self) -> CompressionKind {
        CompressionKind::Lz4
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        lz4_legacy::decompress(data)
    }

    fn compress(&self, cpio: &[u8]) -> Result<Vec<u8>> {
        Ok(lz4_legacy::compress(cpio))
    }
}

/// LZMA "alone" format; decode only
pub struct LzmaCodec;

impl RamdiskCodec for LzmaCodec {
    fn kind(&self) -> CompressionKind {
        CompressionKind::Lzma
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        let stream = Stream::new_lzma_decoder(u64::MAX)
            .map_err(|e| Error::invalid_archive(format!("LZMA decoder: {}", e)))?;
        read_bounded(XzDecoder::new_stream(data, stream), "LZMA")
    }

    fn compress(&self, _cpio: &[u8]) -> Result<Vec<u8>> {
        tracing::error!("Can't compress ramdisk using LZMA");
        Err(Error::unsupported_compression("LZMA ramdisk recompression"))
    }

    fn can_compress(&self) -> bool {
        false
    }
}
