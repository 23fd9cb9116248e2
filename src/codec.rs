//! Tagged value compression.
//!
//! Cached states are optionally compressed with zlib or bz2 and tagged
//! with a two-byte marker (`.z` / `.b`) so the decoder can recognize them
//! without out-of-band metadata. The same markers are shared with the
//! outer storage layers, which lets the encoder skip payloads a higher
//! layer already compressed.
//!
//! Encoding never makes a value larger: payloads of 100 bytes or less are
//! stored as-is (small object states rarely compress), and a compressed
//! result that is not strictly shorter than its input is discarded in
//! favor of the original bytes.

use std::io::Write;

use crate::error::{CacheError, Result};

/// Marker prefix for zlib streams.
const MARKER_ZLIB: &[u8; 2] = b".z";
/// Marker prefix for bz2 streams.
const MARKER_BZ2: &[u8; 2] = b".b";
/// Payloads at or below this size are never compressed.
const MIN_COMPRESS_SIZE: usize = 100;

/// The compression algorithm applied to cached states.
///
/// Chosen once at construction from the configured name; there is no
/// runtime switching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    /// zlib (DEFLATE with zlib framing), marker `.z`.
    Zlib,
    /// bzip2, marker `.b`.
    Bz2,
    /// Store values uncompressed.
    None,
}

impl Codec {
    /// Resolves a configured algorithm name.
    ///
    /// Unknown names are a configuration error.
    pub fn from_name(name: &str) -> Result<Codec> {
        match name {
            "zlib" => Ok(Codec::Zlib),
            "bz2" => Ok(Codec::Bz2),
            "none" => Ok(Codec::None),
            other => Err(CacheError::Config(format!(
                "unknown compression algorithm {other:?}"
            ))),
        }
    }

    /// Compresses `data`, returning it unchanged when compression does not
    /// apply or does not pay off.
    pub fn encode(&self, data: Vec<u8>) -> Vec<u8> {
        let marker: &[u8; 2] = match self {
            Codec::Zlib => MARKER_ZLIB,
            Codec::Bz2 => MARKER_BZ2,
            Codec::None => return data,
        };
        if data.len() <= MIN_COMPRESS_SIZE || known_marker(&data) {
            return data;
        }

        let mut compressed = Vec::with_capacity(data.len() / 2);
        compressed.extend_from_slice(marker);
        let ok = match self {
            Codec::Zlib => {
                let mut enc =
                    flate2::write::ZlibEncoder::new(&mut compressed, flate2::Compression::default());
                enc.write_all(&data).and_then(|()| enc.finish().map(|_| ()))
            }
            Codec::Bz2 => {
                let mut enc =
                    bzip2::write::BzEncoder::new(&mut compressed, bzip2::Compression::default());
                enc.write_all(&data).and_then(|()| enc.finish().map(|_| ()))
            }
            Codec::None => unreachable!(),
        }
        .is_ok();

        if ok && compressed.len() < data.len() {
            compressed
        } else {
            data
        }
    }

    /// Decompresses `data` if it starts with a known marker, otherwise
    /// returns it unchanged.
    ///
    /// Decoding recognizes every marker, not just the configured
    /// algorithm's, so a cache restarted with a different codec can still
    /// read its old values.
    pub fn decode(data: Vec<u8>) -> std::io::Result<Vec<u8>> {
        use std::io::Read;

        if data.starts_with(MARKER_ZLIB) {
            let mut out = Vec::new();
            flate2::read::ZlibDecoder::new(&data[2..]).read_to_end(&mut out)?;
            Ok(out)
        } else if data.starts_with(MARKER_BZ2) {
            let mut out = Vec::new();
            bzip2::read::BzDecoder::new(&data[2..]).read_to_end(&mut out)?;
            Ok(out)
        } else {
            Ok(data)
        }
    }
}

/// Returns `true` if `data` begins with any recognized marker.
fn known_marker(data: &[u8]) -> bool {
    data.starts_with(MARKER_ZLIB) || data.starts_with(MARKER_BZ2)
}
