//! Versioned byte envelope for model snapshots
//!
//! Layout (all integers little-endian):
//!
//! ```text
//! +--------+---------+-------------+----------+------+-------------+---------+
//! | "BVRM" | version | compression | kind_len | kind | payload_len | payload |
//! |  4 B   |  u8     |  u8         |  u16     | utf8 |  u32        |  bytes  |
//! +--------+---------+-------------+----------+------+-------------+---------+
//! ```
//!
//! The payload is whatever the model's `save` produced, optionally compressed.
//! The engine never looks inside it.

use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Magic bytes at the start of every envelope
pub const MAGIC: [u8; 4] = *b"BVRM";

/// Current envelope format version
pub const VERSION: u8 = 1;

const HEADER_LEN: usize = 4 + 1 + 1 + 2;

/// Compression algorithm for envelope payloads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    /// Stored as-is (default)
    #[default]
    None,
    /// LZ4 - Fast compression, good for frequent snapshots
    Lz4,
    /// ZSTD - Better ratio, slower
    Zstd,
}

impl Compression {
    /// Get algorithm name as string
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Lz4 => "lz4",
            Self::Zstd => "zstd",
        }
    }

    const fn tag(self) -> u8 {
        match self {
            Self::None => 0,
            Self::Lz4 => 1,
            Self::Zstd => 2,
        }
    }

    fn from_tag(tag: u8) -> Result<Self> {
        match tag {
            0 => Ok(Self::None),
            1 => Ok(Self::Lz4),
            2 => Ok(Self::Zstd),
            other => Err(Error::Envelope(format!("unknown compression tag {other}"))),
        }
    }

    /// Whether this build can encode and decode the algorithm.
    #[must_use]
    pub const fn is_available(&self) -> bool {
        matches!(self, Self::None) || cfg!(feature = "compression")
    }

    /// Compress data using this algorithm
    ///
    /// # Errors
    /// Returns error if compression fails or the `compression` feature is disabled
    pub fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        match self {
            Self::None => Ok(data.to_vec()),
            #[cfg(feature = "compression")]
            Self::Lz4 => Ok(lz4_flex::compress_prepend_size(data)),
            #[cfg(feature = "compression")]
            Self::Zstd => zstd::encode_all(data, 3)
                .map_err(|e| Error::Envelope(format!("ZSTD compression failed: {e}"))),
            #[cfg(not(feature = "compression"))]
            other => Err(Self::disabled(*other)),
        }
    }

    /// Decompress data using this algorithm
    ///
    /// # Errors
    /// Returns error if decompression fails (e.g., corrupted data) or the
    /// `compression` feature is disabled
    pub fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        match self {
            Self::None => Ok(data.to_vec()),
            #[cfg(feature = "compression")]
            Self::Lz4 => lz4_flex::decompress_size_prepended(data)
                .map_err(|e| Error::Envelope(format!("LZ4 decompression failed: {e}"))),
            #[cfg(feature = "compression")]
            Self::Zstd => zstd::decode_all(data)
                .map_err(|e| Error::Envelope(format!("ZSTD decompression failed: {e}"))),
            #[cfg(not(feature = "compression"))]
            other => Err(Self::disabled(*other)),
        }
    }

    #[cfg(not(feature = "compression"))]
    fn disabled(algorithm: Self) -> Error {
        Error::Envelope(format!(
            "{} support requires the `compression` feature",
            algorithm.as_str()
        ))
    }
}

/// A decoded envelope: model kind plus its raw (uncompressed) payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelEnvelope {
    kind: String,
    payload: Vec<u8>,
}

impl ModelEnvelope {
    /// Wrap a model payload.
    #[must_use]
    pub fn new(kind: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            kind: kind.into(),
            payload,
        }
    }

    /// Registered model kind.
    #[must_use]
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Uncompressed model payload.
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Serialize to bytes.
    ///
    /// # Errors
    ///
    /// Returns `Error::Envelope` if the kind or payload exceed the header field widths,
    /// or compression fails.
    pub fn encode(&self, compression: Compression) -> Result<Vec<u8>> {
        let kind_len = u16::try_from(self.kind.len())
            .map_err(|_| Error::Envelope("model kind longer than 65535 bytes".to_string()))?;
        let body = compression.compress(&self.payload)?;
        let body_len = u32::try_from(body.len())
            .map_err(|_| Error::Envelope("model payload larger than 4 GiB".to_string()))?;

        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.kind.len() + 4 + body.len());
        buf.put_slice(&MAGIC);
        buf.put_u8(VERSION);
        buf.put_u8(compression.tag());
        buf.put_u16_le(kind_len);
        buf.put_slice(self.kind.as_bytes());
        buf.put_u32_le(body_len);
        buf.put_slice(&body);
        Ok(Vec::from(buf.freeze()))
    }

    /// Parse bytes produced by [`ModelEnvelope::encode`].
    ///
    /// # Errors
    ///
    /// Returns `Error::Envelope` on bad magic, unsupported version, truncation,
    /// trailing bytes or decompression failure.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut buf = bytes;

        require(buf, MAGIC.len())?;
        if buf[..MAGIC.len()] != MAGIC {
            return Err(Error::Envelope("not a model envelope (bad magic)".to_string()));
        }
        buf.advance(MAGIC.len());

        require(buf, HEADER_LEN - MAGIC.len())?;
        let version = buf.get_u8();
        if version != VERSION {
            return Err(Error::Envelope(format!(
                "unsupported envelope version {version} (expected {VERSION})"
            )));
        }
        let compression = Compression::from_tag(buf.get_u8())?;
        let kind_len = usize::from(buf.get_u16_le());

        require(buf, kind_len + 4)?;
        let kind = std::str::from_utf8(&buf[..kind_len])
            .map_err(|_| Error::Envelope("model kind is not UTF-8".to_string()))?
            .to_string();
        buf.advance(kind_len);

        let body_len = buf.get_u32_le() as usize;
        require(buf, body_len)?;
        let body = &buf[..body_len];
        buf.advance(body_len);
        if buf.has_remaining() {
            return Err(Error::Envelope(format!(
                "{} trailing bytes after payload",
                buf.remaining()
            )));
        }

        Ok(Self {
            kind,
            payload: compression.decompress(body)?,
        })
    }
}

fn require(buf: &[u8], n: usize) -> Result<()> {
    if buf.remaining() < n {
        return Err(Error::Envelope("truncated envelope".to_string()));
    }
    Ok(())
}
