//! Access token compression.
//!
//! Large access tokens are deflated and base64url-encoded behind a fixed
//! marker. A signed JWT always begins with `eyJ` (the encoded `{"`), so the
//! marker can never collide with an uncompressed token.
//!
//! Decompression is hard-capped: a forged bearer token is attacker input, and
//! deflate ratios above 1000:1 make an unbounded inflate a memory exhaustion
//! vector.

use std::borrow::Cow;
use std::io::{Read, Write};

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use flate2::Compression;
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;

/// Prefix identifying a compressed token. Valid in an RFC 6750 `b64token`.
pub const COMPRESSION_MARKER: &str = "~Z";

/// Errors raised by the codec.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Decompressed output exceeded the configured limit.
    #[error("Decompressed token exceeds {limit} bytes")]
    SizeLimit {
        /// The enforced limit in bytes.
        limit: usize,
    },

    /// The payload after the marker is not valid base64url.
    #[error("Invalid compressed encoding: {0}")]
    Encoding(#[from] base64::DecodeError),

    /// The deflate stream is corrupt or compression failed.
    #[error("Compression stream error: {0}")]
    Stream(#[from] std::io::Error),

    /// The decompressed bytes are not UTF-8.
    #[error("Decompressed token is not UTF-8")]
    NotUtf8,
}

/// Returns true if `token` carries the compression marker.
#[must_use]
pub fn is_compressed(token: &str) -> bool {
    token.starts_with(COMPRESSION_MARKER)
}

/// Compresses `text` into a marked token.
///
/// # Errors
///
/// Returns `CodecError::Stream` if the deflate encoder fails.
pub fn compress(text: &str) -> Result<String, CodecError> {
    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::best());
    encoder.write_all(text.as_bytes())?;
    let deflated = encoder.finish()?;

    let mut token = String::with_capacity(COMPRESSION_MARKER.len() + deflated.len() * 4 / 3 + 4);
    token.push_str(COMPRESSION_MARKER);
    URL_SAFE_NO_PAD.encode_string(&deflated, &mut token);
    Ok(token)
}

/// Decompresses `token` if it is marked, otherwise returns it unchanged.
///
/// At most `limit` bytes are ever inflated; one extra byte is read to detect
/// overflow instead of allocating the full payload.
///
/// # Errors
///
/// Returns `CodecError::SizeLimit` if the output would exceed `limit`, and
/// other variants for malformed input.
pub fn decompress_if_marked(token: &str, limit: usize) -> Result<Cow<'_, str>, CodecError> {
    let Some(encoded) = token.strip_prefix(COMPRESSION_MARKER) else {
        return Ok(Cow::Borrowed(token));
    };

    let deflated = URL_SAFE_NO_PAD.decode(encoded)?;
    let mut decoder = DeflateDecoder::new(deflated.as_slice()).take(limit as u64 + 1);

    let mut out = Vec::with_capacity(limit.min(deflated.len().saturating_mul(4)));
    decoder.read_to_end(&mut out)?;
    if out.len() > limit {
        return Err(CodecError::SizeLimit { limit });
    }

    String::from_utf8(out)
        .map(Cow::Owned)
        .map_err(|_| CodecError::NotUtf8)
}
