// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.
//! Message compressors, negotiated per stream by name.

use crate::status::Status;
use bytes::Bytes;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::{Read, Write};

/// Name of the no-op encoding.
pub const IDENTITY: &str = "identity";

/// A message compressor.
pub trait Compressor: Send + Sync + 'static {
    /// The encoding name sent in the `meshcall-encoding` header.
    fn name(&self) -> &str;
    /// Compresses a whole message.
    fn compress(&self, data: &[u8]) -> Result<Bytes, Status>;
    /// Returns a reader yielding the decompressed bytes of `data`.
    ///
    /// The framing layer bounds how much it reads, so implementations need not.
    fn decompressor<'a>(&self, data: &'a [u8]) -> Box<dyn Read + 'a>;
    /// A cheap estimate of the decompressed size, if the format records one.
    fn decompressed_size(&self, _data: &[u8]) -> Option<usize> {
        None
    }
}

/// Gzip compressor using [flate2](https://docs.rs/flate2).
#[derive(Debug, Clone, Copy)]
pub struct Gzip {
    level: Compression,
}

impl Gzip {
    /// Encoding name.
    pub const NAME: &'static str = "gzip";

    /// Creates a gzip compressor with the given level (0-9).
    pub fn with_level(level: u32) -> Self {
        Self {
            level: Compression::new(level.min(9)),
        }
    }
}

impl Default for Gzip {
    fn default() -> Self {
        Self { level: Compression::default() }
    }
}

impl Compressor for Gzip {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn compress(&self, data: &[u8]) -> Result<Bytes, Status> {
        let mut enc = GzEncoder::new(Vec::with_capacity(data.len() / 2 + 16), self.level);
        enc.write_all(data).map_err(|e| Status::internal(format!("gzip compress: {e}")))?;
        let out = enc.finish().map_err(|e| Status::internal(format!("gzip compress: {e}")))?;
        Ok(Bytes::from(out))
    }

    fn decompressor<'a>(&self, data: &'a [u8]) -> Box<dyn Read + 'a> {
        Box::new(GzDecoder::new(data))
    }

    fn decompressed_size(&self, data: &[u8]) -> Option<usize> {
        // ISIZE: the last four bytes of a gzip member, little endian
        let tail: [u8; 4] = data.len().checked_sub(4).and_then(|at| data[at..].try_into().ok())?;
        Some(u32::from_le_bytes(tail) as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gzip_round_trip_and_size_hint() {
        let gz = Gzip::default();
        let data = vec![b'm'; 4096];
        let packed = gz.compress(&data).unwrap();
        assert!(packed.len() < data.len());
        assert_eq!(gz.decompressed_size(&packed), Some(4096));
        let mut out = Vec::new();
        gz.decompressor(&packed).read_to_end(&mut out).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn test_size_hint_on_short_input() {
        assert_eq!(Gzip::default().decompressed_size(&[1, 2]), None);
    }
}
