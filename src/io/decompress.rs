// Copyright 2023 CoreOS, Inc.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use anyhow::{anyhow, Context, Result};
use flate2::read::GzDecoder;
use std::io::{self, BufReader, Read};
use std::str::FromStr;

use crate::errors::UpdateError;
use crate::io::STEP_BUFFER_SIZE;

/// Per-image transport compression declared in the manifest.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Compression {
    #[default]
    None,
    /// zlib with a gzip header (window bits 15+16)
    Zlib,
    Zstd,
}

impl FromStr for Compression {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "zlib" => Ok(Compression::Zlib),
            "zstd" => Ok(Compression::Zstd),
            other => Err(anyhow!(UpdateError::ManifestSemantic(format!(
                "compressed argument: '{other}' unknown"
            )))),
        }
    }
}

/// Transform step: streaming decompression.  On upstream EOF the decoder
/// drains its buffered output before reporting EOF itself.
pub enum DecompressReader<R: Read> {
    Plain(R),
    Gzip(GzDecoder<R>),
    Zstd(zstd::stream::read::Decoder<'static, BufReader<R>>),
}

impl<R: Read> DecompressReader<R> {
    pub fn new(source: R, compression: Compression) -> Result<Self> {
        Ok(match compression {
            Compression::None => DecompressReader::Plain(source),
            Compression::Zlib => DecompressReader::Gzip(GzDecoder::new(source)),
            Compression::Zstd => DecompressReader::Zstd(
                zstd::stream::read::Decoder::with_buffer(BufReader::with_capacity(
                    STEP_BUFFER_SIZE,
                    source,
                ))
                .context("creating zstd decoder")?,
            ),
        })
    }
}

impl<R: Read> Read for DecompressReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            DecompressReader::Plain(d) => d.read(buf),
            DecompressReader::Gzip(d) => d.read(buf),
            DecompressReader::Zstd(d) => d.read(buf),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use std::io::Write;

    #[test]
    fn unknown_tag_rejected() {
        let err = Compression::from_str("lzma").unwrap_err();
        assert!(UpdateError::is_kind(&err, |e| {
            matches!(e, UpdateError::ManifestSemantic(_))
        }));
        assert_eq!(Compression::from_str("zlib").unwrap(), Compression::Zlib);
        assert_eq!(Compression::from_str("zstd").unwrap(), Compression::Zstd);
    }

    #[test]
    fn gzip_roundtrip() {
        let plaintext = b"hello\n".repeat(10_000);
        let mut enc = GzEncoder::new(Vec::new(), flate2::Compression::default());
        enc.write_all(&plaintext).unwrap();
        let compressed = enc.finish().unwrap();

        let mut reader = DecompressReader::new(&compressed[..], Compression::Zlib).unwrap();
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out, plaintext);
    }

    #[test]
    fn zstd_roundtrip() {
        let plaintext: Vec<u8> = (0..200_000u32).map(|v| (v / 7) as u8).collect();
        let compressed = zstd::stream::encode_all(&plaintext[..], 3).unwrap();

        let mut reader = DecompressReader::new(&compressed[..], Compression::Zstd).unwrap();
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out, plaintext);
    }

    #[test]
    fn corrupt_gzip_stream_errors() {
        let mut compressed = {
            let mut enc = GzEncoder::new(Vec::new(), flate2::Compression::default());
            enc.write_all(b"payload").unwrap();
            enc.finish().unwrap()
        };
        let mid = compressed.len() / 2;
        compressed[mid] ^= 0xff;
        let mut reader = DecompressReader::new(&compressed[..], Compression::Zlib).unwrap();
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap_err();
    }
}
