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

//! Pipeline assembly and the terminal consumers.
//!
//! The chain is always source -> [decrypt] -> [decompress] -> terminal.
//! The source accounts raw payload bytes (consumed count and byte-sum
//! checksum); the terminal hashes the plaintext it delivers, so a declared
//! SHA-256 always covers the post-decrypt, post-decompress byte stream.

use anyhow::{anyhow, Context, Result};
use openssl::hash::{Hasher, MessageDigest};
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::rc::Rc;

use crate::errors::UpdateError;
use crate::io::{
    parse_iv, AesKey, Compression, DecompressReader, DecryptReader, PayloadCounters,
    PayloadReader, STEP_BUFFER_SIZE,
};

pub const SHA256_LEN: usize = 32;

/// What the pipeline should do with one payload.
#[derive(Default)]
pub struct PipelineSpec<'a> {
    /// Declared payload length in the archive.
    pub size: u64,
    pub compression: Compression,
    pub encrypted: bool,
    /// Per-image IV override, hex encoded.
    pub iv_hex: Option<&'a str>,
    /// Expected plaintext SHA-256; `None` disables the check.
    pub sha256: Option<[u8; SHA256_LEN]>,
}

/// Lazily decoded plaintext of one payload.  Handlers pull from this; when
/// they are done the installer calls [`PlaintextReader::finish`], which
/// drains anything left, verifies the byte budget and the hash, and
/// reports the raw byte-sum for CRC-format entries.
pub struct PlaintextReader<'a> {
    inner: Box<dyn Read + 'a>,
    counters: Rc<PayloadCounters>,
    size: u64,
    hasher: Option<Hasher>,
    expected: Option<[u8; SHA256_LEN]>,
    progress: Option<Box<dyn FnMut(u32) + 'a>>,
    prevpercent: u32,
}

impl<'a> PlaintextReader<'a> {
    pub fn new<R: Read>(
        src: &'a mut R,
        spec: &PipelineSpec,
        aes: Option<&AesKey>,
        progress: Option<Box<dyn FnMut(u32) + 'a>>,
    ) -> Result<Self> {
        let (payload, counters) = PayloadReader::new(src, spec.size);
        let mut reader: Box<dyn Read + 'a> = Box::new(payload);

        if spec.encrypted {
            let key = aes.ok_or_else(|| {
                anyhow!(UpdateError::Transport(
                    "image is encrypted but no AES key is loaded".into()
                ))
            })?;
            let iv = match spec.iv_hex {
                Some(hex_iv) if !hex_iv.is_empty() => parse_iv(hex_iv).map_err(|e| {
                    anyhow!(UpdateError::Transport(format!("invalid image IV: {e}")))
                })?,
                _ => key.iv,
            };
            reader = Box::new(DecryptReader::new(reader, key, &iv)?);
        }
        reader = Box::new(DecompressReader::new(reader, spec.compression)?);

        let hasher = match spec.sha256 {
            Some(_) => Some(Hasher::new(MessageDigest::sha256()).context("initializing SHA-256")?),
            None => None,
        };

        Ok(Self {
            inner: reader,
            counters,
            size: spec.size,
            hasher,
            expected: spec.sha256,
            progress,
            prevpercent: 0,
        })
    }

    fn emit_progress(&mut self) {
        let percent = if self.size == 0 {
            100
        } else {
            (100 * self.counters.consumed() / self.size) as u32
        };
        if percent != self.prevpercent {
            self.prevpercent = percent;
            if let Some(cb) = self.progress.as_mut() {
                cb(percent);
            }
        }
    }

    /// Drain whatever the consumer left unread, then verify the byte
    /// budget and the plaintext hash.  The hash is finalized only here,
    /// after the last terminal write.
    pub fn finish(mut self) -> Result<CopyStats> {
        let mut written = 0u64;
        let mut buf = [0u8; STEP_BUFFER_SIZE];
        loop {
            match self.read(&mut buf).map_err(map_transport)? {
                0 => break,
                n => written += n as u64,
            }
        }

        if self.counters.consumed() != self.size {
            return Err(anyhow!(UpdateError::Integrity(format!(
                "short stream: consumed {} of {} payload bytes",
                self.counters.consumed(),
                self.size
            ))));
        }
        if let (Some(mut h), Some(expected)) = (self.hasher.take(), self.expected) {
            let computed = h.finish().context("finalizing digest")?;
            if computed.as_ref() != expected {
                return Err(anyhow!(UpdateError::Integrity(format!(
                    "SHA-256 mismatch: {} <--> {}",
                    hex::encode(expected),
                    hex::encode(&computed)
                ))));
            }
        }
        if self.prevpercent != 100 {
            if let Some(cb) = self.progress.as_mut() {
                cb(100);
            }
        }
        Ok(CopyStats {
            checksum: self.counters.checksum(),
            written,
        })
    }
}

impl Read for PlaintextReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let count = self.inner.read(buf)?;
        if count > 0 {
            if let Some(h) = self.hasher.as_mut() {
                h.update(&buf[..count])
                    .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
            }
            self.emit_progress();
        }
        Ok(count)
    }
}

/// Terminal consumer of the plaintext stream.
pub enum Sink<'a> {
    /// Hand each produced buffer to an install callback.
    Handler(&'a mut dyn FnMut(&[u8]) -> Result<()>),
    /// Write to a file, optionally starting at a byte offset.
    File { file: &'a mut File, seek: u64 },
    /// Validate only; used for pre-scans and entries the device skips.
    Discard,
}

#[derive(Debug)]
pub struct CopyStats {
    /// Byte sum over the raw payload, for CRC-format entry verification.
    pub checksum: u32,
    /// Plaintext bytes delivered (drained bytes included for `finish`).
    pub written: u64,
}

/// Run one payload through the pipeline into a sink.  `progress` fires on
/// every whole-percent advance of raw payload consumption and once more at
/// 100 after the final flush.
pub fn copy_payload<R: Read>(
    src: &mut R,
    spec: &PipelineSpec,
    aes: Option<&AesKey>,
    sink: Sink,
    progress: Option<Box<dyn FnMut(u32) + '_>>,
) -> Result<CopyStats> {
    let mut reader = PlaintextReader::new(src, spec, aes, progress)?;

    let mut sink = sink;
    if let Sink::File { file, seek } = &mut sink {
        if *seek > 0 {
            log::trace!("seeking output to offset {seek}");
            file.seek(SeekFrom::Start(*seek))
                .map_err(|e| anyhow!(UpdateError::Resource(format!("seek failed: {e}"))))?;
        }
    }

    let mut buf = [0u8; STEP_BUFFER_SIZE];
    let mut written = 0u64;
    loop {
        let count = reader.read(&mut buf).map_err(map_transport)?;
        if count == 0 {
            break;
        }
        match &mut sink {
            Sink::Handler(callback) => callback(&buf[..count])?,
            Sink::File { file, .. } => file.write_all(&buf[..count]).map_err(|e| {
                anyhow!(UpdateError::Resource(format!("writing image data: {e}")))
            })?,
            Sink::Discard => {}
        }
        written += count as u64;
    }

    let stats = reader.finish()?;
    Ok(CopyStats {
        checksum: stats.checksum,
        written,
    })
}

fn map_transport(e: io::Error) -> anyhow::Error {
    anyhow!(UpdateError::Transport(format!("pipeline read failed: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use openssl::sha::sha256;
    use std::io::Write as _;

    fn run(
        data: &[u8],
        spec: &PipelineSpec,
        aes: Option<&AesKey>,
    ) -> Result<(Vec<u8>, CopyStats, Vec<u32>)> {
        let mut src = data;
        let mut out = Vec::new();
        let mut percents = Vec::new();
        let stats = {
            let mut callback = |buf: &[u8]| {
                out.extend_from_slice(buf);
                Ok(())
            };
            copy_payload(
                &mut src,
                spec,
                aes,
                Sink::Handler(&mut callback),
                Some(Box::new(|p| percents.push(p))),
            )?
        };
        Ok((out, stats, percents))
    }

    #[test]
    fn plain_copy_with_hash() {
        let data: Vec<u8> = (0..=15u8).collect();
        let spec = PipelineSpec {
            size: data.len() as u64,
            sha256: Some(sha256(&data)),
            ..Default::default()
        };
        let (out, stats, percents) = run(&data, &spec, None).unwrap();
        assert_eq!(out, data);
        assert_eq!(stats.written, 16);
        assert_eq!(stats.checksum, data.iter().map(|b| *b as u32).sum::<u32>());
        assert_eq!(percents.last(), Some(&100));
        assert!(percents.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn hash_mismatch_is_integrity_error() {
        let data = vec![0u8; 64];
        let mut wrong = sha256(&data);
        wrong[0] ^= 0x01;
        let spec = PipelineSpec {
            size: 64,
            sha256: Some(wrong),
            ..Default::default()
        };
        let err = run(&data, &spec, None).unwrap_err();
        assert!(UpdateError::is_kind(&err, |e| {
            matches!(e, UpdateError::Integrity(_))
        }));
    }

    #[test]
    fn short_stream_detected() {
        let data = vec![0u8; 10];
        let spec = PipelineSpec {
            size: 20,
            ..Default::default()
        };
        let err = run(&data, &spec, None).unwrap_err();
        assert!(UpdateError::is_kind(&err, |e| {
            matches!(e, UpdateError::Transport(_))
        }));
    }

    #[test]
    fn gzip_payload_hashed_as_plaintext() {
        let plaintext = b"hello\n";
        let mut enc = GzEncoder::new(Vec::new(), flate2::Compression::default());
        enc.write_all(plaintext).unwrap();
        let compressed = enc.finish().unwrap();

        let spec = PipelineSpec {
            size: compressed.len() as u64,
            compression: Compression::Zlib,
            sha256: Some(sha256(plaintext)),
            ..Default::default()
        };
        let (out, stats, percents) = run(&compressed, &spec, None).unwrap();
        assert_eq!(out, plaintext);
        assert_eq!(stats.written, plaintext.len() as u64);
        assert_eq!(percents.last(), Some(&100));
    }

    #[test]
    fn encrypted_compressed_payload() {
        let plaintext: Vec<u8> = (0..50_000u32).map(|v| (v % 251) as u8).collect();
        let compressed = zstd::stream::encode_all(&plaintext[..], 3).unwrap();
        let key = AesKey::new(vec![0x24; 16], [0x31; 16]).unwrap();
        let ciphertext = openssl::symm::encrypt(
            openssl::symm::Cipher::aes_128_cbc(),
            &key.key,
            Some(&key.iv),
            &compressed,
        )
        .unwrap();

        let spec = PipelineSpec {
            size: ciphertext.len() as u64,
            compression: Compression::Zstd,
            encrypted: true,
            sha256: Some(sha256(&plaintext)),
            ..Default::default()
        };
        let (out, _, _) = run(&ciphertext, &spec, Some(&key)).unwrap();
        assert_eq!(out, plaintext);

        // missing key is a transport error
        let err = run(&ciphertext, &spec, None).unwrap_err();
        assert!(UpdateError::is_kind(&err, |e| {
            matches!(e, UpdateError::Transport(_))
        }));
    }

    #[test]
    fn iv_override() {
        let key = AesKey::new(vec![0x24; 16], [0u8; 16]).unwrap();
        let iv = [0x55u8; 16];
        let plaintext = b"per-image iv material".to_vec();
        let ciphertext = openssl::symm::encrypt(
            openssl::symm::Cipher::aes_128_cbc(),
            &key.key,
            Some(&iv),
            &plaintext,
        )
        .unwrap();

        let iv_hex = hex::encode(iv);
        let spec = PipelineSpec {
            size: ciphertext.len() as u64,
            encrypted: true,
            iv_hex: Some(&iv_hex),
            sha256: Some(sha256(&plaintext)),
            ..Default::default()
        };
        let (out, _, _) = run(&ciphertext, &spec, Some(&key)).unwrap();
        assert_eq!(out, plaintext);
    }

    #[test]
    fn partial_consumer_is_drained_by_finish() {
        let data: Vec<u8> = (0..100u8).collect();
        let spec = PipelineSpec {
            size: data.len() as u64,
            sha256: Some(sha256(&data)),
            ..Default::default()
        };
        let mut src = &data[..];
        let mut reader = PlaintextReader::new(&mut src, &spec, None, None).unwrap();
        let mut partial = [0u8; 10];
        reader.read_exact(&mut partial).unwrap();
        // the handler stopped early; finish still verifies everything
        let stats = reader.finish().unwrap();
        assert_eq!(stats.checksum, data.iter().map(|b| *b as u32).sum::<u32>());
    }

    #[test]
    fn tee_to_file_with_seek() {
        let data = b"0123456789".to_vec();
        let mut file = tempfile::tempfile().unwrap();
        let spec = PipelineSpec {
            size: data.len() as u64,
            ..Default::default()
        };
        let mut src = &data[..];
        copy_payload(
            &mut src,
            &spec,
            None,
            Sink::File {
                file: &mut file,
                seek: 4,
            },
            None,
        )
        .unwrap();
        let mut contents = Vec::new();
        file.rewind().unwrap();
        file.read_to_end(&mut contents).unwrap();
        assert_eq!(&contents[4..], &data[..]);
    }
}
