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

use anyhow::{anyhow, bail, Context, Result};
use openssl::symm::{Cipher, Crypter, Mode};
use std::io::{self, ErrorKind, Read};

use crate::io::STEP_BUFFER_SIZE;

pub const AES_BLK_SIZE: usize = 16;

/// Process-wide AES material: key plus default IV.  Images may override
/// the IV individually.
#[derive(Clone, Debug)]
pub struct AesKey {
    pub key: Vec<u8>,
    pub iv: [u8; AES_BLK_SIZE],
}

impl AesKey {
    pub fn new(key: Vec<u8>, iv: [u8; AES_BLK_SIZE]) -> Result<Self> {
        cipher_for_len(key.len())?;
        Ok(Self { key, iv })
    }

    /// Parse key material in the key-file format: one line holding the hex
    /// key and the hex IV, whitespace separated.
    pub fn from_key_file_text(text: &str) -> Result<Self> {
        let mut words = text.split_whitespace();
        let key = words
            .next()
            .ok_or_else(|| anyhow!("missing key field"))
            .and_then(|w| hex::decode(w).context("decoding hex key"))?;
        let iv = words
            .next()
            .ok_or_else(|| anyhow!("missing IV field"))
            .and_then(|w| parse_iv(w))?;
        Self::new(key, iv)
    }
}

fn cipher_for_len(len: usize) -> Result<Cipher> {
    match len {
        16 => Ok(Cipher::aes_128_cbc()),
        24 => Ok(Cipher::aes_192_cbc()),
        32 => Ok(Cipher::aes_256_cbc()),
        n => bail!("unsupported AES key length {n} bytes"),
    }
}

pub fn parse_iv(hex_iv: &str) -> Result<[u8; AES_BLK_SIZE]> {
    let bytes = hex::decode(hex_iv).context("decoding hex IV")?;
    bytes
        .as_slice()
        .try_into()
        .map_err(|_| anyhow!("IV must be {AES_BLK_SIZE} bytes, got {}", bytes.len()))
}

/// Transform step: AES-CBC decryption.  On upstream EOF the cipher is
/// finalized, which may emit trailing plaintext from the last block.
pub struct DecryptReader<R: Read> {
    src: R,
    crypter: Crypter,
    inbuf: Box<[u8; STEP_BUFFER_SIZE]>,
    outbuf: Vec<u8>,
    outpos: usize,
    finalized: bool,
}

impl<R: Read> DecryptReader<R> {
    pub fn new(src: R, key: &AesKey, iv: &[u8; AES_BLK_SIZE]) -> Result<Self> {
        let cipher = cipher_for_len(key.key.len())?;
        let crypter = Crypter::new(cipher, Mode::Decrypt, &key.key, Some(iv))
            .context("initializing AES-CBC decryption")?;
        Ok(Self {
            src,
            crypter,
            inbuf: Box::new([0u8; STEP_BUFFER_SIZE]),
            outbuf: Vec::new(),
            outpos: 0,
            finalized: false,
        })
    }
}

impl<R: Read> Read for DecryptReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            if self.outpos < self.outbuf.len() {
                let count = (self.outbuf.len() - self.outpos).min(buf.len());
                buf[..count].copy_from_slice(&self.outbuf[self.outpos..self.outpos + count]);
                self.outpos += count;
                return Ok(count);
            }
            if self.finalized {
                return Ok(0);
            }
            let n = self.src.read(&mut self.inbuf[..])?;
            self.outbuf.resize(n + 2 * AES_BLK_SIZE, 0);
            self.outpos = 0;
            let produced = if n > 0 {
                self.crypter
                    .update(&self.inbuf[..n], &mut self.outbuf)
                    .map_err(|e| io::Error::new(ErrorKind::InvalidData, e))?
            } else {
                self.finalized = true;
                self.crypter
                    .finalize(&mut self.outbuf)
                    .map_err(|e| io::Error::new(ErrorKind::InvalidData, e))?
            };
            self.outbuf.truncate(produced);
        }
    }
}
