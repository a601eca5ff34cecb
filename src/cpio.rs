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

//! Forward-only reader for the CPIO "new ASCII" framing of update bundles.
//!
//! Two header magics are accepted: `070701` (plain, checksum field ignored)
//! and `070702` (checksum field holds the unsigned byte sum of the payload
//! modulo 2^32).  Entry headers and names are padded to a 4-byte boundary,
//! the archive terminates with an entry named `TRAILER!!!`, and the file may
//! carry up to 512 bytes of zero padding after the trailer.

use anyhow::{anyhow, Context, Result};
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::poll::{poll, PollFd, PollFlags};
use std::io::Read;
use std::os::unix::io::RawFd;

use crate::errors::UpdateError;

/// Longest entry name we accept, NUL terminator included.
pub const MAX_IMAGE_FNAME: usize = 255;

pub const TRAILER_NAME: &str = "TRAILER!!!";

const HEADER_LEN: usize = 110;
const TRAILER_PAD: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpioFormat {
    /// `070701`: checksum field is ignored.
    NewAscii,
    /// `070702`: checksum field must match the payload byte sum.
    CrcAscii,
}

#[derive(Debug, Clone)]
pub struct EntryHeader {
    pub format: CpioFormat,
    pub size: u64,
    pub namesize: usize,
    pub checksum: u32,
}

/// One located archive entry.  `payload_offset` is the absolute stream
/// offset of the first payload byte.
#[derive(Debug, Clone)]
pub struct Entry {
    pub name: String,
    pub format: CpioFormat,
    pub size: u64,
    pub checksum: u32,
    pub payload_offset: u64,
}

impl Entry {
    /// Check a computed payload byte sum against the header.  Plain
    /// new-ASCII entries never fail this check.
    pub fn verify_checksum(&self, computed: u32) -> Result<()> {
        if self.format == CpioFormat::CrcAscii && computed != self.checksum {
            return Err(anyhow!(UpdateError::Integrity(format!(
                "'{}': byte sum {:#x}, header says {:#x}",
                self.name, computed, self.checksum
            ))));
        }
        Ok(())
    }
}

pub struct BundleReader<R: Read> {
    src: R,
    offset: u64,
}

impl<R: Read> BundleReader<R> {
    pub fn new(src: R) -> Self {
        Self { src, offset: 0 }
    }

    /// Absolute offset of the next byte to be read.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn into_inner(self) -> R {
        self.src
    }

    fn fill(&mut self, buf: &mut [u8], what: &str) -> Result<()> {
        let len = buf.len();
        self.read_exact(buf).map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                anyhow!(UpdateError::BundleFormat(format!(
                    "EOF reading {what} at offset {}",
                    self.offset
                )))
            } else {
                anyhow::Error::new(e).context(format!("reading {len} bytes of {what}"))
            }
        })
    }

    /// Parse the fixed-width entry header at the current position.
    pub fn read_header(&mut self) -> Result<EntryHeader> {
        let mut buf = [0u8; HEADER_LEN];
        self.fill(&mut buf, "entry header")?;

        let format = match &buf[0..6] {
            b"070701" => CpioFormat::NewAscii,
            b"070702" => CpioFormat::CrcAscii,
            other => {
                return Err(anyhow!(UpdateError::BundleFormat(format!(
                    "unrecognized magic {:?}",
                    String::from_utf8_lossy(other)
                ))))
            }
        };
        // fields after the magic are 8-digit ASCII hex:
        // ino mode uid gid nlink mtime filesize devmaj devmin rdevmaj
        // rdevmin namesize chksum
        let field = |idx: usize| -> Result<u32> {
            let off = 6 + idx * 8;
            let s = std::str::from_utf8(&buf[off..off + 8])
                .ok()
                .filter(|s| s.chars().all(|c| c.is_ascii_hexdigit()))
                .ok_or_else(|| {
                    anyhow!(UpdateError::BundleFormat(format!(
                        "header field {idx} is not hexadecimal"
                    )))
                })?;
            u32::from_str_radix(s, 16)
                .map_err(|_| anyhow!(UpdateError::BundleFormat("header field overflow".into())))
        };
        let size = field(6)? as u64;
        let namesize = field(11)? as usize;
        let checksum = field(12)?;
        if namesize >= MAX_IMAGE_FNAME {
            return Err(anyhow!(UpdateError::BundleFormat(format!(
                "entry name length {namesize} exceeds maximum {MAX_IMAGE_FNAME}"
            ))));
        }
        Ok(EntryHeader {
            format,
            size,
            namesize,
            checksum,
        })
    }

    /// Read the next entry header and name, leaving the stream positioned
    /// at the first payload byte.  Returns `None` at the trailer.
    pub fn next_entry(&mut self) -> Result<Option<Entry>> {
        let header = self.read_header()?;
        let mut name = vec![0u8; header.namesize];
        self.fill(&mut name, "entry name")?;
        let name = match name.iter().position(|b| *b == 0) {
            Some(n) => String::from_utf8_lossy(&name[..n]).into_owned(),
            None => {
                return Err(anyhow!(UpdateError::BundleFormat(
                    "entry name is not NUL-terminated".into()
                )))
            }
        };
        self.align()?;
        if name == TRAILER_NAME {
            return Ok(None);
        }
        Ok(Some(Entry {
            name,
            format: header.format,
            size: header.size,
            checksum: header.checksum,
            payload_offset: self.offset,
        }))
    }

    /// Consume padding up to the next 4-byte boundary.
    pub fn align(&mut self) -> Result<()> {
        let pad = (4 - (self.offset % 4) as usize) % 4;
        if pad > 0 {
            let mut buf = [0u8; 4];
            self.fill(&mut buf[..pad], "alignment padding")?;
        }
        Ok(())
    }

    /// Read and discard an entry payload, verifying the stored checksum.
    /// Returns the computed byte sum.
    pub fn skip_payload(&mut self, entry: &Entry) -> Result<u32> {
        let mut remaining = entry.size;
        let mut checksum = 0u32;
        let mut buf = [0u8; 4096];
        while remaining > 0 {
            let want = remaining.min(buf.len() as u64) as usize;
            let count = self
                .read(&mut buf[..want])
                .with_context(|| format!("reading payload of '{}'", entry.name))?;
            if count == 0 {
                return Err(anyhow!(UpdateError::Transport(format!(
                    "EOF inside payload of '{}', {remaining} bytes missing",
                    entry.name
                ))));
            }
            for b in &buf[..count] {
                checksum = checksum.wrapping_add(*b as u32);
            }
            remaining -= count as u64;
        }
        entry.verify_checksum(checksum)?;
        self.align()?;
        Ok(checksum)
    }

    /// Forward pre-scan of a complete archive: enumerate every entry with
    /// its payload offset and verify the per-entry checksums.  Leaves the
    /// stream just past the trailer.
    pub fn locate(&mut self) -> Result<Vec<Entry>> {
        let mut entries = Vec::new();
        while let Some(entry) = self.next_entry()? {
            self.skip_payload(&entry)?;
            entries.push(entry);
        }
        Ok(entries)
    }
}

impl<R: Read> Read for BundleReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let count = self.src.read(buf)?;
        self.offset += count as u64;
        Ok(count)
    }
}

/// Best-effort drain of the up-to-512-byte zero padding that follows the
/// trailer.  The peer may be a socket that never sends the padding, so the
/// fd is switched to non-blocking and polled with a 1-second budget; any
/// bytes beyond the padding stay unread.
pub fn drain_trailer_padding(fd: RawFd) {
    let old = match fcntl(fd, FcntlArg::F_GETFL) {
        Ok(flags) => OFlag::from_bits_truncate(flags),
        Err(_) => return,
    };
    if fcntl(fd, FcntlArg::F_SETFL(old | OFlag::O_NONBLOCK)).is_err() {
        return;
    }

    let mut remaining = TRAILER_PAD;
    let mut buf = [0u8; TRAILER_PAD];
    log::trace!("expecting up to {TRAILER_PAD} padding bytes at end of bundle");
    while remaining > 0 {
        let mut pfd = [PollFd::new(fd, PollFlags::POLLIN)];
        match poll(&mut pfd, 1000) {
            Ok(n) if n > 0 => {}
            _ => break,
        }
        match nix::unistd::read(fd, &mut buf[..remaining]) {
            Ok(0) | Err(_) => break,
            Ok(n) => remaining -= n,
        }
    }

    let _ = fcntl(fd, FcntlArg::F_SETFL(old));
}

#[cfg(test)]
pub(crate) mod testutil {
    //! In-memory archive builder for tests.

    /// Append one archive entry; `crc` selects the `070702` format with a
    /// correct (or overridden) checksum field.
    pub fn push_entry(out: &mut Vec<u8>, name: &str, data: &[u8], crc: bool, bad_sum: Option<u32>) {
        let sum: u32 = if crc {
            bad_sum.unwrap_or_else(|| data.iter().fold(0u32, |a, b| a.wrapping_add(*b as u32)))
        } else {
            0
        };
        let magic = if crc { "070702" } else { "070701" };
        let namesize = name.len() + 1;
        out.extend_from_slice(magic.as_bytes());
        for value in [
            0u32,
            0o100_644,
            0,
            0,
            1,
            0,
            data.len() as u32,
            0,
            0,
            0,
            0,
            namesize as u32,
            sum,
        ] {
            out.extend_from_slice(format!("{value:08x}").as_bytes());
        }
        out.extend_from_slice(name.as_bytes());
        out.push(0);
        while out.len() % 4 != 0 {
            out.push(0);
        }
        out.extend_from_slice(data);
        while out.len() % 4 != 0 {
            out.push(0);
        }
    }

    /// Build a complete archive from (name, payload) pairs, trailer and
    /// 512-byte end padding included.
    pub fn archive(entries: &[(&str, &[u8])], crc: bool) -> Vec<u8> {
        let mut out = Vec::new();
        for (name, data) in entries {
            push_entry(&mut out, name, data, crc, None);
        }
        push_entry(&mut out, super::TRAILER_NAME, b"", false, None);
        while out.len() % 512 != 0 {
            out.push(0);
        }
        out
    }
}
