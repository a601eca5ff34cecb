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

use std::cell::Cell;
use std::io::{self, ErrorKind, Read};
use std::rc::Rc;

/// Shared byte accounting for a payload source.  The pipeline wraps the
/// source in further steps, so the totals are observed through this handle
/// rather than through the (moved) reader.
#[derive(Debug, Default)]
pub struct PayloadCounters {
    consumed: Cell<u64>,
    checksum: Cell<u32>,
}

impl PayloadCounters {
    pub fn consumed(&self) -> u64 {
        self.consumed.get()
    }

    /// Unsigned byte sum modulo 2^32 of everything read so far.
    pub fn checksum(&self) -> u32 {
        self.checksum.get()
    }
}

/// Source step: reads exactly the declared payload budget from an
/// underlying reader, updating the consumed count and byte-sum checksum.
/// EOF before the budget is exhausted is an error; the step reports EOF by
/// itself once the budget is consumed, so downstream steps never read into
/// the next archive entry.
pub struct PayloadReader<R: Read> {
    src: R,
    remaining: u64,
    counters: Rc<PayloadCounters>,
}

impl<R: Read> PayloadReader<R> {
    pub fn new(src: R, budget: u64) -> (Self, Rc<PayloadCounters>) {
        let counters = Rc::new(PayloadCounters::default());
        (
            Self {
                src,
                remaining: budget,
                counters: counters.clone(),
            },
            counters,
        )
    }
}

impl<R: Read> Read for PayloadReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() || self.remaining == 0 {
            return Ok(0);
        }
        let want = self.remaining.min(buf.len() as u64) as usize;
        let count = self.src.read(&mut buf[..want])?;
        if count == 0 {
            return Err(io::Error::new(
                ErrorKind::UnexpectedEof,
                format!("payload ends {} bytes early", self.remaining),
            ));
        }
        let mut sum = self.counters.checksum.get();
        for b in &buf[..count] {
            sum = sum.wrapping_add(*b as u32);
        }
        self.counters.checksum.set(sum);
        self.counters
            .consumed
            .set(self.counters.consumed.get() + count as u64);
        self.remaining -= count as u64;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stops_at_budget() {
        let data = [1u8, 2, 3, 4, 5, 6];
        let (mut reader, counters) = PayloadReader::new(&data[..], 4);
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out, &[1, 2, 3, 4]);
        assert_eq!(counters.consumed(), 4);
        assert_eq!(counters.checksum(), 10);
    }

    #[test]
    fn early_eof_is_an_error() {
        let data = [1u8, 2];
        let (mut reader, _) = PayloadReader::new(&data[..], 10);
        let mut out = Vec::new();
        let err = reader.read_to_end(&mut out).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnexpectedEof);
    }

    #[test]
    fn checksum_wraps() {
        let data = vec![0xffu8; 5];
        let (mut reader, counters) = PayloadReader::new(&data[..], 5);
        std::io::copy(&mut reader, &mut std::io::sink()).unwrap();
        assert_eq!(counters.checksum(), 5 * 0xff);
    }
}
