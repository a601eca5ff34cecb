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

//! The byte pipeline: a lazy, forward-only chain of `Read` steps that turns
//! raw archive payload bytes into plaintext for a consumer, transparently
//! applying decryption and decompression.

mod decompress;
mod decrypt;
mod payload;
mod pipeline;

pub use self::decompress::*;
pub use self::decrypt::*;
pub use self::payload::*;
pub use self::pipeline::*;

/// Step buffer size.  Each pipeline step keeps at most one buffered window
/// of this size.
pub const STEP_BUFFER_SIZE: usize = 16 * 1024;
