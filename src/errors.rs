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

//! Typed error kinds surfaced through `anyhow::Error`.
//!
//! Most failures are reported with `anyhow` context strings; the variants
//! here exist so that callers (and tests) can distinguish classes of
//! failure with `downcast_ref::<UpdateError>()` without parsing messages.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum UpdateError {
    /// Bundle framing is broken: bad magic, non-hex header field, missing
    /// trailer, or an entry name exceeding the supported length.
    #[error("malformed bundle: {0}")]
    BundleFormat(String),

    /// The manifest could not be parsed or lacks a mandatory field.
    #[error("manifest syntax: {0}")]
    ManifestSyntax(String),

    /// The manifest parsed but describes something we cannot install:
    /// unknown handler, incompatible hardware, link loop, undeclared hook.
    #[error("manifest semantics: {0}")]
    ManifestSemantic(String),

    /// Integrity verification failed: SHA-256 or byte-sum mismatch, short
    /// stream, invalid signature.
    #[error("integrity: {0}")]
    Integrity(String),

    /// A transport step failed: decrypt finalize, decompressor error,
    /// upstream EOF in the middle of a payload.
    #[error("transport: {0}")]
    Transport(String),

    /// A handler reported failure for an image.
    #[error("handler '{handler}' failed for '{image}'")]
    Handler { handler: String, image: String },

    /// Illegal persistent-state transition or a failed marker write.
    #[error("update state: {0}")]
    State(String),

    /// Out of space, file open/seek/write failure and friends.
    #[error("resource: {0}")]
    Resource(String),

    /// A control-socket conversation went wrong: bad magic, truncated
    /// record, unknown type, subprocess timeout.
    #[error("ipc: {0}")]
    Ipc(String),

    /// An installation is already running.
    #[error("Installation in progress")]
    Busy,
}

impl UpdateError {
    /// Whether an `anyhow::Error` chain bottoms out in this error kind.
    pub fn is_kind(err: &anyhow::Error, pred: fn(&UpdateError) -> bool) -> bool {
        err.downcast_ref::<UpdateError>().map_or(false, pred)
    }
}
