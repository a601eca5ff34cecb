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

//! Process-wide handler registry.
//!
//! A handler is a named callback that applies one image to its
//! destination.  The registry is populated once at startup; installation
//! looks handlers up by the image's declared name or, when none is set, by
//! a destination heuristic.

use anyhow::{anyhow, Result};
use lazy_static::lazy_static;
use std::collections::BTreeMap;
use std::io::Read;
use std::path::Path;
use std::sync::{Arc, RwLock};

use crate::errors::UpdateError;
use crate::manifest::ImageDescriptor;

pub const IMAGE_HANDLER: u32 = 1 << 0;
pub const FILE_HANDLER: u32 = 1 << 1;
pub const SCRIPT_HANDLER: u32 = 1 << 2;
pub const BOOTLOADER_HANDLER: u32 = 1 << 3;
/// Handler never receives a payload (e.g. partition shapers).
pub const NO_DATA_HANDLER: u32 = 1 << 4;

/// Script phase argument for script handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptPhase {
    Pre,
    Post,
    Fail,
}

impl ScriptPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScriptPhase::Pre => "pre",
            ScriptPhase::Post => "post",
            ScriptPhase::Fail => "fail",
        }
    }
}

/// Payload passed to a handler invocation.
pub enum HandlerData<'a> {
    /// Plaintext image stream from the byte pipeline.
    Stream(&'a mut dyn Read),
    /// Extracted script file plus the phase being run.
    Script(ScriptPhase, &'a Path),
    /// No payload.
    None,
}

pub type InstallFn = dyn Fn(&ImageDescriptor, &mut HandlerData) -> Result<()> + Send + Sync;

pub struct Handler {
    pub name: String,
    pub mask: u32,
    pub install: Box<InstallFn>,
}

impl std::fmt::Debug for Handler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handler")
            .field("name", &self.name)
            .field("mask", &self.mask)
            .finish()
    }
}

lazy_static! {
    static ref REGISTRY: RwLock<BTreeMap<String, Arc<Handler>>> = RwLock::new(BTreeMap::new());
}

/// Register a handler.  Registration is idempotent: the first entry for a
/// name wins, later ones are ignored.
pub fn register_handler<F>(name: &str, mask: u32, install: F)
where
    F: Fn(&ImageDescriptor, &mut HandlerData) -> Result<()> + Send + Sync + 'static,
{
    let mut registry = REGISTRY.write().unwrap();
    registry.entry(name.to_string()).or_insert_with(|| {
        Arc::new(Handler {
            name: name.to_string(),
            mask,
            install: Box::new(install),
        })
    });
}

#[cfg(test)]
pub fn unregister_handler(name: &str) {
    REGISTRY.write().unwrap().remove(name);
}

fn lookup(name: &str) -> Option<Arc<Handler>> {
    REGISTRY.read().unwrap().get(name).cloned()
}

/// Find the handler for an image: by declared name, or by destination
/// when the manifest left the handler unset (`ubivol` for volumes, `raw`
/// for block devices).
pub fn find_handler(image: &ImageDescriptor) -> Result<Arc<Handler>> {
    let name = if !image.handler.is_empty() {
        image.handler.as_str()
    } else if !image.volname.is_empty() {
        "ubivol"
    } else if !image.device.is_empty() {
        "raw"
    } else {
        return Err(anyhow!(UpdateError::ManifestSemantic(format!(
            "'{}' has neither a handler nor a destination",
            image.fname
        ))));
    };
    lookup(name).ok_or_else(|| {
        anyhow!(UpdateError::ManifestSemantic(format!(
            "handler '{}' for '{}' is not registered",
            name, image.fname
        )))
    })
}

/// All registered script handlers, for the pre/post/fail phases.
pub fn script_handlers() -> Vec<Arc<Handler>> {
    REGISTRY
        .read()
        .unwrap()
        .values()
        .filter(|h| h.mask & SCRIPT_HANDLER != 0)
        .cloned()
        .collect()
}

/// Built-in handlers.  Only the script runner ships with the agent; image
/// handlers for concrete storage backends register themselves from their
/// own modules at startup.
pub fn register_builtin_handlers() {
    register_handler("shellscript", SCRIPT_HANDLER, |image, data| {
        let (phase, path) = match data {
            HandlerData::Script(phase, path) => (*phase, *path),
            _ => {
                return Err(anyhow!(UpdateError::Handler {
                    handler: "shellscript".into(),
                    image: image.fname.clone(),
                }))
            }
        };
        let cmdline = format!("/bin/sh {} {}", path.display(), phase.as_str());
        let status = crate::supervisor::run_command(&cmdline)?;
        if status != 0 {
            log::error!(
                "script {} failed in phase {} with status {status}",
                image.fname,
                phase.as_str()
            );
            return Err(anyhow!(UpdateError::Handler {
                handler: "shellscript".into(),
                image: image.fname.clone(),
            }));
        }
        Ok(())
    });
}
