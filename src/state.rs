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

//! Persistent update state and the bootloader-environment abstraction.
//!
//! The agent records two markers in the bootloader environment: the
//! transaction marker ("an update is in progress", checked after power
//! loss) and the state marker (outcome of the last installation, consumed
//! by the boot logic for commit/rollback decisions).

use anyhow::{anyhow, Context, Result};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::errors::UpdateError;

/// Bootloader variable holding the state marker.
pub const STATE_KEY: &str = "ustate";
/// Bootloader variable holding the transaction marker.
pub const TRANSACTION_KEY: &str = "recovery_status";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateState {
    Ok,
    Installed,
    Testing,
    Failed,
    NotAvailable,
    Error,
    Wait,
    InProgress,
}

impl UpdateState {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpdateState::Ok => "0",
            UpdateState::Installed => "1",
            UpdateState::Testing => "2",
            UpdateState::Failed => "3",
            UpdateState::NotAvailable => "4",
            UpdateState::Error => "5",
            UpdateState::Wait => "6",
            UpdateState::InProgress => "7",
        }
    }

    pub fn from_str_value(s: &str) -> Option<Self> {
        Some(match s {
            "0" => UpdateState::Ok,
            "1" => UpdateState::Installed,
            "2" => UpdateState::Testing,
            "3" => UpdateState::Failed,
            "4" => UpdateState::NotAvailable,
            "5" => UpdateState::Error,
            "6" => UpdateState::Wait,
            "7" => UpdateState::InProgress,
            _ => return None,
        })
    }

    /// Legal state-machine transitions.
    pub fn can_transition_to(&self, next: UpdateState) -> bool {
        use UpdateState::*;
        matches!(
            (self, next),
            (Ok, InProgress)
                | (InProgress, Installed)
                | (InProgress, Failed)
                | (Installed, Testing)
                | (Testing, Ok)
                | (Testing, Failed)
        )
    }
}

impl fmt::Display for UpdateState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            UpdateState::Ok => "OK",
            UpdateState::Installed => "INSTALLED",
            UpdateState::Testing => "TESTING",
            UpdateState::Failed => "FAILED",
            UpdateState::NotAvailable => "NOT_AVAILABLE",
            UpdateState::Error => "ERROR",
            UpdateState::Wait => "WAIT",
            UpdateState::InProgress => "IN_PROGRESS",
        };
        f.write_str(name)
    }
}

/// Abstract bootloader environment.  Implementations persist variables
/// wherever the platform keeps them (U-Boot env, GRUB env block, EFI
/// variables); the agent only relies on these four operations.
pub trait Bootloader: Send + Sync {
    fn get(&self, name: &str) -> Result<Option<String>>;
    fn set(&self, name: &str, value: &str) -> Result<()>;
    fn unset(&self, name: &str) -> Result<()>;

    /// Apply a `name value` line file, as produced for boot scripts.
    fn apply_list(&self, file: &Path) -> Result<()> {
        let text = std::fs::read_to_string(file)
            .with_context(|| format!("reading bootloader script {}", file.display()))?;
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            match line.split_once(char::is_whitespace) {
                Some((name, value)) if !value.trim().is_empty() => {
                    self.set(name, value.trim())?
                }
                Some((name, _)) => self.unset(name)?,
                None => self.unset(line)?,
            }
        }
        Ok(())
    }
}

/// Bootloader that persists nothing.  Used when the platform has no
/// accessible environment; marker writes fail loudly only when markers
/// are required.
pub struct NullBootloader;

impl Bootloader for NullBootloader {
    fn get(&self, _name: &str) -> Result<Option<String>> {
        Ok(None)
    }

    fn set(&self, name: &str, _value: &str) -> Result<()> {
        Err(anyhow!(UpdateError::State(format!(
            "no bootloader backend to store '{name}'"
        ))))
    }

    fn unset(&self, _name: &str) -> Result<()> {
        Ok(())
    }
}

/// File-backed environment: a text file of `name=value` lines.  Suitable
/// for platforms where the boot logic reads a plain file, and for tests.
pub struct EnvFileBootloader {
    path: PathBuf,
    lock: Mutex<()>,
}

impl EnvFileBootloader {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            lock: Mutex::new(()),
        }
    }

    fn load(&self) -> Result<BTreeMap<String, String>> {
        let mut vars = BTreeMap::new();
        let text = match std::fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(vars),
            Err(e) => {
                return Err(e).with_context(|| format!("reading {}", self.path.display()))
            }
        };
        for line in text.lines() {
            if let Some((name, value)) = line.split_once('=') {
                vars.insert(name.to_string(), value.to_string());
            }
        }
        Ok(vars)
    }

    fn store(&self, vars: &BTreeMap<String, String>) -> Result<()> {
        let mut out = String::new();
        for (name, value) in vars {
            out.push_str(name);
            out.push('=');
            out.push_str(value);
            out.push('\n');
        }
        std::fs::write(&self.path, out)
            .with_context(|| format!("writing {}", self.path.display()))
    }
}

impl Bootloader for EnvFileBootloader {
    fn get(&self, name: &str) -> Result<Option<String>> {
        let _guard = self.lock.lock().unwrap();
        Ok(self.load()?.get(name).cloned())
    }

    fn set(&self, name: &str, value: &str) -> Result<()> {
        let _guard = self.lock.lock().unwrap();
        let mut vars = self.load()?;
        vars.insert(name.to_string(), value.to_string());
        self.store(&vars)
    }

    fn unset(&self, name: &str) -> Result<()> {
        let _guard = self.lock.lock().unwrap();
        let mut vars = self.load()?;
        vars.remove(name);
        self.store(&vars)
    }
}

/// Marker bookkeeping for one agent instance.
pub struct Markers {
    pub bootloader: std::sync::Arc<dyn Bootloader>,
}

impl Markers {
    /// Read the persistent update state; missing or unparsable values
    /// read as `NotAvailable`.
    pub fn get_state(&self) -> UpdateState {
        self.bootloader
            .get(STATE_KEY)
            .ok()
            .flatten()
            .and_then(|v| UpdateState::from_str_value(&v))
            .unwrap_or(UpdateState::NotAvailable)
    }

    /// Persist a new update state without transition checks.  The
    /// installer uses this: re-entering IN_PROGRESS from INSTALLED is
    /// normal when a device updates twice between reboots.
    pub fn set_state(&self, next: UpdateState) -> Result<()> {
        self.bootloader
            .set(STATE_KEY, next.as_str())
            .with_context(|| format!("storing update state {next}"))
    }

    /// Persist a new update state, enforcing the legal transitions.
    /// Used for state changes requested over IPC.  Transitions from
    /// `NotAvailable` are allowed so a first install can start from an
    /// unprovisioned environment.
    pub fn save_state(&self, next: UpdateState) -> Result<()> {
        let current = self.get_state();
        if current != next
            && current != UpdateState::NotAvailable
            && !current.can_transition_to(next)
        {
            return Err(anyhow!(UpdateError::State(format!(
                "illegal state transition {current} -> {next}"
            ))));
        }
        self.bootloader
            .set(STATE_KEY, next.as_str())
            .with_context(|| format!("storing update state {next}"))
    }

    pub fn set_transaction(&self, state: UpdateState) -> Result<()> {
        self.bootloader.set(TRANSACTION_KEY, state.as_str())
    }

    pub fn clear_transaction(&self) -> Result<()> {
        self.bootloader.unset(TRANSACTION_KEY)
    }

    pub fn transaction_is_set(&self) -> bool {
        matches!(self.bootloader.get(TRANSACTION_KEY), Ok(Some(_)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn transition_rules() {
        use UpdateState::*;
        assert!(Ok.can_transition_to(InProgress));
        assert!(InProgress.can_transition_to(Installed));
        assert!(InProgress.can_transition_to(Failed));
        assert!(Installed.can_transition_to(Testing));
        assert!(Testing.can_transition_to(Ok));
        assert!(Testing.can_transition_to(Failed));

        assert!(!Ok.can_transition_to(Installed));
        assert!(!Failed.can_transition_to(Testing));
        assert!(!Installed.can_transition_to(InProgress));
    }

    #[test]
    fn env_file_bootloader_roundtrip() {
        let dir = tempfile::TempDir::new().unwrap();
        let bl = EnvFileBootloader::new(dir.path().join("uboot.env"));
        assert_eq!(bl.get("bootpart").unwrap(), None);
        bl.set("bootpart", "2").unwrap();
        bl.set("serial", "abc").unwrap();
        assert_eq!(bl.get("bootpart").unwrap(), Some("2".into()));
        bl.unset("bootpart").unwrap();
        assert_eq!(bl.get("bootpart").unwrap(), None);
        assert_eq!(bl.get("serial").unwrap(), Some("abc".into()));
    }

    #[test]
    fn apply_list_sets_and_unsets() {
        let dir = tempfile::TempDir::new().unwrap();
        let bl = EnvFileBootloader::new(dir.path().join("env"));
        bl.set("todelete", "x").unwrap();
        let script = dir.path().join("bootscript");
        std::fs::write(&script, "bootpart 3\n# comment\ntodelete\n").unwrap();
        bl.apply_list(&script).unwrap();
        assert_eq!(bl.get("bootpart").unwrap(), Some("3".into()));
        assert_eq!(bl.get("todelete").unwrap(), None);
    }

    #[test]
    fn markers_enforce_transitions() {
        let dir = tempfile::TempDir::new().unwrap();
        let markers = Markers {
            bootloader: Arc::new(EnvFileBootloader::new(dir.path().join("env"))),
        };
        assert_eq!(markers.get_state(), UpdateState::NotAvailable);
        markers.save_state(UpdateState::InProgress).unwrap();
        markers.save_state(UpdateState::Installed).unwrap();
        markers.save_state(UpdateState::Testing).unwrap();
        markers.save_state(UpdateState::Ok).unwrap();
        let err = markers.save_state(UpdateState::Installed).unwrap_err();
        assert!(UpdateError::is_kind(&err, |e| {
            matches!(e, UpdateError::State(_))
        }));

        assert!(!markers.transaction_is_set());
        markers.set_transaction(UpdateState::InProgress).unwrap();
        assert!(markers.transaction_is_set());
        markers.clear_transaction().unwrap();
        assert!(!markers.transaction_is_set());
    }
}
