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

//! Process-wide agent context.
//!
//! Everything the installer and controller share lives here: parsed
//! configuration, key material, the bootloader backend, the notification
//! and progress hubs, and the temp workspace for extracted files.

use anyhow::{anyhow, Context, Result};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use crate::errors::UpdateError;
use crate::io::AesKey;
use crate::manifest::syntax::{syntax_for, Syntax};
use crate::manifest::{BoardInfo, Selection, SwVersion};
use crate::notify::Notifier;
use crate::progress::Progress;
use crate::state::{Bootloader, EnvFileBootloader, Markers, NullBootloader};
use crate::supervisor::Supervisor;
use crate::version::compare_versions;

pub const DEFAULT_SW_VERSIONS_FILE: &str = "/etc/sw-versions";
pub const DEFAULT_HWREVISION_FILE: &str = "/etc/hwrevision";

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub ctrl_socket: PathBuf,
    pub progress_socket: PathBuf,
    /// Base directory for extracted files and scripts.
    pub tmpdir: PathBuf,
    pub public_key: Option<PathBuf>,
    pub aes_key_file: Option<PathBuf>,
    /// Cache the incoming bundle here before installing (`-o`).
    pub output: Option<PathBuf>,
    pub dry_run: bool,
    pub selection: Selection,
    /// Allowed `set,mode` selections; empty means unrestricted.
    pub accepted_selections: Vec<String>,
    /// Reject bundles older than this version.
    pub minimum_version: Option<String>,
    /// Reject bundles newer than this version.
    pub maximum_version: Option<String>,
    /// Reject reinstalling this exact version.
    pub current_version: Option<String>,
    pub no_transaction_marker: bool,
    pub no_state_marker: bool,
    /// Bootloader backend: `none`, or `env:<path>` for a file-backed
    /// environment.
    pub bootloader: String,
    pub sw_versions_file: PathBuf,
    pub hwrevision_file: PathBuf,
    /// Namespace prefix for persistent agent variables.
    pub vars_namespace: String,
    pub preupdate_cmd: String,
    pub postupdate_cmd: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        let rundir = std::env::temp_dir();
        Self {
            ctrl_socket: socket_path_from_env("UPDATE_AGENT_CTRL_SOCKET", "update-agent-ctrl"),
            progress_socket: socket_path_from_env(
                "UPDATE_AGENT_PROGRESS_SOCKET",
                "update-agent-progress",
            ),
            tmpdir: rundir,
            public_key: None,
            aes_key_file: None,
            output: None,
            dry_run: false,
            selection: Selection::default(),
            accepted_selections: Vec::new(),
            minimum_version: None,
            maximum_version: None,
            current_version: None,
            no_transaction_marker: false,
            no_state_marker: false,
            bootloader: "none".to_string(),
            sw_versions_file: DEFAULT_SW_VERSIONS_FILE.into(),
            hwrevision_file: DEFAULT_HWREVISION_FILE.into(),
            vars_namespace: "main".to_string(),
            preupdate_cmd: String::new(),
            postupdate_cmd: String::new(),
        }
    }
}

fn socket_path_from_env(var: &str, default_name: &str) -> PathBuf {
    match std::env::var_os(var) {
        Some(path) => PathBuf::from(path),
        None => std::env::temp_dir().join(default_name),
    }
}

impl AgentConfig {
    /// Merge settings from a configuration file (same syntaxes as the
    /// manifest) into this configuration.  Command-line arguments applied
    /// afterwards take precedence.
    pub fn merge_file(&mut self, path: &Path) -> Result<()> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading configuration {}", path.display()))?;
        let syntax = syntax_for(&text);
        let root = syntax.parse(&text)?;
        let globals = match syntax.get_child(&root, "globals") {
            Some(globals) => globals,
            None => return Ok(()),
        };
        let string = |name: &str| syntax.field_string(globals, Some(name));
        let flag = |name: &str| syntax.field_bool(globals, Some(name)).unwrap_or(false);

        if let Some(v) = string("public-key-file") {
            self.public_key = Some(v.into());
        }
        if let Some(v) = string("aes-key-file") {
            self.aes_key_file = Some(v.into());
        }
        if let Some(v) = string("bootloader") {
            self.bootloader = v;
        }
        if let Some(v) = string("tmpdir") {
            self.tmpdir = v.into();
        }
        if let Some(v) = string("no-downgrading") {
            self.minimum_version = Some(v);
        }
        if let Some(v) = string("max-version") {
            self.maximum_version = Some(v);
        }
        if let Some(v) = string("no-reinstalling") {
            self.current_version = Some(v);
        }
        if let Some(v) = string("namespace-for-vars") {
            self.vars_namespace = v;
        }
        if let Some(v) = string("preupdatecmd") {
            self.preupdate_cmd = v;
        }
        if let Some(v) = string("postupdatecmd") {
            self.postupdate_cmd = v;
        }
        self.no_transaction_marker |= flag("no-transaction-marker");
        self.no_state_marker |= flag("no-state-marker");

        if let Some(accepted) = syntax.get_child(&root, "accepted-selections") {
            for i in 0..syntax.array_len(accepted) {
                if let Some(sel) =
                    syntax.field_string(syntax.elem_at(accepted, i).unwrap(), None)
                {
                    self.accepted_selections.push(sel);
                }
            }
        }
        Ok(())
    }
}

pub struct UpdateAgent {
    pub config: AgentConfig,
    pub bootloader: Arc<dyn Bootloader>,
    pub markers: Markers,
    pub hw: BoardInfo,
    pub installed: Vec<SwVersion>,
    pub notifier: Arc<Notifier>,
    pub progress: Arc<Progress>,
    pub supervisor: Arc<Supervisor>,
    aes: RwLock<Option<AesKey>>,
    versions: RwLock<VersionRange>,
}

#[derive(Default, Clone)]
struct VersionRange {
    minimum: Option<String>,
    maximum: Option<String>,
    current: Option<String>,
}

impl UpdateAgent {
    pub fn new(config: AgentConfig) -> Result<Arc<Self>> {
        let bootloader: Arc<dyn Bootloader> = match config.bootloader.as_str() {
            "none" => Arc::new(NullBootloader),
            other => match other.strip_prefix("env:") {
                Some(path) => Arc::new(EnvFileBootloader::new(PathBuf::from(path))),
                None => {
                    return Err(anyhow!(UpdateError::State(format!(
                        "unknown bootloader backend '{other}'"
                    ))))
                }
            },
        };

        let aes = match &config.aes_key_file {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("reading AES key file {}", path.display()))?;
                Some(AesKey::from_key_file_text(&text)?)
            }
            None => None,
        };

        let hw = match std::fs::read_to_string(&config.hwrevision_file) {
            Ok(text) => BoardInfo::from_hwrevision_text(&text).unwrap_or_default(),
            Err(_) => {
                log::trace!("no hardware revision file, compatibility not enforced");
                BoardInfo::default()
            }
        };

        let installed = match std::fs::read_to_string(&config.sw_versions_file) {
            Ok(text) => parse_sw_versions(&text),
            Err(_) => Vec::new(),
        };

        let versions = VersionRange {
            minimum: config.minimum_version.clone(),
            maximum: config.maximum_version.clone(),
            current: config.current_version.clone(),
        };

        std::fs::create_dir_all(&config.tmpdir)
            .with_context(|| format!("creating workdir {}", config.tmpdir.display()))?;

        Ok(Arc::new(Self {
            markers: Markers {
                bootloader: bootloader.clone(),
            },
            bootloader,
            hw,
            installed,
            notifier: Arc::new(Notifier::new()),
            progress: Arc::new(Progress::new()),
            supervisor: Arc::new(Supervisor::new()),
            aes: RwLock::new(aes),
            versions: RwLock::new(versions),
            config,
        }))
    }

    pub fn aes_key(&self) -> Option<AesKey> {
        self.aes.read().unwrap().clone()
    }

    pub fn set_aes_key(&self, key_hex: &str, iv_hex: &str) -> Result<()> {
        let key = AesKey::from_key_file_text(&format!("{key_hex} {iv_hex}"))?;
        *self.aes.write().unwrap() = Some(key);
        Ok(())
    }

    /// Runtime update of the version gates (also reachable over IPC).
    pub fn set_version_range(&self, minimum: &str, maximum: &str, current: &str) {
        let mut versions = self.versions.write().unwrap();
        if !minimum.is_empty() {
            versions.minimum = Some(minimum.to_string());
        }
        if !maximum.is_empty() {
            versions.maximum = Some(maximum.to_string());
        }
        if !current.is_empty() {
            versions.current = Some(current.to_string());
        }
    }

    /// Enforce no-downgrade / no-reinstall / maximum-version policy
    /// against a bundle's declared version.
    pub fn check_version_gates(&self, bundle_version: &str) -> Result<()> {
        let versions = self.versions.read().unwrap().clone();
        if let Some(minimum) = &versions.minimum {
            if compare_versions(bundle_version, minimum).is_lt() {
                return Err(anyhow!(UpdateError::ManifestSemantic(format!(
                    "bundle version {bundle_version} is older than minimum {minimum}"
                ))));
            }
        }
        if let Some(maximum) = &versions.maximum {
            if compare_versions(bundle_version, maximum).is_gt() {
                return Err(anyhow!(UpdateError::ManifestSemantic(format!(
                    "bundle version {bundle_version} is newer than maximum {maximum}"
                ))));
            }
        }
        if let Some(current) = &versions.current {
            if compare_versions(bundle_version, current).is_eq() {
                return Err(anyhow!(UpdateError::ManifestSemantic(format!(
                    "bundle version {bundle_version} is already installed"
                ))));
            }
        }
        Ok(())
    }

    /// Whether an install request's selection is acceptable.  An empty
    /// accepted list leaves selections unrestricted.
    pub fn selection_allowed(&self, software_set: &str, running_mode: &str) -> bool {
        if software_set.is_empty() || running_mode.is_empty() {
            return true;
        }
        if self.config.accepted_selections.is_empty() {
            return true;
        }
        let wanted = format!("{software_set},{running_mode}");
        let allowed = self
            .config
            .accepted_selections
            .iter()
            .any(|sel| sel == &wanted);
        if allowed {
            log::info!("accepted selection {wanted}");
        } else {
            log::error!("selection {wanted} is not allowed, rejected");
        }
        allowed
    }

    /// Persistent agent variables, stored in the bootloader environment
    /// under a namespace prefix.
    pub fn set_var(&self, namespace: &str, name: &str, value: Option<&str>) -> Result<()> {
        let key = self.var_key(namespace, name);
        match value {
            Some(value) => self.bootloader.set(&key, value),
            None => self.bootloader.unset(&key),
        }
    }

    pub fn get_var(&self, namespace: &str, name: &str) -> Result<Option<String>> {
        self.bootloader.get(&self.var_key(namespace, name))
    }

    fn var_key(&self, namespace: &str, name: &str) -> String {
        let namespace = if namespace.is_empty() {
            &self.config.vars_namespace
        } else {
            namespace
        };
        format!("{namespace}.{name}")
    }

    /// Directory for files extracted from the current bundle.
    pub fn datadir(&self) -> PathBuf {
        self.config.tmpdir.join("datadst")
    }

    /// Directory for extracted scripts.
    pub fn scripts_dir(&self) -> PathBuf {
        self.config.tmpdir.join("scripts")
    }
}

fn parse_sw_versions(text: &str) -> Vec<SwVersion> {
    let mut versions = Vec::new();
    for line in text.lines() {
        let mut words = line.split_whitespace();
        if let (Some(name), Some(version)) = (words.next(), words.next()) {
            log::trace!("installed {name}: version {version}");
            versions.push(SwVersion {
                name: name.to_string(),
                version: version.to_string(),
            });
        }
    }
    versions
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;

    /// Agent wired to a scratch directory with a file-backed bootloader.
    pub fn test_agent() -> (Arc<UpdateAgent>, tempfile::TempDir) {
        let dir = tempfile::TempDir::new().unwrap();
        let config = AgentConfig {
            tmpdir: dir.path().join("work"),
            bootloader: format!("env:{}", dir.path().join("bootenv").display()),
            ctrl_socket: dir.path().join("ctrl.sock"),
            progress_socket: dir.path().join("progress.sock"),
            sw_versions_file: dir.path().join("sw-versions"),
            hwrevision_file: dir.path().join("hwrevision"),
            ..Default::default()
        };
        (UpdateAgent::new(config).unwrap(), dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_gates() {
        let (agent, _dir) = testutil::test_agent();
        agent.check_version_gates("1.0").unwrap();

        agent.set_version_range("2.0", "", "");
        agent.check_version_gates("1.9").unwrap_err();
        agent.check_version_gates("2.0").unwrap();

        agent.set_version_range("", "3.0", "");
        agent.check_version_gates("3.1").unwrap_err();

        agent.set_version_range("", "", "2.5");
        let err = agent.check_version_gates("2.5").unwrap_err();
        assert!(err.to_string().contains("already installed"));
        agent.check_version_gates("2.6").unwrap();
    }

    #[test]
    fn selections() {
        let (mut agent, _dir) = {
            let (a, d) = testutil::test_agent();
            (Arc::try_unwrap(a).ok().unwrap(), d)
        };
        assert!(agent.selection_allowed("", ""));
        assert!(agent.selection_allowed("any", "thing"));
        agent.config.accepted_selections = vec!["stable,main".into()];
        assert!(agent.selection_allowed("stable", "main"));
        assert!(!agent.selection_allowed("stable", "alt"));
        assert!(agent.selection_allowed("", ""));
    }

    #[test]
    fn agent_vars_roundtrip() {
        let (agent, _dir) = testutil::test_agent();
        agent.set_var("", "channel", Some("stable")).unwrap();
        assert_eq!(agent.get_var("", "channel").unwrap(), Some("stable".into()));
        assert_eq!(
            agent.get_var("main", "channel").unwrap(),
            Some("stable".into())
        );
        agent.set_var("", "channel", None).unwrap();
        assert_eq!(agent.get_var("", "channel").unwrap(), None);
    }

    #[test]
    fn aes_key_over_ipc() {
        let (agent, _dir) = testutil::test_agent();
        assert!(agent.aes_key().is_none());
        agent
            .set_aes_key(&"ab".repeat(32), &"cd".repeat(16))
            .unwrap();
        let key = agent.aes_key().unwrap();
        assert_eq!(key.key.len(), 32);
        agent.set_aes_key("zz", "yy").unwrap_err();
    }

    #[test]
    fn sw_versions_parsing() {
        let text = "app 1.0\nkernel 5.10.1\nmalformed\n";
        let list = parse_sw_versions(text);
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].name, "app");
        assert_eq!(list[1].version, "5.10.1");
    }

    #[test]
    fn config_file_merge() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("agent.cfg");
        std::fs::write(
            &path,
            r#"
            globals = {
                bootloader = "env:/tmp/env";
                no-downgrading = "1.0";
                namespace-for-vars = "updates";
            };
            accepted-selections = [ "stable,main", "factory,failsafe" ];
            "#,
        )
        .unwrap();
        let mut config = AgentConfig::default();
        config.merge_file(&path).unwrap();
        assert_eq!(config.bootloader, "env:/tmp/env");
        assert_eq!(config.minimum_version, Some("1.0".into()));
        assert_eq!(config.vars_namespace, "updates");
        assert_eq!(config.accepted_selections.len(), 2);
    }
}
