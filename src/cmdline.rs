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

// Args are listed in --help in the order declared in this struct.
// Please keep the entire help text to 80 columns.

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::path::PathBuf;

use crate::agent::AgentConfig;
use crate::manifest::Selection;

#[derive(Debug, Parser)]
#[clap(version)]
#[clap(about = "Streaming software-update agent for embedded Linux devices")]
pub struct Args {
    /// Read agent settings from this configuration file
    #[clap(short = 'f', long = "config", value_name = "FILE")]
    pub config: Option<PathBuf>,
    /// Install this bundle and exit instead of running as a daemon
    #[clap(short = 'i', long = "image", value_name = "FILE")]
    pub image: Option<PathBuf>,
    /// Verify the bundle without touching the device
    #[clap(short = 'c', long = "check")]
    pub check: bool,
    /// Software set and running mode to install, e.g. stable,main
    #[clap(short = 'e', long = "select", value_name = "SET,MODE")]
    pub select: Option<String>,
    /// Parse and verify but do not install
    #[clap(short = 'n', long = "dry-run")]
    pub dry_run: bool,
    /// Cache the incoming bundle to this file before installing
    #[clap(short = 'o', long = "output", value_name = "FILE")]
    pub output: Option<PathBuf>,
    /// Public key for verifying the manifest signature
    #[clap(short = 'k', long = "key", value_name = "FILE")]
    pub public_key: Option<PathBuf>,
    /// AES key file ("<hex key> <hex iv>") for encrypted images
    #[clap(short = 'K', long = "aes-key", value_name = "FILE")]
    pub aes_key: Option<PathBuf>,
    /// Refuse bundles with a version lower than this one
    #[clap(short = 'N', long = "no-downgrading", value_name = "VERSION")]
    pub no_downgrading: Option<String>,
    /// Refuse to reinstall this exact version
    #[clap(short = 'R', long = "no-reinstalling", value_name = "VERSION")]
    pub no_reinstalling: Option<String>,
    /// Do not record the bootloader transaction marker
    #[clap(short = 'M', long = "no-transaction-marker")]
    pub no_transaction_marker: bool,
    /// Do not record the bootloader state marker
    #[clap(short = 'm', long = "no-state-marker")]
    pub no_state_marker: bool,
    /// Bootloader backend: none, or env:<path>
    #[clap(short = 'B', long = "bootloader", value_name = "BACKEND")]
    pub bootloader: Option<String>,
    /// Log threshold: 0=off 1=error 2=warn 3=info 4=debug 5=trace
    #[clap(short = 'l', long = "loglevel", value_name = "LEVEL")]
    pub loglevel: Option<u8>,
    /// Shortcut for --loglevel 4
    #[clap(short = 'v', long = "verbose")]
    pub verbose: bool,
    /// Also append log output to the persistent log file
    #[clap(short = 'L', long = "file-log")]
    pub file_log: bool,
}

impl Args {
    pub fn log_filter(&self) -> log::LevelFilter {
        use log::LevelFilter::*;
        if let Some(level) = self.loglevel {
            return match level {
                0 => Off,
                1 => Error,
                2 => Warn,
                3 => Info,
                4 => Debug,
                _ => Trace,
            };
        }
        if self.verbose {
            Debug
        } else {
            Info
        }
    }

    /// Resolve the effective configuration: defaults, then the config
    /// file, then command-line overrides.
    pub fn to_config(&self) -> Result<AgentConfig> {
        let mut config = AgentConfig::default();
        if let Some(path) = &self.config {
            config
                .merge_file(path)
                .with_context(|| format!("loading {}", path.display()))?;
        }

        if let Some(select) = &self.select {
            config.selection = parse_selection(select)?;
        }
        if let Some(output) = &self.output {
            config.output = Some(output.clone());
        }
        if let Some(key) = &self.public_key {
            config.public_key = Some(key.clone());
        }
        if let Some(key) = &self.aes_key {
            config.aes_key_file = Some(key.clone());
        }
        if let Some(version) = &self.no_downgrading {
            config.minimum_version = Some(version.clone());
        }
        if let Some(version) = &self.no_reinstalling {
            config.current_version = Some(version.clone());
        }
        if let Some(bootloader) = &self.bootloader {
            config.bootloader = bootloader.clone();
        }
        config.no_transaction_marker |= self.no_transaction_marker;
        config.no_state_marker |= self.no_state_marker;
        config.dry_run = self.dry_run || self.check;
        Ok(config)
    }
}

fn parse_selection(text: &str) -> Result<Selection> {
    match text.split_once(',') {
        Some((set, mode)) if !set.is_empty() && !mode.is_empty() => Ok(Selection {
            software_set: set.to_string(),
            running_mode: mode.to_string(),
        }),
        _ => bail!("selection must be given as <software-set>,<running-mode>"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selection_parsing() {
        let sel = parse_selection("stable,main").unwrap();
        assert_eq!(sel.software_set, "stable");
        assert_eq!(sel.running_mode, "main");
        parse_selection("stable").unwrap_err();
        parse_selection(",main").unwrap_err();
    }

    #[test]
    fn check_implies_dry_run() {
        let args = Args::parse_from(["update-agent", "-c", "-i", "/tmp/b.swu"]);
        let config = args.to_config().unwrap();
        assert!(config.dry_run);
    }

    #[test]
    fn log_filter_mapping() {
        let args = Args::parse_from(["update-agent"]);
        assert_eq!(args.log_filter(), log::LevelFilter::Info);
        let args = Args::parse_from(["update-agent", "-v"]);
        assert_eq!(args.log_filter(), log::LevelFilter::Debug);
        let args = Args::parse_from(["update-agent", "-l", "0"]);
        assert_eq!(args.log_filter(), log::LevelFilter::Off);
        let args = Args::parse_from(["update-agent", "-l", "5"]);
        assert_eq!(args.log_filter(), log::LevelFilter::Trace);
    }

    #[test]
    fn cli_overrides_config_defaults() {
        let args = Args::parse_from([
            "update-agent",
            "-B",
            "env:/tmp/bootenv",
            "-N",
            "2.0",
            "-e",
            "stable,main",
            "-M",
        ]);
        let config = args.to_config().unwrap();
        assert_eq!(config.bootloader, "env:/tmp/bootenv");
        assert_eq!(config.minimum_version, Some("2.0".into()));
        assert_eq!(config.selection.software_set, "stable");
        assert!(config.no_transaction_marker);
        assert!(!config.no_state_marker);
    }
}
