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

use anyhow::{Context, Result};
use clap::Parser;
use log4rs::append::console::{ConsoleAppender, Target};
use log4rs::append::file::FileAppender;
use log4rs::config::{Appender, Root};
use log4rs::encode::pattern::PatternEncoder;
use log4rs::filter::threshold::ThresholdFilter;
use std::sync::Arc;

use libupdagent::agent::UpdateAgent;
use libupdagent::cmdline::Args;
use libupdagent::handler::register_builtin_handlers;
use libupdagent::installer::run_update;
use libupdagent::ipc::{InstallRequest, RunMode, SourceType};
use libupdagent::controller;
use libupdagent::supervisor::ReadyBarrier;

const LOG_FILE: &str = "/var/log/update-agent.log";

fn init_logging(args: &Args) -> Result<()> {
    let stderr = ConsoleAppender::builder()
        .target(Target::Stderr)
        .encoder(Box::new(PatternEncoder::new("{l}: {m}{n}")))
        .build();
    let mut builder = log4rs::Config::builder().appender(
        Appender::builder()
            .filter(Box::new(ThresholdFilter::new(args.log_filter())))
            .build("stderr", Box::new(stderr)),
    );
    let mut root = Root::builder().appender("stderr");
    if args.file_log {
        let file = FileAppender::builder()
            .encoder(Box::new(PatternEncoder::new(
                "{d(%Y-%m-%d %H:%M:%S)} | {({l}):5.5} | {m}{n}",
            )))
            .build(LOG_FILE)
            .context("initializing file log")?;
        builder = builder.appender(Appender::builder().build("logfile", Box::new(file)));
        root = root.appender("logfile");
    }
    let config = builder
        .build(root.build(log::LevelFilter::Trace))
        .context("configuring logging")?;
    log4rs::init_config(config).context("initializing logging")?;
    Ok(())
}

fn run() -> Result<()> {
    let args = Args::parse();
    init_logging(&args)?;

    let config = args.to_config()?;
    let agent = UpdateAgent::new(config)?;
    register_builtin_handlers();

    match &args.image {
        // one-shot: install a local bundle and exit
        Some(path) => {
            let mut file = std::fs::File::open(path)
                .with_context(|| format!("opening bundle {}", path.display()))?;
            let mut request = InstallRequest::new();
            request.source = SourceType::Cli;
            if agent.config.dry_run {
                request.dry_run = RunMode::DryRun;
            }
            run_update(&agent, &mut file, &request)
        }
        // daemon: serve install requests over the control socket
        None => {
            // subscriber sockets can vanish at any time; errors are
            // handled at the write site
            unsafe {
                libc::signal(libc::SIGPIPE, libc::SIG_IGN);
            }
            let barrier = Arc::new(ReadyBarrier::new());
            let handles = controller::start(agent.clone(), barrier.clone())?;
            barrier.wait_all_ready();
            log::info!(
                "listening on {}",
                agent.config.ctrl_socket.display()
            );
            notify_startup(&agent);
            if agent.supervisor.has_children() {
                agent.supervisor.run_reaper();
            }
            for handle in handles.threads {
                let _ = handle.join();
            }
            Ok(())
        }
    }
}

fn notify_startup(agent: &UpdateAgent) {
    agent.notifier.notify(
        libupdagent::ipc::RecoveryStatus::Idle,
        0,
        libupdagent::ipc::NotifyLevel::Info,
        "Waiting for requests...",
    );
}

fn main() {
    if let Err(e) = run() {
        log::error!("{e:#}");
        std::process::exit(1);
    }
}
