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

//! The installer orchestrator.
//!
//! Consumes an update bundle as a forward-only stream: the manifest
//! (first entry) is parsed, every further entry is classified against the
//! manifest lists and either copied to the temp workspace, installed
//! directly from the stream, or discarded with its checksum verified.
//! Once the stream ends, pre-install scripts run, remaining images are
//! installed from their temp copies, post-install scripts run, and the
//! bootloader variables are committed.

use anyhow::{anyhow, Context, Result};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek};
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::path::Path;

use crate::agent::UpdateAgent;
use crate::cpio::{drain_trailer_padding, BundleReader, Entry};
use crate::errors::UpdateError;
use crate::handler::{find_handler, HandlerData, ScriptPhase, NO_DATA_HANDLER};
use crate::io::{copy_payload, PipelineSpec, PlaintextReader, Sink};
use crate::ipc::{InstallRequest, NotifyLevel, RecoveryStatus, RunMode};
use crate::manifest::{
    check_hw_compatibility, parse_manifest, BundleDescriptor, ImageDescriptor, ParseContext,
    Selection, MANIFEST_NAME, MANIFEST_SIG_NAME,
};
use crate::state::UpdateState;
use crate::supervisor::run_command;
use crate::verify::SignatureVerifier;

/// Byte stream carrying a bundle.  The raw fd, when there is one, is used
/// for the non-blocking trailer-padding drain.
pub trait BundleSource: Read {
    fn raw_fd(&self) -> Option<RawFd> {
        None
    }
}

impl BundleSource for File {
    fn raw_fd(&self) -> Option<RawFd> {
        Some(self.as_raw_fd())
    }
}

impl BundleSource for UnixStream {
    fn raw_fd(&self) -> Option<RawFd> {
        Some(self.as_raw_fd())
    }
}

impl BundleSource for &[u8] {}

impl<T: BundleSource + ?Sized> BundleSource for &mut T {
    fn raw_fd(&self) -> Option<RawFd> {
        (**self).raw_fd()
    }
}

struct InstallContext {
    dry_run: bool,
    transaction_marker: bool,
    state_marker: bool,
    /// IN_PROGRESS has been recorded; failures from here on persist
    /// FAILED.
    in_progress: bool,
}

/// Run one installation attempt over `src`, driving notifications,
/// progress events, markers and cleanup.
pub fn run_update(
    agent: &UpdateAgent,
    src: &mut dyn BundleSource,
    request: &InstallRequest,
) -> Result<()> {
    agent.notifier.notify(
        RecoveryStatus::Start,
        0,
        NotifyLevel::Info,
        "Software update started",
    );

    std::fs::create_dir_all(agent.scripts_dir()).context("creating scripts directory")?;
    std::fs::create_dir_all(agent.datadir()).context("creating data directory")?;

    let mut ctx = InstallContext {
        dry_run: match request.dry_run {
            RunMode::DryRun => true,
            RunMode::Install => false,
            RunMode::Default => agent.config.dry_run,
        },
        transaction_marker: false,
        state_marker: false,
        in_progress: false,
    };

    let mut bundle = BundleDescriptor::default();
    let mut result = match &agent.config.output {
        Some(output) => match cache_stream(src, output) {
            Ok(mut file) => installation(agent, &mut file, request, &mut ctx, &mut bundle),
            Err(e) => Err(e),
        },
        None => installation(agent, src, request, &mut ctx, &mut bundle),
    };

    if result.is_ok() && !ctx.dry_run {
        result = (|| {
            if ctx.transaction_marker {
                agent
                    .markers
                    .clear_transaction()
                    .context("clearing transaction marker")?;
            }
            if ctx.state_marker {
                agent
                    .markers
                    .set_state(UpdateState::Installed)
                    .context("storing INSTALLED update state")?;
            }
            Ok(())
        })();
    }

    match &result {
        Ok(()) => {
            agent.notifier.notify(
                RecoveryStatus::Success,
                0,
                NotifyLevel::Info,
                "Software updated successfully",
            );
            agent.progress.end(RecoveryStatus::Success);
        }
        Err(e) => {
            if ctx.in_progress && !ctx.dry_run {
                if ctx.transaction_marker {
                    let _ = agent.markers.set_transaction(UpdateState::Failed);
                }
                if ctx.state_marker {
                    let _ = agent.markers.set_state(UpdateState::Failed);
                }
                // best effort recovery hooks; failures are only logged
                if run_scripts(&bundle.scripts, ScriptPhase::Fail, ctx.dry_run).is_err() {
                    log::warn!("post-failure scripts returned an error, ignoring");
                }
            }
            agent.notifier.notify(
                RecoveryStatus::Failure,
                1,
                NotifyLevel::Error,
                &format!("Installation failed: {e:#}"),
            );
            agent.progress.end(RecoveryStatus::Failure);
        }
    }

    cleanup_files(agent, &bundle);
    result
}

/// Everything from the first archive byte to the committed bootloader
/// variables.
fn installation(
    agent: &UpdateAgent,
    src: &mut dyn BundleSource,
    request: &InstallRequest,
    ctx: &mut InstallContext,
    bundle: &mut BundleDescriptor,
) -> Result<()> {
    let source_fd = src.raw_fd();
    let mut reader = BundleReader::new(src);

    // first entry: the manifest
    let entry = reader
        .next_entry()?
        .ok_or_else(|| anyhow!(UpdateError::BundleFormat("empty bundle".into())))?;
    if entry.name != MANIFEST_NAME {
        return Err(anyhow!(UpdateError::BundleFormat(format!(
            "first entry is '{}', expected '{MANIFEST_NAME}'",
            entry.name
        ))));
    }
    let manifest = read_entry_to_memory(&mut reader, &entry)?;

    // second entry: its signature, when verification is configured
    if let Some(key_path) = &agent.config.public_key {
        let verifier = SignatureVerifier::from_pem_file(key_path)?;
        let entry = reader.next_entry()?.ok_or_else(|| {
            anyhow!(UpdateError::Integrity(
                "bundle ends before the manifest signature".into()
            ))
        })?;
        if entry.name != MANIFEST_SIG_NAME {
            return Err(anyhow!(UpdateError::Integrity(format!(
                "second entry is '{}', expected '{MANIFEST_SIG_NAME}'",
                entry.name
            ))));
        }
        let signature = read_entry_to_memory(&mut reader, &entry)?;
        verifier.verify(&manifest, &signature)?;
    }

    // keep a copy for scripts and debugging; removed by cleanup
    let manifest_path = agent.config.tmpdir.join(MANIFEST_NAME);
    std::fs::write(&manifest_path, &manifest)
        .with_context(|| format!("writing {}", manifest_path.display()))?;

    let selection = if !request.software_set.is_empty() && !request.running_mode.is_empty() {
        Selection {
            software_set: request.software_set.clone(),
            running_mode: request.running_mode.clone(),
        }
    } else {
        agent.config.selection.clone()
    };

    let text = String::from_utf8_lossy(&manifest).into_owned();
    *bundle = parse_manifest(
        &text,
        &ParseContext {
            hw: &agent.hw,
            selection: &selection,
            installed: &agent.installed,
            output_enabled: agent.config.output.is_some(),
            no_transaction_marker: agent.config.no_transaction_marker,
            no_state_marker: agent.config.no_state_marker,
            hook: None,
        },
    )?;
    ctx.transaction_marker = bundle.transaction_marker;
    ctx.state_marker = bundle.state_marker;

    check_hw_compatibility(&agent.hw, &bundle.hardware)?;
    agent.check_version_gates(&bundle.version)?;

    if !ctx.dry_run && !agent.config.preupdate_cmd.is_empty() {
        let status = run_command(&agent.config.preupdate_cmd)?;
        if status != 0 {
            return Err(anyhow!(UpdateError::Resource(format!(
                "pre-update command failed with status {status}"
            ))));
        }
    }

    agent.progress.start(
        bundle.images.len() as u32,
        request.source,
        &request.info,
    );
    if !bundle.reboot_required {
        agent
            .progress
            .info(RecoveryStatus::Run, "{ \"reboot-mode\" : \"no-reboot\" }");
    }

    // stream the remaining entries
    extract_files(agent, &mut reader, bundle, ctx)?;
    if let Some(fd) = source_fd {
        drain_trailer_padding(fd);
    }

    // everything the manifest requires must have been in the archive
    for image in bundle
        .images
        .iter()
        .chain(&bundle.scripts)
        .chain(&bundle.bootscripts)
    {
        if !image.fname.is_empty() && !image.provided {
            return Err(anyhow!(UpdateError::BundleFormat(format!(
                "required file '{}' missing from bundle",
                image.fname
            ))));
        }
    }

    enter_in_progress(agent, ctx)?;
    agent.notifier.notify(
        RecoveryStatus::Run,
        0,
        NotifyLevel::Info,
        "Installation in progress",
    );

    install_images(agent, bundle, ctx)?;
    Ok(())
}

/// Record IN_PROGRESS in the markers, once.
fn enter_in_progress(agent: &UpdateAgent, ctx: &mut InstallContext) -> Result<()> {
    if ctx.in_progress {
        return Ok(());
    }
    ctx.in_progress = true;
    if ctx.dry_run {
        return Ok(());
    }
    if ctx.transaction_marker {
        agent
            .markers
            .set_transaction(UpdateState::InProgress)
            .context("setting transaction marker")?;
    }
    if ctx.state_marker {
        agent
            .markers
            .set_state(UpdateState::InProgress)
            .context("storing IN_PROGRESS update state")?;
    }
    Ok(())
}

/// Linear walk over the data entries.
fn extract_files(
    agent: &UpdateAgent,
    reader: &mut BundleReader<&mut dyn BundleSource>,
    bundle: &mut BundleDescriptor,
    ctx: &mut InstallContext,
) -> Result<()> {
    while let Some(entry) = reader.next_entry()? {
        match classify(bundle, &entry)? {
            Classified::Skip => {
                log::trace!("entry {} not required, skipping", entry.name);
                let spec = PipelineSpec {
                    size: entry.size,
                    ..Default::default()
                };
                let stats = copy_payload(reader, &spec, None, Sink::Discard, None)?;
                entry.verify_checksum(stats.checksum)?;
                reader.align()?;
            }
            Classified::Copy(list, idx) => {
                // extracted files land directly in the workspace; never
                // let an entry name escape it
                if entry.name.contains('/') {
                    return Err(anyhow!(UpdateError::BundleFormat(format!(
                        "entry name '{}' contains a path separator",
                        entry.name
                    ))));
                }
                let scripts_dir = agent.scripts_dir();
                let datadir = agent.datadir();
                let mut lists = bundle.all_lists_mut();
                let image = &mut lists[list][idx];
                let dest = if image.is_script {
                    scripts_dir.join(&entry.name)
                } else {
                    datadir.join(&entry.name)
                };
                log::trace!("extracting {} ({} bytes)", entry.name, entry.size);
                check_free_space(&agent.config.tmpdir, entry.size)?;
                let mut file = OpenOptions::new()
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .open(&dest)
                    .map_err(|e| {
                        anyhow!(UpdateError::Resource(format!(
                            "cannot create {}: {e}",
                            dest.display()
                        )))
                    })?;
                // raw copy; transforms and the hash check run at install
                // time so the hash always covers what the handler sees
                let spec = PipelineSpec {
                    size: entry.size,
                    ..Default::default()
                };
                let stats = copy_payload(reader, &spec, None, Sink::File {
                    file: &mut file,
                    seek: 0,
                }, None)?;
                entry.verify_checksum(stats.checksum)?;
                reader.align()?;
                image.provided = true;
                image.size = entry.size;
                image.offset = entry.payload_offset;
                image.extract_file = Some(dest);
            }
            Classified::Stream(idx) => {
                enter_in_progress(agent, ctx)?;

                // a streamed image cannot wait for its partition; shape
                // any pending partitioners now
                for i in 0..bundle.images.len() {
                    if bundle.images[i].is_partitioner && !bundle.images[i].done {
                        log::trace!(
                            "adjusting partition {} before streaming {}",
                            bundle.images[i].destination(),
                            entry.name
                        );
                        install_single_image(agent, &mut bundle.images[i], None, ctx)?;
                    }
                }

                let image = &mut bundle.images[idx];
                log::trace!("installing {} from stream, {} bytes", entry.name, entry.size);
                image.provided = true;
                image.size = entry.size;
                image.offset = entry.payload_offset;
                install_single_image(agent, image, Some((reader, &entry)), ctx)?;
                reader.align()?;
            }
        }
    }
    Ok(())
}

enum Classified {
    Skip,
    /// (list index into all_lists_mut, image index)
    Copy(usize, usize),
    /// index into images
    Stream(usize),
}

fn classify(bundle: &BundleDescriptor, entry: &Entry) -> Result<Classified> {
    let direct: Vec<usize> = bundle
        .images
        .iter()
        .enumerate()
        .filter(|(_, img)| {
            img.fname == entry.name && !img.provided && img.install_directly
        })
        .map(|(i, _)| i)
        .collect();
    if direct.len() > 1 {
        return Err(anyhow!(UpdateError::ManifestSemantic(format!(
            "more than one image wants '{}' installed from the stream",
            entry.name
        ))));
    }
    if let Some(idx) = direct.first() {
        return Ok(Classified::Stream(*idx));
    }
    for (list, images) in [&bundle.images, &bundle.scripts, &bundle.bootscripts]
        .iter()
        .enumerate()
    {
        if let Some(idx) = images
            .iter()
            .position(|img| img.fname == entry.name && !img.provided)
        {
            return Ok(Classified::Copy(list, idx));
        }
    }
    Ok(Classified::Skip)
}

/// Apply one image through its handler.  `stream` carries the archive
/// reader and entry for direct installs; temp-file installs read their
/// extracted copy.
fn install_single_image(
    agent: &UpdateAgent,
    image: &mut ImageDescriptor,
    stream: Option<(&mut BundleReader<&mut dyn BundleSource>, &Entry)>,
    ctx: &InstallContext,
) -> Result<()> {
    let handler = find_handler(image)?;
    log::trace!("found handler {} for {}", handler.name, image.fname);
    agent.progress.step_started(
        if image.fname.is_empty() {
            image.destination()
        } else {
            &image.fname
        },
        &handler.name,
    );

    let result = (|| -> Result<()> {
        if ctx.dry_run {
            // verify without touching the device
            if let Some((reader, entry)) = stream {
                let spec = pipeline_spec(image, entry.size);
                let stats = copy_payload(reader, &spec, agent.aes_key().as_ref(), Sink::Discard, None)?;
                entry.verify_checksum(stats.checksum)?;
            } else if let Some(path) = &image.extract_file {
                let mut file = File::open(path)?;
                let size = file.metadata()?.len();
                let spec = pipeline_spec(image, size);
                copy_payload(&mut file, &spec, agent.aes_key().as_ref(), Sink::Discard, None)?;
            }
            agent.progress.update(100);
            return Ok(());
        }

        if handler.mask & NO_DATA_HANDLER != 0 {
            return (handler.install)(image, &mut HandlerData::None);
        }

        let aes = agent.aes_key();
        let progress = agent.progress.clone();
        match stream {
            Some((reader, entry)) => {
                let spec = pipeline_spec(image, entry.size);
                let mut plaintext = PlaintextReader::new(
                    reader,
                    &spec,
                    aes.as_ref(),
                    Some(Box::new(move |p| progress.update(p))),
                )?;
                (handler.install)(image, &mut HandlerData::Stream(&mut plaintext))?;
                let stats = plaintext.finish()?;
                entry.verify_checksum(stats.checksum)?;
            }
            None => {
                let path = image.extract_file.clone().ok_or_else(|| {
                    anyhow!(UpdateError::Resource(format!(
                        "'{}' has no extracted payload",
                        image.fname
                    )))
                })?;
                let mut file = File::open(&path).map_err(|e| {
                    anyhow!(UpdateError::Resource(format!(
                        "cannot open {}: {e}",
                        path.display()
                    )))
                })?;
                let size = file.metadata().map(|m| m.len()).unwrap_or(image.size);
                let spec = pipeline_spec(image, size);
                let mut plaintext = PlaintextReader::new(
                    &mut file,
                    &spec,
                    aes.as_ref(),
                    Some(Box::new(move |p| progress.update(p))),
                )?;
                (handler.install)(image, &mut HandlerData::Stream(&mut plaintext))?;
                plaintext.finish()?;
            }
        }
        Ok(())
    })();

    agent.progress.step_completed();
    image.done = true;
    result.with_context(|| format!("installing '{}'", image.fname))
}

fn pipeline_spec(image: &ImageDescriptor, size: u64) -> PipelineSpec {
    PipelineSpec {
        size,
        compression: image.compression,
        encrypted: image.encrypted,
        iv_hex: image.ivt.as_deref(),
        sha256: image.sha256,
    }
}

/// Post-streaming phase: scripts, remaining images, bootloader variables.
fn install_images(
    agent: &UpdateAgent,
    bundle: &mut BundleDescriptor,
    ctx: &InstallContext,
) -> Result<()> {
    run_scripts(&bundle.scripts, ScriptPhase::Pre, ctx.dry_run)
        .context("pre-install scripts failed")?;

    // partition shapers run before ordinary images
    for i in 0..bundle.images.len() {
        if bundle.images[i].is_partitioner && !bundle.images[i].done {
            install_single_image(agent, &mut bundle.images[i], None, ctx)?;
        }
    }
    for i in 0..bundle.images.len() {
        let image = &bundle.images[i];
        if image.done || image.is_partitioner || image.is_script {
            continue;
        }
        install_single_image(agent, &mut bundle.images[i], None, ctx)?;
    }

    run_scripts(&bundle.scripts, ScriptPhase::Post, ctx.dry_run)
        .context("post-install scripts failed")?;

    // bootloader scripts are `name value` line files applied wholesale
    if !ctx.dry_run {
        for script in &bundle.bootscripts {
            let path = script.extract_file.as_ref().ok_or_else(|| {
                anyhow!(UpdateError::Resource(format!(
                    "bootloader script '{}' was not extracted",
                    script.fname
                )))
            })?;
            agent
                .bootloader
                .apply_list(path)
                .with_context(|| format!("applying bootloader script '{}'", script.fname))?;
        }
    }

    if !ctx.dry_run {
        for (name, value) in bundle.bootenv.iter() {
            if value.is_empty() {
                agent
                    .bootloader
                    .unset(name)
                    .with_context(|| format!("unsetting bootloader variable '{name}'"))?;
            } else {
                agent
                    .bootloader
                    .set(name, value)
                    .with_context(|| format!("setting bootloader variable '{name}'"))?;
            }
        }
    }

    if !ctx.dry_run && !agent.config.postupdate_cmd.is_empty() {
        let status = run_command(&agent.config.postupdate_cmd)?;
        if status != 0 {
            log::warn!("post-update command returned {status}");
        }
    }
    Ok(())
}

fn run_scripts(scripts: &[ImageDescriptor], phase: ScriptPhase, dry_run: bool) -> Result<()> {
    for script in scripts {
        if !script.is_script {
            continue;
        }
        let handler = find_handler(script)?;
        if handler.mask & crate::handler::SCRIPT_HANDLER == 0 {
            continue;
        }
        if dry_run {
            continue;
        }
        let path = script.extract_file.clone().ok_or_else(|| {
            anyhow!(UpdateError::Resource(format!(
                "script '{}' was not extracted",
                script.fname
            )))
        })?;
        log::trace!("running {} phase of {}", phase.as_str(), script.fname);
        (handler.install)(script, &mut HandlerData::Script(phase, &path))?;
    }
    Ok(())
}

fn read_entry_to_memory(
    reader: &mut BundleReader<&mut dyn BundleSource>,
    entry: &Entry,
) -> Result<Vec<u8>> {
    let mut data = Vec::with_capacity(entry.size as usize);
    let spec = PipelineSpec {
        size: entry.size,
        ..Default::default()
    };
    let mut sink = |buf: &[u8]| {
        data.extend_from_slice(buf);
        Ok(())
    };
    let stats = copy_payload(reader, &spec, None, Sink::Handler(&mut sink), None)?;
    entry.verify_checksum(stats.checksum)?;
    reader.align()?;
    Ok(data)
}

/// Copy the whole incoming stream to `output` and install from the file.
fn cache_stream(src: &mut dyn BundleSource, output: &Path) -> Result<File> {
    if let Some(parent) = output.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(output)
        .map_err(|e| {
            anyhow!(UpdateError::Resource(format!(
                "cannot create bundle cache {}: {e}",
                output.display()
            )))
        })?;
    std::io::copy(src, &mut file).context("caching bundle to disk")?;
    file.rewind().context("rewinding cached bundle")?;
    log::info!("incoming bundle cached at {}", output.display());
    Ok(file)
}

fn check_free_space(dir: &Path, needed: u64) -> Result<()> {
    let stat = nix::sys::statvfs::statvfs(dir)
        .map_err(|e| anyhow!(UpdateError::Resource(format!("statvfs failed: {e}"))))?;
    let available = stat.blocks_available() as u64 * stat.fragment_size() as u64;
    if available < needed {
        return Err(anyhow!(UpdateError::Resource(format!(
            "not enough space to extract: {needed} bytes needed, {available} free"
        ))));
    }
    Ok(())
}

/// Remove everything the installation attempt put in the workspace.
pub fn cleanup_files(agent: &UpdateAgent, bundle: &BundleDescriptor) {
    for image in bundle.images.iter().chain(&bundle.scripts).chain(&bundle.bootscripts) {
        if let Some(path) = &image.extract_file {
            let _ = std::fs::remove_file(path);
        }
    }
    let _ = std::fs::remove_file(agent.config.tmpdir.join(MANIFEST_NAME));
    let _ = std::fs::remove_dir_all(agent.scripts_dir());
    let _ = std::fs::remove_dir_all(agent.datadir());
}
