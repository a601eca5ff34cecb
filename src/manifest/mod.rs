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

//! Manifest parsing: the first bundle entry describes what to install.
//!
//! The manifest has a well-known section layout under a `software` root,
//! with board- and selection-conditional overrides: for a section `X`,
//! nodes are searched as `software.<board>.<set>.<mode>.X`, then
//! `software.<set>.<mode>.X`, then `software.<board>.X`, then
//! `software.X`; the first hit wins.  A node whose only meaning is a `ref`
//! field is a link and is followed with bounded depth.

pub mod hwcompat;
pub mod syntax;

pub use self::hwcompat::{check_hw_compatibility, BoardInfo, HwCompat};

use anyhow::{anyhow, Result};
use serde_json::Value;
use std::path::PathBuf;

use self::syntax::{syntax_for, Syntax};
use crate::dict::Dict;
use crate::errors::UpdateError;
use crate::io::{Compression, SHA256_LEN};
use crate::version::compare_versions;

/// Well-known name of the manifest entry, always first in the archive.
pub const MANIFEST_NAME: &str = "update-description";

/// Detached signature of the manifest, second in the archive when the
/// agent runs with signature verification.
pub const MANIFEST_SIG_NAME: &str = "update-description.sig";

const NODE_ROOT: &str = "software";
const MAX_PARSED_NODES: usize = 20;
const MAX_LINK_DEPTH: usize = 10;

/// Software set / running mode pair selecting which manifest variant to
/// install (e.g. `stable,main`).
#[derive(Debug, Clone, Default)]
pub struct Selection {
    pub software_set: String,
    pub running_mode: String,
}

/// One record of the installed-software table.
#[derive(Debug, Clone)]
pub struct SwVersion {
    pub name: String,
    pub version: String,
}

/// Interpreter interface for per-element `hook` functions backed by the
/// bundle's `embedded-script`.  No interpreter ships by default; manifests
/// using hooks are rejected unless one is plugged in.
pub trait Hook {
    /// Returns true if the element should be skipped.
    fn eval(&self, function: &str, image: &ImageDescriptor) -> Result<bool>;
}

#[derive(Debug, Clone, Default)]
pub struct ImageDescriptor {
    pub name: String,
    pub version: String,
    /// Entry name inside the archive.
    pub fname: String,
    pub path: String,
    pub volname: String,
    pub device: String,
    /// Handler name; empty means "pick by destination" (see the registry).
    pub handler: String,
    /// Free-form blob passed through to the handler.
    pub handler_data: String,
    /// Expected plaintext SHA-256; `None` (or all zero in the manifest)
    /// disables the check.
    pub sha256: Option<[u8; SHA256_LEN]>,
    pub compression: Compression,
    pub encrypted: bool,
    /// Per-image IV override, hex.
    pub ivt: Option<String>,
    /// Destination byte offset for file sinks.
    pub seek: u64,
    /// Partitioner target size.
    pub partsize: u64,
    pub install_directly: bool,
    pub preserve_attributes: bool,
    pub install_if_different: bool,
    pub install_if_higher: bool,
    pub is_partitioner: bool,
    pub is_script: bool,
    pub properties: Dict,

    // filled in while the archive is processed
    pub provided: bool,
    pub offset: u64,
    pub size: u64,
    pub extract_file: Option<PathBuf>,
    /// Already applied (streamed directly, or shaped ahead of order).
    pub done: bool,
}

impl ImageDescriptor {
    /// Where the image lands, for logging.
    pub fn destination(&self) -> &str {
        if !self.volname.is_empty() {
            &self.volname
        } else if !self.path.is_empty() {
            &self.path
        } else {
            &self.device
        }
    }
}

#[derive(Debug, Default)]
pub struct BundleDescriptor {
    pub version: String,
    pub description: String,
    pub images: Vec<ImageDescriptor>,
    pub scripts: Vec<ImageDescriptor>,
    pub bootscripts: Vec<ImageDescriptor>,
    /// Bootloader variables to commit after a successful install; an empty
    /// value means "unset".
    pub bootenv: Dict,
    pub vars: Dict,
    pub hardware: Vec<HwCompat>,
    pub transaction_marker: bool,
    pub state_marker: bool,
    pub reboot_required: bool,
    /// Cache the incoming bundle to this path before installing.
    pub output: Option<String>,
    pub embedded_script: Option<String>,
}

impl BundleDescriptor {
    /// All entry lists that may match archive members.
    pub fn all_lists_mut(&mut self) -> [&mut Vec<ImageDescriptor>; 3] {
        [&mut self.images, &mut self.scripts, &mut self.bootscripts]
    }
}

/// Ambient inputs to manifest parsing.
pub struct ParseContext<'a> {
    pub hw: &'a BoardInfo,
    pub selection: &'a Selection,
    pub installed: &'a [SwVersion],
    /// Whether `-o` enabled caching, required for the manifest's `output`
    /// field to take effect.
    pub output_enabled: bool,
    pub no_transaction_marker: bool,
    pub no_state_marker: bool,
    pub hook: Option<&'a dyn Hook>,
}

pub fn parse_manifest(text: &str, ctx: &ParseContext) -> Result<BundleDescriptor> {
    let syntax = syntax_for(text);
    let root = syntax.parse(text)?;
    let mut parser = Parser {
        syntax,
        root,
        ctx,
        embscript: None,
    };
    parser.embscript = parser
        .find_node("embedded-script")
        .and_then(|n| parser.syntax.field_string(n, None));
    parser.parse()
}

struct Parser<'a> {
    syntax: Box<dyn Syntax>,
    root: Value,
    ctx: &'a ParseContext<'a>,
    embscript: Option<String>,
}

impl Parser<'_> {
    fn parse(&self) -> Result<BundleDescriptor> {
        let mut bundle = BundleDescriptor::default();

        self.common_fields(&mut bundle)?;

        bundle.embedded_script = self.embscript.clone();
        if bundle.embedded_script.is_some() && self.ctx.hook.is_none() {
            return Err(anyhow!(UpdateError::ManifestSemantic(
                "manifest declares an embedded script but no interpreter is available".into()
            )));
        }

        self.hardware_compatibility(&mut bundle)?;

        let mut images = Vec::new();
        self.walk_section("images", &mut |parser, elem| {
            parser.one_image(elem, &mut images)
        })?;
        bundle.images.extend(images);

        let mut files = Vec::new();
        self.walk_section("files", &mut |parser, elem| parser.one_data_file(elem, &mut files))?;
        bundle.images.extend(files);

        let mut scripts = Vec::new();
        self.walk_section("scripts", &mut |parser, elem| {
            parser.one_script(elem, &mut scripts)
        })?;
        bundle.scripts.extend(scripts);

        let mut bootenv = Dict::new();
        let mut bootscripts = Vec::new();
        for section in ["bootenv", "uboot"] {
            let mut found = false;
            self.walk_section(section, &mut |parser, elem| {
                found = true;
                parser.one_bootenv(elem, &mut bootenv, &mut bootscripts)
            })?;
            if found {
                break;
            }
        }
        bundle.bootenv = bootenv;
        bundle.bootscripts = bootscripts;

        let mut vars = Dict::new();
        self.walk_section("vars", &mut |parser, elem| parser.one_var(elem, &mut vars))?;
        bundle.vars = vars;

        // partitions are regular images flagged to run before the rest
        let mut partitions = Vec::new();
        self.walk_section("partitions", &mut |parser, elem| {
            parser.one_partition(elem, &mut partitions)
        })?;
        partitions.append(&mut bundle.images);
        bundle.images = partitions;

        if bundle.images.is_empty() && bundle.scripts.is_empty() && bundle.bootenv.is_empty() {
            return Err(anyhow!(UpdateError::ManifestSemantic(
                "found nothing to install".into()
            )));
        }
        Ok(bundle)
    }

    fn common_fields(&self, bundle: &mut BundleDescriptor) -> Result<()> {
        bundle.version = self
            .find_node("version")
            .and_then(|n| self.syntax.field_string(n, None))
            .ok_or_else(|| {
                anyhow!(UpdateError::ManifestSyntax(
                    "missing mandatory field 'version'".into()
                ))
            })?;
        log::trace!("update version {}", bundle.version);

        if let Some(node) = self.find_node("description") {
            bundle.description = self.syntax.field_string(node, None).unwrap_or_default();
        }

        bundle.state_marker = if self.ctx.no_state_marker {
            false
        } else {
            self.find_node("bootloader_state_marker")
                .and_then(|n| self.syntax.field_bool(n, None))
                .unwrap_or(true)
        };
        bundle.transaction_marker = if self.ctx.no_transaction_marker {
            false
        } else {
            self.find_node("bootloader_transaction_marker")
                .and_then(|n| self.syntax.field_bool(n, None))
                .unwrap_or(true)
        };

        bundle.reboot_required = self
            .find_node("reboot")
            .and_then(|n| self.syntax.field_bool(n, None))
            .unwrap_or(true);

        if let Some(node) = self.find_node("output") {
            if self.ctx.output_enabled {
                bundle.output = self.syntax.field_string(node, None);
            } else {
                log::trace!("output file set in manifest but caching not enabled, ignored");
            }
        }
        Ok(())
    }

    fn hardware_compatibility(&self, bundle: &mut BundleDescriptor) -> Result<()> {
        let node = match self.find_node("hardware-compatibility") {
            Some(n) => n,
            None => return Ok(()),
        };
        for i in 0..self.syntax.array_len(node) {
            let elem = self.syntax.elem_at(node, i).unwrap();
            if let Some(entry) = self.syntax.field_string(elem, None) {
                if entry.is_empty() {
                    continue;
                }
                log::trace!("accepted hw revision: {entry}");
                bundle.hardware.push(HwCompat::parse(&entry)?);
            }
        }
        Ok(())
    }

    /// Candidate node paths for a section, most specific first.
    fn base_paths(&self) -> Vec<Vec<String>> {
        let hw = self.ctx.hw;
        let sel = self.ctx.selection;
        let mut paths = Vec::new();
        if !sel.software_set.is_empty() && !sel.running_mode.is_empty() && !hw.boardname.is_empty()
        {
            paths.push(vec![
                NODE_ROOT.to_string(),
                hw.boardname.clone(),
                sel.software_set.clone(),
                sel.running_mode.clone(),
            ]);
        }
        if !sel.software_set.is_empty() && !sel.running_mode.is_empty() {
            paths.push(vec![
                NODE_ROOT.to_string(),
                sel.software_set.clone(),
                sel.running_mode.clone(),
            ]);
        }
        if !hw.boardname.is_empty() {
            paths.push(vec![NODE_ROOT.to_string(), hw.boardname.clone()]);
        }
        paths.push(vec![NODE_ROOT.to_string()]);
        paths
    }

    fn find_node_and_path(&self, field: &str) -> Option<(&Value, Vec<String>)> {
        for mut path in self.base_paths() {
            if self.syntax.find_root(&self.root, &path).is_none() {
                continue;
            }
            path.push(field.to_string());
            if let Some(node) = self.syntax.find_root(&self.root, &path) {
                return Some((node, path));
            }
        }
        None
    }

    fn find_node(&self, field: &str) -> Option<&Value> {
        self.find_node_and_path(field).map(|(n, _)| n)
    }

    /// Iterate the elements of an array section, following `ref` links.
    fn walk_section(
        &self,
        field: &str,
        f: &mut dyn FnMut(&Self, &Value) -> Result<()>,
    ) -> Result<()> {
        if let Some((node, path)) = self.find_node_and_path(field) {
            self.walk_elements(node, &path, 0, f)?;
        }
        Ok(())
    }

    fn walk_elements(
        &self,
        node: &Value,
        path: &[String],
        depth: usize,
        f: &mut dyn FnMut(&Self, &Value) -> Result<()>,
    ) -> Result<()> {
        if depth > MAX_LINK_DEPTH {
            return Err(anyhow!(UpdateError::ManifestSemantic(format!(
                "link nesting deeper than {MAX_LINK_DEPTH}, assuming a loop"
            ))));
        }
        for i in 0..self.syntax.array_len(node) {
            let elem = self.syntax.elem_at(node, i).unwrap();
            if self.syntax.exist_field(elem, "ref") {
                let target = self
                    .syntax
                    .field_string(elem, Some("ref"))
                    .ok_or_else(|| {
                        anyhow!(UpdateError::ManifestSemantic("non-string ref".into()))
                    })?;
                log::trace!("link found, following {target}");
                let newpath = follow_link(path, &target)?;
                let linked = self
                    .syntax
                    .find_root(&self.root, &newpath)
                    .ok_or_else(|| {
                        anyhow!(UpdateError::ManifestSemantic(format!(
                            "dangling ref '{target}'"
                        )))
                    })?;
                self.walk_elements(linked, &newpath, depth + 1, f)?;
                continue;
            }
            f(self, elem)?;
        }
        Ok(())
    }

    /// Run the element's hook, if any.  Returns true when the element must
    /// be skipped.
    fn run_hook(&self, elem: &Value, image: &ImageDescriptor) -> Result<bool> {
        if !self.syntax.exist_field(elem, "hook") {
            return Ok(false);
        }
        let function = self
            .syntax
            .field_string(elem, Some("hook"))
            .unwrap_or_default();
        match (self.ctx.hook, &self.embscript) {
            (None, _) => Err(anyhow!(UpdateError::ManifestSemantic(format!(
                "element declares hook '{function}' but no interpreter is available"
            )))),
            // hooks without an embedded script have nothing to run
            (Some(_), None) => Ok(false),
            (Some(hook), Some(_)) => hook.eval(&function, image),
        }
    }

    fn common_attributes(&self, elem: &Value) -> Result<ImageDescriptor> {
        let s = &*self.syntax;
        let mut image = ImageDescriptor {
            name: s.field_string(elem, Some("name")).unwrap_or_default(),
            version: s.field_string(elem, Some("version")).unwrap_or_default(),
            fname: s.field_string(elem, Some("filename")).unwrap_or_default(),
            path: s.field_string(elem, Some("path")).unwrap_or_default(),
            volname: s.field_string(elem, Some("volume")).unwrap_or_default(),
            device: s.field_string(elem, Some("device")).unwrap_or_default(),
            handler: s.field_string(elem, Some("type")).unwrap_or_default(),
            handler_data: s.field_string(elem, Some("data")).unwrap_or_default(),
            ivt: s.field_string(elem, Some("ivt")),
            ..Default::default()
        };

        if let Some(hash) = s.field_string(elem, Some("sha256")) {
            let bytes = hex::decode(&hash).map_err(|_| {
                anyhow!(UpdateError::ManifestSyntax(format!(
                    "'{}': sha256 is not valid hex",
                    image.fname
                )))
            })?;
            let bytes: [u8; SHA256_LEN] = bytes.as_slice().try_into().map_err(|_| {
                anyhow!(UpdateError::ManifestSyntax(format!(
                    "'{}': sha256 must be {SHA256_LEN} bytes",
                    image.fname
                )))
            })?;
            // all zero means "do not check"
            if bytes.iter().any(|b| *b != 0) {
                image.sha256 = Some(bytes);
            }
        }

        // offset accepts a number or a string with multiplier suffix
        if let Some(n) = s.field_u64(elem, Some("offset")) {
            image.seek = n;
        } else if let Some(text) = s.field_string(elem, Some("offset")) {
            image.seek = parse_size(&text).ok_or_else(|| {
                anyhow!(UpdateError::ManifestSyntax(format!(
                    "offset argument '{text}' is not a size"
                )))
            })?;
        }

        match s.field_string(elem, Some("compressed")) {
            Some(tag) if tag == "true" => {
                log::warn!(
                    "compressed: boolean form is deprecated, use compressed = \"zlib\""
                );
                image.compression = Compression::Zlib;
            }
            Some(tag) if tag == "false" => {}
            Some(tag) => image.compression = tag.parse()?,
            None => {}
        }

        let flag = |name| s.field_bool(elem, Some(name)).unwrap_or(false);
        image.install_directly = flag("installed-directly");
        image.preserve_attributes = flag("preserve-attributes");
        image.install_if_different = flag("install-if-different");
        image.install_if_higher = flag("install-if-higher");
        image.encrypted = flag("encrypted");

        if let Some(props) = s.get_child(elem, "properties") {
            for (name, value) in s.object_entries(props) {
                if value.is_array() {
                    for i in 0..s.array_len(value) {
                        if let Some(v) =
                            s.field_string(s.elem_at(value, i).unwrap(), None)
                        {
                            image.properties.insert(name, &v);
                        }
                    }
                } else if let Some(v) = s.field_string(value, None) {
                    log::trace!("\tproperty {name}: {v}");
                    image.properties.insert(name, &v);
                }
            }
        }
        Ok(image)
    }

    /// Skip policy against the installed-software table.
    fn already_installed(&self, image: &ImageDescriptor) -> bool {
        if image.name.is_empty() || image.version.is_empty() {
            return false;
        }
        for sw in self.ctx.installed {
            if sw.name != image.name {
                continue;
            }
            if image.install_if_different
                && compare_versions(&image.version, &sw.version).is_eq()
            {
                log::info!(
                    "{}({}) already installed, skipping",
                    image.name,
                    image.version
                );
                return true;
            }
            if image.install_if_higher
                && compare_versions(&image.version, &sw.version).is_le()
            {
                log::info!(
                    "{}({}) has an equal or higher version installed, skipping",
                    image.name,
                    image.version
                );
                return true;
            }
        }
        false
    }

    fn one_image(&self, elem: &Value, out: &mut Vec<ImageDescriptor>) -> Result<()> {
        if !self.syntax.exist_field(elem, "filename") {
            log::trace!("image entry without filename field, skipping");
            return Ok(());
        }
        let image = self.common_attributes(elem)?;
        let skip = self.run_hook(elem, &image)? || self.already_installed(&image);
        log::info!(
            "{} image {} in {} for handler {}{}",
            if skip { "skip" } else { "found" },
            image.fname,
            image.destination(),
            if image.handler.is_empty() {
                "(by destination)"
            } else {
                &image.handler
            },
            if image.install_directly {
                " (installed from stream)"
            } else {
                ""
            }
        );
        if !skip {
            out.push(image);
        }
        Ok(())
    }

    fn one_data_file(&self, elem: &Value, out: &mut Vec<ImageDescriptor>) -> Result<()> {
        if !self.syntax.exist_field(elem, "filename") {
            log::trace!("file entry without filename field, skipping");
            return Ok(());
        }
        let mut file = self.common_attributes(elem)?;
        if file.handler.is_empty() {
            file.handler = "rawfile".to_string();
        }
        let skip = self.run_hook(elem, &file)? || self.already_installed(&file);
        log::info!(
            "{} file {} --> {}",
            if skip { "skip" } else { "found" },
            file.fname,
            file.path
        );
        if !skip {
            out.push(file);
        }
        Ok(())
    }

    fn one_script(&self, elem: &Value, out: &mut Vec<ImageDescriptor>) -> Result<()> {
        if !self.syntax.exist_field(elem, "filename") {
            log::trace!("script entry without filename field, skipping");
            return Ok(());
        }
        let mut script = self.common_attributes(elem)?;
        if script.handler.is_empty() {
            script.handler = "shellscript".to_string();
        }
        script.is_script = true;
        let skip = self.run_hook(elem, &script)? || self.already_installed(&script);
        log::info!(
            "{} script {}",
            if skip { "skip" } else { "found" },
            script.fname
        );
        if !skip {
            out.push(script);
        }
        Ok(())
    }

    fn one_bootenv(
        &self,
        elem: &Value,
        bootenv: &mut Dict,
        bootscripts: &mut Vec<ImageDescriptor>,
    ) -> Result<()> {
        if self.syntax.exist_field(elem, "name") {
            let name = self
                .syntax
                .field_string(elem, Some("name"))
                .unwrap_or_default();
            let value = self
                .syntax
                .field_string(elem, Some("value"))
                .unwrap_or_default();
            let probe = ImageDescriptor {
                name: name.clone(),
                version: value.clone(),
                ..Default::default()
            };
            if !self.run_hook(elem, &probe)? {
                log::trace!("bootloader var: {name} = {value}");
                bootenv.set(&name, &value);
            }
            return Ok(());
        }
        if !self.syntax.exist_field(elem, "filename") {
            log::trace!("bootenv entry is neither a script nor name/value");
            return Ok(());
        }
        let mut script = self.common_attributes(elem)?;
        script.is_script = true;
        if !self.run_hook(elem, &script)? && !self.already_installed(&script) {
            log::info!("found bootloader script {}", script.fname);
            bootscripts.push(script);
        }
        Ok(())
    }

    fn one_var(&self, elem: &Value, vars: &mut Dict) -> Result<()> {
        if !self.syntax.exist_field(elem, "name") {
            return Err(anyhow!(UpdateError::ManifestSyntax(
                "vars entries must have a name field".into()
            )));
        }
        let name = self
            .syntax
            .field_string(elem, Some("name"))
            .unwrap_or_default();
        let value = self
            .syntax
            .field_string(elem, Some("value"))
            .unwrap_or_default();
        let probe = ImageDescriptor {
            name: name.clone(),
            version: value.clone(),
            ..Default::default()
        };
        if !self.run_hook(elem, &probe)? {
            log::trace!("agent var: {name} = {value}");
            vars.set(&name, &value);
        }
        Ok(())
    }

    fn one_partition(&self, elem: &Value, out: &mut Vec<ImageDescriptor>) -> Result<()> {
        let mut partition = self.common_attributes(elem)?;
        // `name` doubles as the volume name for partitioners
        if let Some(name) = self.syntax.field_string(elem, Some("name")) {
            partition.volname = name;
        }
        if partition.handler.is_empty() {
            partition.handler = "ubipartition".to_string();
        }
        partition.is_partitioner = true;
        partition.provided = true;
        partition.partsize = self
            .syntax
            .field_u64(elem, Some("size"))
            .unwrap_or(partition.partsize);

        if (partition.volname.is_empty() && partition.handler == "ubipartition")
            || partition.device.is_empty()
        {
            return Err(anyhow!(UpdateError::ManifestSemantic(
                "partition entry is incomplete".into()
            )));
        }
        if !self.run_hook(elem, &partition)? {
            log::info!(
                "partition: {} new size {} bytes",
                partition.destination(),
                partition.partsize
            );
            out.push(partition);
        }
        Ok(())
    }
}

/// Resolve a `ref` against the path of the node containing it, returning
/// the new path.  `#/a/b` is absolute; `.` and `..` are relative steps and
/// may not escape the document root.
fn follow_link(base: &[String], target: &str) -> Result<Vec<String>> {
    let rest = target.strip_prefix('#').ok_or_else(|| {
        anyhow!(UpdateError::ManifestSemantic(format!(
            "ref '{target}' must start with '#'"
        )))
    })?;
    let mut path: Vec<String> = if rest.starts_with('/') {
        Vec::new()
    } else {
        base.to_vec()
    };
    for token in rest.split('/') {
        match token {
            "" | "." => {}
            ".." => {
                path.pop().ok_or_else(|| {
                    anyhow!(UpdateError::ManifestSemantic(format!(
                        "ref '{target}' escapes the document root"
                    )))
                })?;
            }
            segment => path.push(segment.to_string()),
        }
    }
    if path.len() > MAX_PARSED_NODES {
        return Err(anyhow!(UpdateError::ManifestSemantic(format!(
            "ref '{target}' resolves deeper than {MAX_PARSED_NODES} nodes"
        ))));
    }
    Ok(path)
}

/// Parse a decimal size with an optional binary multiplier suffix.
fn parse_size(text: &str) -> Option<u64> {
    let text = text.trim();
    let (digits, mult) = match text.char_indices().find(|(_, c)| !c.is_ascii_digit()) {
        None => (text, 1u64),
        Some((idx, c)) => {
            let mult = match c {
                'k' | 'K' => 1u64 << 10,
                'M' => 1u64 << 20,
                'G' => 1u64 << 30,
                _ => return None,
            };
            if idx + c.len_utf8() != text.len() {
                return None;
            }
            (&text[..idx], mult)
        }
    };
    digits.parse::<u64>().ok()?.checked_mul(mult)
}
