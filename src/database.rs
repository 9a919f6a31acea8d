// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! The on-target package database.

The database lives in `/lib/apk/db`: `installed` holds one stanza per
installed package plus its file records, `triggers` holds one line per
package with trigger patterns, and `scripts.tar` accumulates every
package's control files under a `<name>-<version>.Q1<checksum>/` prefix.

When a `source_date_epoch` is supplied, every mtime written into
`scripts.tar` is clamped to it and the stanza build time is capped, so
repeated builds from identical inputs produce identical database bytes.
*/

use {
    crate::{
        error::{ApkError, Result},
        fs::ApkFilesystem,
        package::{Checksum, IndexPackage},
    },
    flate2::read::GzDecoder,
    std::{
        collections::{BTreeMap, HashMap},
        io::Read,
    },
};

pub(crate) const WORLD_FILE: &str = "etc/apk/world";
pub(crate) const REPOSITORIES_FILE: &str = "etc/apk/repositories";
pub(crate) const ARCH_FILE: &str = "etc/apk/arch";
pub(crate) const KEYS_DIR: &str = "etc/apk/keys";
pub(crate) const SCRIPTS_FILE: &str = "lib/apk/db/scripts.tar";
pub(crate) const TRIGGERS_FILE: &str = "lib/apk/db/triggers";
pub(crate) const INSTALLED_FILE: &str = "lib/apk/db/installed";

/// What kind of filesystem object an installed file record describes.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum InstalledFileKind {
    Directory,
    File { digest: Vec<u8> },
    Symlink { target: String },
    HardLink { target: String },
    CharDevice { major: u64, minor: u64 },
}

/// One filesystem object written while installing a package.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InstalledFile {
    /// Target path without a leading slash.
    pub path: String,
    pub mode: u32,
    pub size: u64,
    pub kind: InstalledFileKind,
}

/// The package owning an installed file.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FileOwner {
    pub package: String,
    pub origin: String,
}

/// Whether a package name appears in the installed database.
pub(crate) fn is_installed(fs: &dyn ApkFilesystem, name: &str) -> Result<bool> {
    let data = fs.read_file(INSTALLED_FILE)?;
    let text = String::from_utf8_lossy(&data);

    Ok(text
        .lines()
        .any(|line| line.strip_prefix("P:") == Some(name)))
}

/// Map of installed file paths to their owning packages.
///
/// Built by scanning `installed` stanzas: `F:` lines set the current
/// directory, `R:` lines record files within it.
pub(crate) fn file_owners(fs: &dyn ApkFilesystem) -> Result<HashMap<String, FileOwner>> {
    let data = fs.read_file(INSTALLED_FILE)?;
    let text = String::from_utf8_lossy(&data);

    let mut owners = HashMap::new();
    let mut package = String::new();
    let mut origin = String::new();
    let mut dir = String::new();

    for line in text.lines() {
        if let Some(value) = line.strip_prefix("P:") {
            package = value.to_string();
            origin.clear();
            dir.clear();
        } else if let Some(value) = line.strip_prefix("o:") {
            origin = value.to_string();
        } else if let Some(value) = line.strip_prefix("F:") {
            dir = value.to_string();
        } else if let Some(value) = line.strip_prefix("R:") {
            let path = if dir.is_empty() {
                value.to_string()
            } else {
                format!("{}/{}", dir, value)
            };
            owners.insert(
                path,
                FileOwner {
                    package: package.clone(),
                    origin: origin.clone(),
                },
            );
        }
    }

    Ok(owners)
}

/// Append a package stanza, including its file records, to `installed`.
pub(crate) fn add_installed_package(
    fs: &dyn ApkFilesystem,
    pkg: &IndexPackage,
    files: &[InstalledFile],
    source_date_epoch: Option<i64>,
) -> Result<()> {
    let mut paragraph = pkg.to_paragraph();
    if let (Some(epoch), Some(build_time)) = (source_date_epoch, pkg.build_time) {
        if build_time > epoch {
            paragraph.set_field(crate::control::ControlField::new("t", epoch));
        }
    }

    let mut stanza = Vec::new();
    paragraph.write(&mut stanza)?;

    // Group file records under their directories, emitting `F:` for each
    // directory followed by `R:`/`a:`/`Z:` lines for its files.
    let mut dirs: BTreeMap<String, Vec<&InstalledFile>> = BTreeMap::new();
    for file in files {
        match file.kind {
            InstalledFileKind::Directory => {
                dirs.entry(file.path.clone()).or_default();
            }
            _ => {
                let (dir, _) = split_dir(&file.path);
                dirs.entry(dir.to_string()).or_default().push(file);
            }
        }
    }

    for (dir, entries) in &dirs {
        if !dir.is_empty() {
            stanza.extend_from_slice(format!("F:{}\n", dir).as_bytes());
        }
        for file in entries {
            let (_, base) = split_dir(&file.path);
            stanza.extend_from_slice(format!("R:{}\n", base).as_bytes());
            stanza.extend_from_slice(format!("a:0:0:{:o}\n", file.mode).as_bytes());
            if let InstalledFileKind::File { digest } = &file.kind {
                stanza.extend_from_slice(
                    format!("Z:{}\n", Checksum::from_bytes(digest.clone())).as_bytes(),
                );
            }
        }
    }

    stanza.push(b'\n');

    let mut installed = fs.read_file(INSTALLED_FILE)?;
    installed.extend_from_slice(&stanza);
    fs.write_file(INSTALLED_FILE, &installed, 0o644)?;

    Ok(())
}

fn split_dir(path: &str) -> (&str, &str) {
    match path.rsplit_once('/') {
        Some((dir, base)) => (dir, base),
        None => ("", path),
    }
}

/// Append a package's trigger patterns to the triggers file.
pub(crate) fn update_triggers(
    fs: &dyn ApkFilesystem,
    checksum: &Checksum,
    triggers: &str,
) -> Result<()> {
    let mut data = fs.read_file(TRIGGERS_FILE)?;
    data.extend_from_slice(format!("{} {}\n", checksum, triggers).as_bytes());
    fs.write_file(TRIGGERS_FILE, &data, 0o644)?;

    Ok(())
}

/// Append a package's control files to `scripts.tar` under a
/// `<name>-<version>.Q1<checksum>/` prefix.
///
/// The existing archive is copied entry by entry so its trailer ends up
/// after the appended entries.
pub(crate) fn update_scripts_tar(
    fs: &dyn ApkFilesystem,
    pkg: &IndexPackage,
    control_tar_gz: &[u8],
    control_hash: &[u8],
    source_date_epoch: Option<i64>,
) -> Result<()> {
    let existing = fs.read_file(SCRIPTS_FILE)?;

    let mut builder = tar::Builder::new(Vec::new());

    if !existing.is_empty() {
        let mut archive = tar::Archive::new(std::io::Cursor::new(&existing));
        for entry in archive.entries()? {
            let mut entry = entry?;
            let mut header = entry.header().clone();
            let path = entry.path()?.to_path_buf();
            let mut data = Vec::new();
            entry.read_to_end(&mut data)?;
            builder.append_data(&mut header, path, std::io::Cursor::new(data))?;
        }
    }

    let prefix = format!(
        "{}-{}.{}",
        pkg.name,
        pkg.version,
        Checksum::from_bytes(control_hash.to_vec())
    );

    let mut decoder = GzDecoder::new(control_tar_gz);
    let mut control_tar = Vec::new();
    decoder.read_to_end(&mut control_tar)?;

    let mut archive = tar::Archive::new(std::io::Cursor::new(&control_tar));
    for entry in archive.entries()? {
        let mut entry = entry?;
        let mut header = entry.header().clone();

        if let Some(epoch) = source_date_epoch {
            let epoch = epoch.max(0) as u64;
            if header.mtime().unwrap_or(0) > epoch {
                header.set_mtime(epoch);
            }
        }

        let name = entry.path()?.to_string_lossy().to_string();
        let name = name.trim_start_matches("./");
        let path = format!("{}/{}", prefix, name);

        let mut data = Vec::new();
        entry.read_to_end(&mut data)?;
        builder.append_data(&mut header, &path, std::io::Cursor::new(data))?;
    }

    let data = builder
        .into_inner()
        .map_err(|e| ApkError::Internal(format!("serializing scripts.tar: {}", e)))?;
    fs.write_file(SCRIPTS_FILE, &data, 0o644)?;

    Ok(())
}
