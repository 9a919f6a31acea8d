// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Applying an expanded package to the target filesystem.

Installation of one package walks its payload tar and emits every entry
through the [crate::fs::ApkFilesystem] seam, then updates the three
database artifacts: `scripts.tar`, `triggers` and `installed`. A file that
already exists on the target may only be overwritten when the incoming
package shares the owner's origin or names the owner in `replaces`.

Installs are strictly sequential: overwrite checks and the append-only
database files are all order-dependent.
*/

use {
    crate::{
        database::{self, InstalledFile, InstalledFileKind},
        dependency::Dependency,
        error::{ApkError, Result},
        expand::{control_paragraph_from_gz, ApkExpanded},
        fs::ApkFilesystem,
        io::sha1_digest,
        package::{Checksum, IndexPackage},
    },
    log::debug,
    std::{collections::HashSet, io::Read},
};

/// Install a single package and update the installed database.
pub(crate) fn install_package(
    fs: &dyn ApkFilesystem,
    pkg: &IndexPackage,
    expanded: &ApkExpanded,
    source_date_epoch: Option<i64>,
) -> Result<()> {
    debug!("installing {} ({})", pkg.name, pkg.version);

    let mut files = install_apk_files(fs, expanded.package_data()?, pkg)?;
    files.sort_by(|a, b| a.path.cmp(&b.path));

    let control = expanded.control_data()?;

    database::update_scripts_tar(fs, pkg, &control, &expanded.control_hash, source_date_epoch)?;

    let paragraph = control_paragraph_from_gz(control.as_slice())?;
    if let Some(triggers) = paragraph.field_str("triggers") {
        let checksum = pkg
            .checksum
            .clone()
            .unwrap_or_else(|| Checksum::from_bytes(expanded.control_hash.clone()));
        database::update_triggers(fs, &checksum, triggers)?;
    }

    database::add_installed_package(fs, pkg, &files, source_date_epoch)?;

    Ok(())
}

/// Extract a payload tar onto the target, returning the records for the
/// installed database.
fn install_apk_files(
    fs: &dyn ApkFilesystem,
    data: impl Read,
    pkg: &IndexPackage,
) -> Result<Vec<InstalledFile>> {
    let owners = database::file_owners(fs)?;
    let replaces: HashSet<String> = pkg
        .replaces
        .iter()
        .filter_map(|atom| Dependency::parse(atom).ok())
        .map(|dep| dep.name)
        .collect();

    let mut installed = Vec::new();

    let mut archive = tar::Archive::new(data);
    for entry in archive.entries()? {
        let mut entry = entry?;

        let path = entry
            .path()?
            .to_string_lossy()
            .trim_start_matches("./")
            .trim_end_matches('/')
            .to_string();
        if path.is_empty() {
            continue;
        }

        let header = entry.header();
        let mode = header.mode()?;
        let size = entry.size();
        let entry_type = header.entry_type();

        match entry_type {
            tar::EntryType::Directory => {
                fs.mkdir_all(&path, mode)?;
                installed.push(InstalledFile {
                    path,
                    mode,
                    size: 0,
                    kind: InstalledFileKind::Directory,
                });
            }
            tar::EntryType::Regular => {
                if fs.exists(&path) {
                    let allowed = match owners.get(&path) {
                        Some(owner) => {
                            owner.origin == pkg.origin || replaces.contains(&owner.package)
                        }
                        None => false,
                    };
                    if !allowed {
                        return Err(ApkError::Conflict(format!(
                            "file {} already exists and {} does not replace its owner",
                            path, pkg.name
                        )));
                    }
                }

                let mut content = Vec::with_capacity(size as usize);
                entry.read_to_end(&mut content)?;
                fs.write_file(&path, &content, mode)?;

                installed.push(InstalledFile {
                    path,
                    mode,
                    size,
                    kind: InstalledFileKind::File {
                        digest: sha1_digest(&content),
                    },
                });
            }
            tar::EntryType::Symlink => {
                let target = entry
                    .link_name()?
                    .ok_or_else(|| {
                        ApkError::Archive(format!("symlink {} lacks a target", path))
                    })?
                    .to_string_lossy()
                    .to_string();

                fs.symlink(&target, &path)?;
                installed.push(InstalledFile {
                    path,
                    mode,
                    size: 0,
                    kind: InstalledFileKind::Symlink { target },
                });
            }
            tar::EntryType::Link => {
                let target = entry
                    .link_name()?
                    .ok_or_else(|| {
                        ApkError::Archive(format!("hard link {} lacks a target", path))
                    })?
                    .to_string_lossy()
                    .trim_start_matches("./")
                    .to_string();

                fs.hard_link(&target, &path)?;
                installed.push(InstalledFile {
                    path,
                    mode,
                    size: 0,
                    kind: InstalledFileKind::HardLink { target },
                });
            }
            tar::EntryType::Char => {
                let major = header.device_major()?.unwrap_or(0) as u64;
                let minor = header.device_minor()?.unwrap_or(0) as u64;

                fs.mknod(&path, mode, major, minor)?;
                installed.push(InstalledFile {
                    path,
                    mode,
                    size: 0,
                    kind: InstalledFileKind::CharDevice { major, minor },
                });
            }
            other => {
                debug!("skipping tar entry {} of type {:?}", path, other);
            }
        }
    }

    Ok(installed)
}

#[cfg(test)]
mod test {
    use {
        super::*,
        crate::{
            database::{INSTALLED_FILE, SCRIPTS_FILE, TRIGGERS_FILE},
            expand::expand_apk,
            fs::DirFilesystem,
            testutil::build_apk,
        },
    };

    fn test_fs() -> (tempfile::TempDir, DirFilesystem) {
        let root = tempfile::tempdir().unwrap();
        let fs = DirFilesystem::new(root.path());
        fs.mkdir_all("lib/apk/db", 0o755).unwrap();
        fs.write_file(INSTALLED_FILE, b"", 0o644).unwrap();
        fs.write_file(TRIGGERS_FILE, b"", 0o644).unwrap();
        fs.write_file(SCRIPTS_FILE, b"", 0o644).unwrap();
        (root, fs)
    }

    fn test_pkg(name: &str, origin: &str) -> IndexPackage {
        IndexPackage {
            name: name.to_string(),
            version: "1.0-r0".to_string(),
            origin: origin.to_string(),
            ..Default::default()
        }
    }

    fn expand_fixture(
        fixture: &crate::testutil::ApkFixture,
        dir: &std::path::Path,
    ) -> ApkExpanded {
        expand_apk(std::io::Cursor::new(fixture.bytes.clone()), dir).unwrap()
    }

    #[test]
    fn install_writes_files_and_database() -> Result<()> {
        let (_root, fs) = test_fs();
        let work = tempfile::tempdir()?;

        let fixture = build_apk(
            "hello",
            "1.0-r0",
            &[("triggers", "/usr/share/icons/*")],
            &[
                ("usr/", b""),
                ("usr/bin/", b""),
                ("usr/bin/hello", b"#!/bin/sh\necho hello\n"),
            ],
            false,
        );
        let expanded = expand_fixture(&fixture, work.path());

        install_package(&fs, &test_pkg("hello", "hello"), &expanded, Some(1_000))?;

        assert_eq!(fs.read_file("usr/bin/hello")?, b"#!/bin/sh\necho hello\n");
        assert!(database::is_installed(&fs, "hello")?);

        let owners = database::file_owners(&fs)?;
        assert_eq!(owners.get("usr/bin/hello").unwrap().package, "hello");

        let triggers = String::from_utf8(fs.read_file(TRIGGERS_FILE)?).unwrap();
        assert!(triggers.trim_end().ends_with("/usr/share/icons/*"));

        let scripts = fs.read_file(SCRIPTS_FILE)?;
        assert!(!scripts.is_empty());

        Ok(())
    }

    #[test]
    fn overwrite_requires_replaces() -> Result<()> {
        let (_root, fs) = test_fs();
        let work = tempfile::tempdir()?;

        let original = build_apk(
            "orig",
            "1.0-r0",
            &[],
            &[("etc/", b""), ("etc/shared.conf", b"v1\n")],
            false,
        );
        let expanded = expand_fixture(&original, work.path());
        install_package(&fs, &test_pkg("orig", "orig"), &expanded, None)?;

        // A package that does not replace the owner fails.
        let intruder = build_apk(
            "intruder",
            "1.0-r0",
            &[],
            &[("etc/", b""), ("etc/shared.conf", b"v2\n")],
            false,
        );
        let expanded = expand_fixture(&intruder, work.path());
        assert!(matches!(
            install_package(&fs, &test_pkg("intruder", "intruder"), &expanded, None),
            Err(ApkError::Conflict(_))
        ));
        assert_eq!(fs.read_file("etc/shared.conf")?, b"v1\n");

        // Declaring the owner in replaces allows the overwrite.
        let replacer = build_apk(
            "replacer",
            "1.0-r0",
            &[],
            &[("etc/", b""), ("etc/shared.conf", b"v3\n")],
            false,
        );
        let expanded = expand_fixture(&replacer, work.path());
        let mut pkg = test_pkg("replacer", "replacer");
        pkg.replaces = vec!["orig".to_string()];
        install_package(&fs, &pkg, &expanded, None)?;
        assert_eq!(fs.read_file("etc/shared.conf")?, b"v3\n");

        Ok(())
    }

    #[test]
    fn same_origin_may_overwrite() -> Result<()> {
        let (_root, fs) = test_fs();
        let work = tempfile::tempdir()?;

        let first = build_apk(
            "lib-dev",
            "1.0-r0",
            &[],
            &[("usr/", b""), ("usr/lib/", b""), ("usr/lib/lib.so", b"so\n")],
            false,
        );
        let expanded = expand_fixture(&first, work.path());
        install_package(&fs, &test_pkg("lib-dev", "lib"), &expanded, None)?;

        let second = build_apk(
            "lib-doc",
            "1.0-r0",
            &[],
            &[("usr/", b""), ("usr/lib/", b""), ("usr/lib/lib.so", b"so2\n")],
            false,
        );
        let expanded = expand_fixture(&second, work.path());
        install_package(&fs, &test_pkg("lib-doc", "lib"), &expanded, None)?;

        assert_eq!(fs.read_file("usr/lib/lib.so")?, b"so2\n");

        Ok(())
    }
}
