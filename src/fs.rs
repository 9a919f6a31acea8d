// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! The target filesystem interface.

All writes the installer performs go through [ApkFilesystem], so a target
root can be a plain directory, a staging area for an image build, or
anything else that can satisfy the trait. Paths are target-absolute
(`etc/apk/world` and `/etc/apk/world` are equivalent).

[DirFilesystem] is the standard implementation, rooted at a host
directory.
*/

use {
    crate::error::Result,
    std::{
        os::unix::fs::PermissionsExt,
        path::{Path, PathBuf},
    },
};

/// Filesystem operations the installer needs from a target root.
pub trait ApkFilesystem: Send + Sync {
    /// Create a directory. Succeeds when the directory already exists.
    fn mkdir(&self, path: &str, mode: u32) -> Result<()>;

    /// Create a directory and any missing parents.
    fn mkdir_all(&self, path: &str, mode: u32) -> Result<()>;

    /// Write a file, replacing any previous content, with the given mode.
    fn write_file(&self, path: &str, data: &[u8], mode: u32) -> Result<()>;

    /// Read a file's full content.
    fn read_file(&self, path: &str) -> Result<Vec<u8>>;

    /// Whether a path exists.
    fn exists(&self, path: &str) -> bool;

    /// File names within a directory, sorted.
    fn read_dir(&self, path: &str) -> Result<Vec<String>>;

    /// Create a symbolic link at `link` pointing at `target`.
    fn symlink(&self, target: &str, link: &str) -> Result<()>;

    /// Create a hard link at `link` to `original`.
    fn hard_link(&self, original: &str, link: &str) -> Result<()>;

    /// Create a character device node.
    fn mknod(&self, path: &str, mode: u32, major: u64, minor: u64) -> Result<()>;
}

/// An [ApkFilesystem] rooted at a host directory.
#[derive(Clone, Debug)]
pub struct DirFilesystem {
    root: PathBuf,
}

impl DirFilesystem {
    /// Construct an instance rooted at the given directory.
    ///
    /// The directory is not created or validated here.
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    fn resolve(&self, path: &str) -> PathBuf {
        self.root.join(path.trim_start_matches('/'))
    }
}

impl ApkFilesystem for DirFilesystem {
    fn mkdir(&self, path: &str, mode: u32) -> Result<()> {
        let full = self.resolve(path);

        match std::fs::create_dir(&full) {
            Ok(()) => {
                std::fs::set_permissions(&full, std::fs::Permissions::from_mode(mode))?;
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists && full.is_dir() => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn mkdir_all(&self, path: &str, mode: u32) -> Result<()> {
        let full = self.resolve(path);

        if !full.is_dir() {
            std::fs::create_dir_all(&full)?;
            std::fs::set_permissions(&full, std::fs::Permissions::from_mode(mode))?;
        }

        Ok(())
    }

    fn write_file(&self, path: &str, data: &[u8], mode: u32) -> Result<()> {
        let full = self.resolve(path);

        std::fs::write(&full, data)?;
        std::fs::set_permissions(&full, std::fs::Permissions::from_mode(mode))?;

        Ok(())
    }

    fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        Ok(std::fs::read(self.resolve(path))?)
    }

    fn exists(&self, path: &str) -> bool {
        self.resolve(path).exists()
    }

    fn read_dir(&self, path: &str) -> Result<Vec<String>> {
        let mut names = Vec::new();

        for entry in std::fs::read_dir(self.resolve(path))? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                continue;
            }
            names.push(entry.file_name().to_string_lossy().to_string());
        }

        names.sort();

        Ok(names)
    }

    fn symlink(&self, target: &str, link: &str) -> Result<()> {
        Ok(std::os::unix::fs::symlink(target, self.resolve(link))?)
    }

    fn hard_link(&self, original: &str, link: &str) -> Result<()> {
        Ok(std::fs::hard_link(
            self.resolve(original),
            self.resolve(link),
        )?)
    }

    fn mknod(&self, path: &str, mode: u32, major: u64, minor: u64) -> Result<()> {
        let full = self.resolve(path);

        nix::sys::stat::mknod(
            full.as_path(),
            nix::sys::stat::SFlag::S_IFCHR,
            nix::sys::stat::Mode::from_bits_truncate(mode),
            nix::sys::stat::makedev(major, minor),
        )
        .map_err(|e| std::io::Error::from_raw_os_error(e as i32))?;

        Ok(())
    }
}
