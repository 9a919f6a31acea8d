// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Shared helpers for constructing archive fixtures in tests. */

use {
    crate::io::sha1_digest,
    flate2::{write::GzEncoder, Compression},
    std::io::Write,
};

/// Gzip-compress a byte slice into a single member.
pub(crate) fn gzip(data: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

/// Build an uncompressed tar archive from `(path, content)` pairs.
///
/// Paths ending in `/` become directories.
pub(crate) fn tar_archive(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());

    for (path, content) in entries {
        let mut header = tar::Header::new_ustar();
        if path.ends_with('/') {
            header.set_entry_type(tar::EntryType::Directory);
            header.set_mode(0o755);
            header.set_size(0);
            builder.append_data(&mut header, path, std::io::empty()).unwrap();
        } else {
            header.set_entry_type(tar::EntryType::Regular);
            header.set_mode(0o644);
            header.set_size(content.len() as u64);
            builder.append_data(&mut header, path, *content).unwrap();
        }
    }

    builder.into_inner().unwrap()
}

/// A synthetic `.apk` archive and its constituent parts.
pub(crate) struct ApkFixture {
    /// The concatenated gzip members forming the archive.
    pub bytes: Vec<u8>,
    /// Raw (compressed) signature member, when signed.
    pub signature_member: Option<Vec<u8>>,
    /// Raw (compressed) control member.
    pub control_member: Vec<u8>,
    /// Raw (compressed) data member.
    pub data_member: Vec<u8>,
    /// Decompressed control tar.
    pub control_tar: Vec<u8>,
    /// Decompressed data tar.
    pub data_tar: Vec<u8>,
}

impl ApkFixture {
    pub fn control_hash(&self) -> Vec<u8> {
        sha1_digest(&self.control_tar)
    }

    pub fn data_hash(&self) -> Vec<u8> {
        sha1_digest(&self.data_tar)
    }
}

/// Build a package archive whose control member carries a correct
/// `datahash` field plus any extra control fields supplied.
pub(crate) fn build_apk(
    name: &str,
    version: &str,
    extra_control: &[(&str, &str)],
    data_entries: &[(&str, &[u8])],
    signed: bool,
) -> ApkFixture {
    let data_tar = tar_archive(data_entries);
    let datahash = hex::encode(sha1_digest(&data_tar));

    let mut pkginfo = format!("P:{}\nV:{}\n", name, version);
    for (key, value) in extra_control {
        pkginfo.push_str(&format!("{}:{}\n", key, value));
    }
    pkginfo.push_str(&format!("datahash:{}\n", datahash));

    let control_tar = tar_archive(&[(".PKGINFO", pkginfo.as_bytes())]);

    let signature_member = signed.then(|| {
        let sig_tar = tar_archive(&[(".SIGN.RSA.test.rsa.pub", b"not a real signature")]);
        gzip(&sig_tar)
    });
    let control_member = gzip(&control_tar);
    let data_member = gzip(&data_tar);

    let mut bytes = Vec::new();
    if let Some(sig) = &signature_member {
        bytes.extend_from_slice(sig);
    }
    bytes.extend_from_slice(&control_member);
    bytes.extend_from_slice(&data_member);

    ApkFixture {
        bytes,
        signature_member,
        control_member,
        data_member,
        control_tar,
        data_tar,
    }
}
