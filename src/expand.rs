// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Splitting package archives into their constituent streams.

An `.apk` file is a concatenation of 2 or 3 independent gzip members: an
optional signature member (a tar holding a single `.SIGN.*` entry), a
control member (a tar holding `.PKGINFO` and install scripts) and a data
member (the filesystem payload tar).

The splitter consumes one input stream and produces per-member files on
disk. Each gzip member is self-delimiting, so the raw compressed bytes are
teed into a file while a parallel decompressed stream is hashed; member
boundaries fall out of the decoder stopping at its trailer with the next
header's magic left unconsumed. Decompress-then-recompress would destroy
the on-wire digests, so the raw bytes are never reencoded.
*/

use {
    crate::{
        control::{ControlParagraph, ControlParagraphReader},
        error::{ApkError, Result},
        io::{sha1_digest, DigestingWriter, RawCaptureReader},
    },
    flate2::bufread::GzDecoder,
    std::{
        fs::File,
        io::{BufRead, BufReader, Read, Write},
        path::{Path, PathBuf},
    },
};

/// First byte of a gzip member header.
const GZIP_MAGIC: u8 = 0x1f;

/// An expanded package on disk.
///
/// All paths exist and are readable; `tar_file` is `package_file` without
/// its `.gz` suffix and holds the decompressed payload.
#[derive(Clone, Debug)]
pub struct ApkExpanded {
    /// Raw control member (`.tar.gz`).
    pub control_file: PathBuf,

    /// Raw signature member (`.tar.gz`), when the archive was signed.
    pub signature_file: Option<PathBuf>,

    /// Raw data member (`.tar.gz`).
    pub package_file: PathBuf,

    /// Decompressed data member (`.tar`).
    pub tar_file: PathBuf,

    /// SHA-1 of the decompressed control tar.
    pub control_hash: Vec<u8>,

    /// SHA-1 of the decompressed data tar. Matches the `datahash` control
    /// field.
    pub package_hash: Vec<u8>,

    /// Whether a signature member was present.
    pub signed: bool,

    /// Total size in bytes of the raw members on disk.
    pub size: u64,
}

impl ApkExpanded {
    /// Open the decompressed payload tar for reading.
    pub fn package_data(&self) -> Result<File> {
        Ok(File::open(&self.tar_file)?)
    }

    /// Read the raw control member into memory.
    pub fn control_data(&self) -> Result<Vec<u8>> {
        Ok(std::fs::read(&self.control_file)?)
    }
}

fn temp_path(dir: &Path, prefix: &str, suffix: &str) -> Result<PathBuf> {
    let file = tempfile::Builder::new()
        .prefix(prefix)
        .suffix(suffix)
        .tempfile_in(dir)?;

    Ok(file.into_temp_path().keep().map_err(|e| e.error)?)
}

/// Read one gzip member off `reader`, teeing the raw compressed bytes into
/// `raw_out` and writing the decompressed bytes to `decompressed`.
fn split_member<R: BufRead>(
    reader: &mut R,
    raw_out: &mut File,
    decompressed: &mut dyn Write,
) -> Result<()> {
    let mut capture = RawCaptureReader::new(reader, raw_out);
    let mut decoder = GzDecoder::new(&mut capture);
    std::io::copy(&mut decoder, decompressed)?;

    Ok(())
}

/// Whether another member follows on the stream.
///
/// Errors if trailing bytes are present that do not start a gzip member.
fn has_next_member<R: BufRead>(reader: &mut R) -> Result<bool> {
    let buf = reader.fill_buf()?;

    if buf.is_empty() {
        Ok(false)
    } else if buf[0] == GZIP_MAGIC {
        Ok(true)
    } else {
        Err(ApkError::Archive(
            "trailing bytes after final gzip member".to_string(),
        ))
    }
}

/// Whether a decompressed tar holds only `.SIGN.*` entries.
fn is_signature_tar(data: &[u8]) -> Result<bool> {
    let mut archive = tar::Archive::new(std::io::Cursor::new(data));
    let mut seen = false;

    for entry in archive.entries()? {
        let entry = entry?;
        let path = entry.path()?;
        if !path.to_string_lossy().starts_with(".SIGN.") {
            return Ok(false);
        }
        seen = true;
    }

    Ok(seen)
}

/// Split a package archive into signature/control/data files in `out_dir`.
///
/// The raw gzip bytes of each member are preserved verbatim, so
/// concatenating the output files reconstructs the input byte-for-byte.
/// The `datahash` field inside the control member is checked against the
/// computed payload digest.
pub fn expand_apk<R: Read>(reader: R, out_dir: &Path) -> Result<ApkExpanded> {
    let mut reader = BufReader::new(reader);

    // First member: signature or control. Either way it is a small tar, so
    // buffer the decompressed bytes to classify it.
    let first_path = temp_path(out_dir, "member-", ".tar.gz")?;
    let mut first_raw = File::create(&first_path)?;
    let mut first_tar = Vec::new();
    split_member(&mut reader, &mut first_raw, &mut first_tar)?;
    first_raw.flush()?;

    if !has_next_member(&mut reader)? {
        return Err(ApkError::Archive(
            "archive ended after a single gzip member".to_string(),
        ));
    }

    let (signature_file, control_file, control_tar) = if is_signature_tar(&first_tar)? {
        let control_path = temp_path(out_dir, "ctl-", ".tar.gz")?;
        let mut control_raw = File::create(&control_path)?;
        let mut control_tar = Vec::new();
        split_member(&mut reader, &mut control_raw, &mut control_tar)?;
        control_raw.flush()?;

        if !has_next_member(&mut reader)? {
            return Err(ApkError::Archive(
                "signed archive lacks a data member".to_string(),
            ));
        }

        (Some(first_path), control_path, control_tar)
    } else {
        (None, first_path, first_tar)
    };

    // Remaining member: the payload. Stream it to disk while hashing; it
    // can be arbitrarily large.
    let package_file = temp_path(out_dir, "dat-", ".tar.gz")?;
    let tar_file = PathBuf::from(
        package_file
            .to_string_lossy()
            .strip_suffix(".gz")
            .ok_or_else(|| ApkError::Internal("data member path lacks .gz suffix".to_string()))?
            .to_string(),
    );

    let mut package_raw = File::create(&package_file)?;
    let mut data_writer = DigestingWriter::new(File::create(&tar_file)?);
    split_member(&mut reader, &mut package_raw, &mut data_writer)?;
    package_raw.flush()?;
    let (mut tar_out, package_hash) = data_writer.finish();
    tar_out.flush()?;

    if has_next_member(&mut reader)? {
        return Err(ApkError::Archive(
            "archive has more than three gzip members".to_string(),
        ));
    }

    let control_hash = sha1_digest(&control_tar);

    let expected = data_hash_hex(&control_tar)?;
    let actual = hex::encode(&package_hash);
    if expected != actual {
        return Err(ApkError::HashMismatch { expected, actual });
    }

    let mut size = 0;
    for path in [Some(&control_file), signature_file.as_ref(), Some(&package_file)]
        .into_iter()
        .flatten()
    {
        size += std::fs::metadata(path)?.len();
    }

    Ok(ApkExpanded {
        control_file,
        signed: signature_file.is_some(),
        signature_file,
        package_file,
        tar_file,
        control_hash,
        package_hash,
        size,
    })
}

/// Parse the `.PKGINFO` paragraph out of a decompressed control tar.
pub(crate) fn control_paragraph(control_tar: &[u8]) -> Result<ControlParagraph> {
    let mut archive = tar::Archive::new(std::io::Cursor::new(control_tar));

    for entry in archive.entries()? {
        let mut entry = entry?;
        if entry.path()?.to_string_lossy().trim_start_matches("./") == ".PKGINFO" {
            let mut data = Vec::new();
            entry.read_to_end(&mut data)?;

            return ControlParagraphReader::new(std::io::Cursor::new(data))
                .next()
                .transpose()?
                .ok_or_else(|| {
                    ApkError::ControlParse(".PKGINFO holds no paragraph".to_string())
                });
        }
    }

    Err(ApkError::ControlParse(
        "control member lacks .PKGINFO".to_string(),
    ))
}

/// Parse the `.PKGINFO` paragraph out of a raw (gzip) control member.
pub(crate) fn control_paragraph_from_gz(reader: impl Read) -> Result<ControlParagraph> {
    let mut decoder = flate2::read::GzDecoder::new(reader);
    let mut control_tar = Vec::new();
    decoder.read_to_end(&mut control_tar)?;

    control_paragraph(&control_tar)
}

/// The `datahash` value declared in a decompressed control tar.
pub(crate) fn data_hash_hex(control_tar: &[u8]) -> Result<String> {
    control_paragraph(control_tar)?
        .field_str("datahash")
        .map(|v| v.trim().to_string())
        .ok_or_else(|| ApkError::ControlParse("control lacks a datahash field".to_string()))
}

#[cfg(test)]
mod test {
    use {super::*, crate::testutil::build_apk};

    #[test]
    fn split_unsigned() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let fixture = build_apk("hello", "1.0-r0", &[], &[("usr/", b""), ("usr/bin/hello", b"#!/bin/sh\n")], false);

        let exp = expand_apk(std::io::Cursor::new(fixture.bytes.clone()), dir.path())?;

        assert!(!exp.signed);
        assert!(exp.signature_file.is_none());
        assert_eq!(exp.control_hash, fixture.control_hash());
        assert_eq!(exp.package_hash, fixture.data_hash());
        assert_eq!(std::fs::read(&exp.tar_file)?, fixture.data_tar);

        Ok(())
    }

    #[test]
    fn split_signed_round_trips_raw_bytes() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let fixture = build_apk("hello", "1.0-r0", &[], &[("etc/motd", b"hi\n")], true);

        let exp = expand_apk(std::io::Cursor::new(fixture.bytes.clone()), dir.path())?;

        assert!(exp.signed);
        let sig = exp.signature_file.as_ref().unwrap();
        assert_eq!(std::fs::read(sig)?, fixture.signature_member.unwrap());
        assert_eq!(std::fs::read(&exp.control_file)?, fixture.control_member);
        assert_eq!(std::fs::read(&exp.package_file)?, fixture.data_member);

        // Concatenating the raw members reconstructs the archive.
        let mut rebuilt = std::fs::read(sig)?;
        rebuilt.extend(std::fs::read(&exp.control_file)?);
        rebuilt.extend(std::fs::read(&exp.package_file)?);
        assert_eq!(rebuilt, fixture.bytes);

        assert_eq!(exp.size, fixture.bytes.len() as u64);

        Ok(())
    }

    #[test]
    fn tar_file_is_package_file_without_gz() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let fixture = build_apk("hello", "1.0-r0", &[], &[("etc/motd", b"hi\n")], false);

        let exp = expand_apk(std::io::Cursor::new(fixture.bytes), dir.path())?;

        assert_eq!(
            exp.tar_file.to_string_lossy(),
            exp.package_file.to_string_lossy().trim_end_matches(".gz")
        );

        Ok(())
    }

    #[test]
    fn datahash_mismatch_is_detected() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let good = build_apk("hello", "1.0-r0", &[], &[("etc/a", b"a\n")], false);
        let other = build_apk("hello", "1.0-r0", &[], &[("etc/b", b"b\n")], false);

        // Control from one archive, payload from another.
        let mut bytes = good.control_member.clone();
        bytes.extend_from_slice(&other.data_member);

        match expand_apk(std::io::Cursor::new(bytes), dir.path()) {
            Err(ApkError::HashMismatch { .. }) => {}
            res => panic!("expected hash mismatch, got {:?}", res.map(|_| ())),
        }

        Ok(())
    }

    #[test]
    fn truncated_stream_is_an_error() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let fixture = build_apk("hello", "1.0-r0", &[], &[("etc/motd", b"hi\n")], false);

        let truncated = &fixture.bytes[..fixture.bytes.len() / 2];
        assert!(expand_apk(std::io::Cursor::new(truncated.to_vec()), dir.path()).is_err());

        let mut trailing = fixture.bytes.clone();
        trailing.extend_from_slice(b"junk");
        assert!(expand_apk(std::io::Cursor::new(trailing), dir.path()).is_err());

        Ok(())
    }

    #[test]
    fn control_values() -> Result<()> {
        let fixture = build_apk(
            "hello",
            "1.0-r0",
            &[("triggers", "/usr/share/icons/*")],
            &[("etc/motd", b"hi\n")],
            false,
        );

        let paragraph = control_paragraph(&fixture.control_tar)?;
        assert_eq!(paragraph.field_str("P"), Some("hello"));
        assert_eq!(paragraph.field_str("triggers"), Some("/usr/share/icons/*"));

        assert_eq!(
            data_hash_hex(&fixture.control_tar)?,
            hex::encode(fixture.data_hash())
        );

        Ok(())
    }
}
