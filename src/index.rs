// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Repository index loading.

`APKINDEX.tar.gz` files share the package archive layout: a signature
member followed by a content member whose tar holds the `APKINDEX` file.
The detached signature covers the raw bytes of the content member and is
verified against a keyring entry named inside the signature tar.
*/

use {
    crate::{
        cache::CachingClient,
        control::ControlParagraphReader,
        error::{ApkError, Result},
        io::RawCaptureReader,
        package::IndexPackage,
    },
    flate2::bufread::GzDecoder,
    log::{debug, info},
    rsa::{pkcs8::DecodePublicKey, Pkcs1v15Sign, RsaPublicKey},
    sha1::{Digest, Sha1},
    sha2::Sha256,
    std::{
        collections::HashMap,
        io::{BufRead, Read},
        sync::Arc,
    },
    tokio_util::sync::CancellationToken,
};

/// Relative location of the index within a repository/architecture.
const INDEX_FILENAME: &str = "APKINDEX.tar.gz";

/// An index that contains all of its packages, along with an optional pin
/// name and the source it was loaded from. Immutable after load.
#[derive(Clone, Debug)]
pub struct NamedIndex {
    name: String,
    source: String,
    packages: Vec<Arc<IndexPackage>>,
}

impl NamedIndex {
    /// Construct an index from already-parsed packages.
    pub fn new(name: impl ToString, source: impl ToString, packages: Vec<IndexPackage>) -> Self {
        Self {
            name: name.to_string(),
            source: source.to_string(),
            packages: packages.into_iter().map(Arc::new).collect(),
        }
    }

    /// The pin name assigned to this index, or the empty string.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The URI the index was loaded from.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Packages in index order.
    pub fn packages(&self) -> &[Arc<IndexPackage>] {
        &self.packages
    }

    /// Number of packages in the index.
    pub fn count(&self) -> usize {
        self.packages.len()
    }
}

/// A repository line, possibly prefixed with a `@pin` label.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct RepositorySpec {
    pub pin: String,
    pub uri: String,
}

impl RepositorySpec {
    /// Parse a `/etc/apk/repositories` line of the form
    /// `[@pinname ]uri`.
    pub fn parse(line: &str) -> Self {
        let line = line.trim();

        if let Some(rest) = line.strip_prefix('@') {
            if let Some((pin, uri)) = rest.split_once(char::is_whitespace) {
                return Self {
                    pin: pin.to_string(),
                    uri: uri.trim().to_string(),
                };
            }
        }

        Self {
            pin: String::new(),
            uri: line.to_string(),
        }
    }
}

/// Fetch, verify and parse the indexes for a set of repositories.
///
/// `keys` maps keyring filenames to public key bytes. Signature
/// verification is skipped only when `ignore_signatures` is set.
pub async fn fetch_repository_indexes(
    token: &CancellationToken,
    client: &CachingClient,
    repositories: &[String],
    keys: &HashMap<String, Vec<u8>>,
    arch: &str,
    ignore_signatures: bool,
) -> Result<Vec<NamedIndex>> {
    let mut indexes = Vec::with_capacity(repositories.len());

    for line in repositories {
        let spec = RepositorySpec::parse(line);
        if spec.uri.is_empty() {
            continue;
        }

        let repository_uri = format!("{}/{}", spec.uri.trim_end_matches('/'), arch);
        let index_uri = format!("{}/{}", repository_uri, INDEX_FILENAME);

        info!("fetching repository index {}", index_uri);
        let data = client.get_cached(token, &index_uri).await?;

        let index = parse_repository_index(
            &data,
            keys,
            ignore_signatures,
            &spec.pin,
            &repository_uri,
            &index_uri,
        )?;
        debug!("index {} holds {} packages", index_uri, index.count());

        indexes.push(index);
    }

    Ok(indexes)
}

/// A gzip member split off an index archive: its raw compressed bytes and
/// the decompressed tar.
struct IndexMember {
    raw: Vec<u8>,
    tar: Vec<u8>,
}

fn split_index_members(data: &[u8]) -> Result<Vec<IndexMember>> {
    let mut reader = std::io::BufReader::new(std::io::Cursor::new(data));
    let mut members = Vec::new();

    loop {
        let buf = reader.fill_buf()?;
        if buf.is_empty() {
            break;
        }

        let mut raw = Vec::new();
        let mut tar = Vec::new();
        {
            let mut capture = RawCaptureReader::new(&mut reader, &mut raw);
            let mut decoder = GzDecoder::new(&mut capture);
            decoder.read_to_end(&mut tar)?;
        }

        members.push(IndexMember { raw, tar });
    }

    if members.is_empty() {
        return Err(ApkError::Archive("index archive is empty".to_string()));
    }

    Ok(members)
}

/// Verify the detached signature member against the raw bytes it covers.
///
/// The signature tar holds a single `.SIGN.RSA.<key>` or
/// `.SIGN.RSA256.<key>` entry whose name selects the keyring entry.
fn verify_index_signature(
    signature_tar: &[u8],
    signed: &[u8],
    keys: &HashMap<String, Vec<u8>>,
) -> Result<()> {
    let mut archive = tar::Archive::new(std::io::Cursor::new(signature_tar));

    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.to_string_lossy().to_string();

        let (key_name, sha256) = if let Some(name) = path.strip_prefix(".SIGN.RSA256.") {
            (name.to_string(), true)
        } else if let Some(name) = path.strip_prefix(".SIGN.RSA.") {
            (name.to_string(), false)
        } else {
            continue;
        };

        let key_data = keys
            .get(&key_name)
            .ok_or_else(|| ApkError::MissingKey(key_name.clone()))?;
        let pem = std::str::from_utf8(key_data)
            .map_err(|_| ApkError::SignatureInvalid(format!("key {} is not PEM", key_name)))?;
        let public_key = RsaPublicKey::from_public_key_pem(pem)
            .map_err(|e| ApkError::SignatureInvalid(format!("bad public key {}: {}", key_name, e)))?;

        let mut signature = Vec::new();
        entry.read_to_end(&mut signature)?;

        let verified = if sha256 {
            let digest = Sha256::digest(signed);
            public_key.verify(Pkcs1v15Sign::new::<Sha256>(), &digest, &signature)
        } else {
            let digest = Sha1::digest(signed);
            public_key.verify(Pkcs1v15Sign::new::<Sha1>(), &digest, &signature)
        };

        return verified
            .map_err(|e| ApkError::SignatureInvalid(format!("index signature: {}", e)));
    }

    Err(ApkError::SignatureInvalid(
        "signature member holds no .SIGN entry".to_string(),
    ))
}

fn is_signature_member(tar: &[u8]) -> Result<bool> {
    let mut archive = tar::Archive::new(std::io::Cursor::new(tar));

    for entry in archive.entries()? {
        let entry = entry?;
        if entry.path()?.to_string_lossy().starts_with(".SIGN.") {
            return Ok(true);
        }
        return Ok(false);
    }

    Ok(false)
}

/// Parse an `APKINDEX.tar.gz` archive into a [NamedIndex], verifying its
/// signature unless told otherwise.
pub fn parse_repository_index(
    data: &[u8],
    keys: &HashMap<String, Vec<u8>>,
    ignore_signatures: bool,
    pin: &str,
    repository_uri: &str,
    source: &str,
) -> Result<NamedIndex> {
    let members = split_index_members(data)?;

    let content = if is_signature_member(&members[0].tar)? {
        if members.len() < 2 {
            return Err(ApkError::Archive(
                "signed index lacks a content member".to_string(),
            ));
        }
        if !ignore_signatures {
            verify_index_signature(&members[0].tar, &members[1].raw, keys)?;
        }
        &members[1]
    } else {
        if !ignore_signatures {
            return Err(ApkError::SignatureInvalid(format!(
                "index {} is not signed",
                source
            )));
        }
        &members[0]
    };

    let mut packages = Vec::new();

    let mut archive = tar::Archive::new(std::io::Cursor::new(&content.tar));
    for entry in archive.entries()? {
        let mut entry = entry?;
        if entry.path()?.to_string_lossy().trim_start_matches("./") != "APKINDEX" {
            continue;
        }

        let mut text = Vec::new();
        entry.read_to_end(&mut text)?;

        for paragraph in ControlParagraphReader::new(std::io::Cursor::new(text)) {
            let mut package = IndexPackage::from_paragraph(&paragraph?)?;
            package.repository_uri = repository_uri.to_string();
            package.pinned_repo_name = pin.to_string();
            packages.push(package);
        }
    }

    Ok(NamedIndex::new(pin, source, packages))
}

#[cfg(test)]
mod test {
    use {
        super::*,
        crate::testutil::{gzip, tar_archive},
        rand::rngs::OsRng,
        rsa::{
            pkcs1v15::SigningKey,
            pkcs8::EncodePublicKey,
            signature::{SignatureEncoding, Signer},
            RsaPrivateKey,
        },
    };

    const APKINDEX: &str = "C:Q1pS9ar3hLZtGS2nK1hIl5cysSUKY=\nP:a\nV:1.0-r0\no:a\n\nC:Q1pS9ar3hLZtGS2nK1hIl5cysSUKY=\nP:b\nV:2.0-r0\no:b\nD:a\n";

    fn content_member() -> Vec<u8> {
        gzip(&tar_archive(&[("APKINDEX", APKINDEX.as_bytes())]))
    }

    #[test]
    fn repository_spec_parsing() {
        let spec = RepositorySpec::parse("https://dl.example.org/alpine/v3.18/main");
        assert_eq!(spec.pin, "");
        assert_eq!(spec.uri, "https://dl.example.org/alpine/v3.18/main");

        let spec = RepositorySpec::parse("@edge https://dl.example.org/alpine/edge/main");
        assert_eq!(spec.pin, "edge");
        assert_eq!(spec.uri, "https://dl.example.org/alpine/edge/main");
    }

    #[test]
    fn parse_unsigned_index() -> Result<()> {
        let index = parse_repository_index(
            &content_member(),
            &HashMap::new(),
            true,
            "",
            "https://example.org/main/x86_64",
            "https://example.org/main/x86_64/APKINDEX.tar.gz",
        )?;

        assert_eq!(index.count(), 2);
        let pkgs = index.packages();
        assert_eq!(pkgs[0].name, "a");
        assert_eq!(pkgs[1].name, "b");
        assert_eq!(pkgs[1].depends, vec!["a"]);
        assert_eq!(
            pkgs[0].repository_uri,
            "https://example.org/main/x86_64"
        );

        Ok(())
    }

    #[test]
    fn unsigned_index_rejected_when_verifying() {
        let res = parse_repository_index(
            &content_member(),
            &HashMap::new(),
            false,
            "",
            "repo",
            "src",
        );
        assert!(matches!(res, Err(ApkError::SignatureInvalid(_))));
    }

    #[test]
    fn signed_index_verification() -> Result<()> {
        let mut rng = OsRng;
        let private_key = RsaPrivateKey::new(&mut rng, 2048)
            .map_err(|e| ApkError::Internal(e.to_string()))?;
        let public_pem = private_key
            .to_public_key()
            .to_public_key_pem(Default::default())
            .map_err(|e| ApkError::Internal(e.to_string()))?;

        let content = content_member();
        let signing_key = SigningKey::<Sha1>::new(private_key);
        let signature = signing_key.sign(&content).to_vec();

        let sig_member = gzip(&tar_archive(&[(
            ".SIGN.RSA.test.rsa.pub",
            signature.as_slice(),
        )]));

        let mut archive = sig_member.clone();
        archive.extend_from_slice(&content);

        let mut keys = HashMap::new();
        keys.insert("test.rsa.pub".to_string(), public_pem.into_bytes());

        let index = parse_repository_index(&archive, &keys, false, "edge", "repo", "src")?;
        assert_eq!(index.count(), 2);
        assert_eq!(index.name(), "edge");
        assert_eq!(index.packages()[0].pinned_repo_name, "edge");

        // Tampering with the content member must fail verification.
        let other = gzip(&tar_archive(&[("APKINDEX", b"P:evil\nV:1.0-r0\n")]));
        let mut tampered = sig_member;
        tampered.extend_from_slice(&other);
        assert!(matches!(
            parse_repository_index(&tampered, &keys, false, "", "repo", "src"),
            Err(ApkError::SignatureInvalid(_))
        ));

        // A missing keyring entry is its own error.
        assert!(matches!(
            parse_repository_index(&archive, &HashMap::new(), false, "", "repo", "src"),
            Err(ApkError::MissingKey(_))
        ));

        Ok(())
    }
}
