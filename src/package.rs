// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Package records as they appear in repository indexes. */

use {
    crate::{
        control::{ControlField, ControlParagraph},
        error::{ApkError, Result},
    },
    base64::{engine::general_purpose::STANDARD as BASE64, Engine as _},
    std::fmt::{Display, Formatter},
};

/// Prefix identifying a SHA-1 control checksum on the wire.
const CHECKSUM_PREFIX: &str = "Q1";

/// A package control checksum: the SHA-1 digest of the control stream,
/// encoded as `Q1` + base64 in index and database files.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Checksum(Vec<u8>);

impl Checksum {
    /// Parse the wire form `Q1<base64>`.
    pub fn parse(s: &str) -> Result<Self> {
        let encoded = s
            .strip_prefix(CHECKSUM_PREFIX)
            .ok_or_else(|| ApkError::ControlParse(format!("unexpected checksum: {:?}", s)))?;

        Ok(Self(BASE64.decode(encoded)?))
    }

    /// Construct from raw digest bytes.
    pub fn from_bytes(data: impl Into<Vec<u8>>) -> Self {
        Self(data.into())
    }

    /// The raw digest bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// The digest as lowercase hex, as used for content-addressed filenames.
    pub fn hex_digest(&self) -> String {
        hex::encode(&self.0)
    }
}

impl Display for Checksum {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}", CHECKSUM_PREFIX, BASE64.encode(&self.0))
    }
}

/// An immutable package record from a repository index.
///
/// Instances are constructed from an `APKINDEX` paragraph via
/// [IndexPackage::from_paragraph] and annotated with the repository they
/// were loaded from. The dependency-bearing fields (`depends`, `provides`,
/// `install_if`, `replaces`) hold unparsed atoms; the resolver parses them
/// lazily with memoization.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct IndexPackage {
    pub name: String,
    pub version: String,
    pub arch: String,
    pub description: String,
    pub license: Option<String>,
    pub origin: String,
    pub checksum: Option<Checksum>,
    pub size: Option<u64>,
    pub installed_size: Option<u64>,
    pub build_time: Option<i64>,
    pub commit: Option<String>,
    pub depends: Vec<String>,
    pub provides: Vec<String>,
    pub install_if: Vec<String>,
    pub replaces: Vec<String>,
    pub provider_priority: u64,

    /// Absolute location override. When unset, the package is fetched from
    /// its repository at the conventional `<repo>/<name>-<version>.apk`.
    pub url: Option<String>,

    /// Base URI of the repository (including architecture) this package was
    /// loaded from. Assigned by the index loader.
    pub repository_uri: String,

    /// Pin label of the owning repository, or empty when unpinned.
    /// Assigned by the index loader.
    pub pinned_repo_name: String,
}

impl IndexPackage {
    /// Construct an instance from an `APKINDEX` paragraph.
    pub fn from_paragraph(paragraph: &ControlParagraph) -> Result<Self> {
        let required = |key: &str| -> Result<String> {
            paragraph
                .field_str(key)
                .map(|v| v.to_string())
                .ok_or_else(|| {
                    ApkError::ControlParse(format!("index paragraph lacks required field {}", key))
                })
        };

        Ok(Self {
            name: required("P")?,
            version: required("V")?,
            arch: paragraph.field_str("A").unwrap_or_default().to_string(),
            description: paragraph.field_str("T").unwrap_or_default().to_string(),
            license: paragraph.field_str("L").map(|v| v.to_string()),
            origin: paragraph.field_str("o").unwrap_or_default().to_string(),
            checksum: paragraph.field_str("C").map(Checksum::parse).transpose()?,
            size: paragraph.field_u64("S").transpose()?,
            installed_size: paragraph.field_u64("I").transpose()?,
            build_time: paragraph
                .field_str("t")
                .map(|v| v.trim().parse::<i64>())
                .transpose()?,
            commit: paragraph.field_str("c").map(|v| v.to_string()),
            depends: paragraph.field_words("D"),
            provides: paragraph.field_words("p"),
            install_if: paragraph.field_words("i"),
            replaces: paragraph.field_words("r"),
            provider_priority: paragraph.field_u64("k").transpose()?.unwrap_or(0),
            url: None,
            repository_uri: String::new(),
            pinned_repo_name: String::new(),
        })
    }

    /// Serialize back to a control paragraph, preserving the `APKINDEX`
    /// field order for the fields this type models.
    pub fn to_paragraph(&self) -> ControlParagraph {
        let mut p = ControlParagraph::default();

        if let Some(checksum) = &self.checksum {
            p.set_field(ControlField::new("C", checksum.to_string()));
        }
        p.set_field(ControlField::new("P", &self.name));
        p.set_field(ControlField::new("V", &self.version));
        if !self.arch.is_empty() {
            p.set_field(ControlField::new("A", &self.arch));
        }
        if let Some(size) = self.size {
            p.set_field(ControlField::new("S", size));
        }
        if let Some(installed_size) = self.installed_size {
            p.set_field(ControlField::new("I", installed_size));
        }
        if !self.description.is_empty() {
            p.set_field(ControlField::new("T", &self.description));
        }
        if let Some(license) = &self.license {
            p.set_field(ControlField::new("L", license));
        }
        if !self.origin.is_empty() {
            p.set_field(ControlField::new("o", &self.origin));
        }
        if let Some(build_time) = self.build_time {
            p.set_field(ControlField::new("t", build_time));
        }
        if let Some(commit) = &self.commit {
            p.set_field(ControlField::new("c", commit));
        }
        if self.provider_priority != 0 {
            p.set_field(ControlField::new("k", self.provider_priority));
        }
        if !self.depends.is_empty() {
            p.set_field(ControlField::new("D", self.depends.join(" ")));
        }
        if !self.provides.is_empty() {
            p.set_field(ControlField::new("p", self.provides.join(" ")));
        }
        if !self.install_if.is_empty() {
            p.set_field(ControlField::new("i", self.install_if.join(" ")));
        }
        if !self.replaces.is_empty() {
            p.set_field(ControlField::new("r", self.replaces.join(" ")));
        }

        p
    }

    /// The conventional archive filename for this package.
    pub fn filename(&self) -> String {
        format!("{}-{}.apk", self.name, self.version)
    }

    /// The location to fetch this package from: the absolute URL when the
    /// record carries one, otherwise relative to the owning repository.
    pub fn url(&self) -> String {
        if let Some(url) = &self.url {
            url.clone()
        } else {
            format!("{}/{}", self.repository_uri, self.filename())
        }
    }
}
