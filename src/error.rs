// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Error handling. */

use {crate::package_version::VersionError, thiserror::Error};

/// Primary crate error type.
#[derive(Debug, Error)]
pub enum ApkError {
    #[error("I/O error: {0:?}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0:?}")]
    Http(#[from] reqwest::Error),

    #[error("URL error: {0:?}")]
    Url(#[from] url::ParseError),

    #[error("hex parsing error: {0:?}")]
    Hex(#[from] hex::FromHexError),

    #[error("base64 parsing error: {0:?}")]
    Base64(#[from] base64::DecodeError),

    #[error("integer parsing error: {0:?}")]
    ParseInt(#[from] std::num::ParseIntError),

    #[error("JSON error: {0:?}")]
    Json(#[from] serde_json::Error),

    #[error("version error: {0}")]
    Version(#[from] VersionError),

    #[error("control file parse error: {0}")]
    ControlParse(String),

    #[error("failed to parse dependency expression: {0}")]
    DependencyParse(String),

    #[error("malformed package archive: {0}")]
    Archive(String),

    #[error("could not find package, alias or a package that provides {0} in indexes")]
    PackageNotFound(String),

    #[error("no keys found for arch {arch} and releases {releases:?}")]
    NoKeysFound { arch: String, releases: Vec<String> },

    #[error("no keyring entry for key {0}")]
    MissingKey(String),

    #[error("signature verification failed: {0}")]
    SignatureInvalid(String),

    #[error("hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },

    #[error("fetch failed: {0}")]
    Fetch(String),

    #[error("URL scheme {0} not supported")]
    UnsupportedScheme(String),

    #[error("cannot install due to conflict with {0}")]
    Conflict(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),
}

/// Result wrapper for this crate.
pub type Result<T> = std::result::Result<T, ApkError>;
