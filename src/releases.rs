// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! The Alpine releases document.

`https://alpinelinux.org/releases.json` describes release branches and the
signing keys in effect per architecture. The keyring bootstrap fetches it
to discover which keys to install for a requested release.
*/

use {
    chrono::NaiveDate,
    serde::Deserialize,
    std::collections::HashMap,
};

/// Where the releases document is published.
pub const RELEASES_URL: &str = "https://alpinelinux.org/releases.json";

/// The parsed releases document.
#[derive(Clone, Debug, Deserialize)]
pub struct Releases {
    #[serde(default)]
    pub architectures: Vec<String>,

    #[serde(default)]
    pub latest_stable: String,

    pub release_branches: Vec<ReleaseBranch>,
}

impl Releases {
    /// Find the branch for a release name. `3.18` and `v3.18` both match
    /// the branch named `v3.18`.
    pub fn release_branch(&self, version: &str) -> Option<&ReleaseBranch> {
        let with_prefix = format!("v{}", version);

        self.release_branches
            .iter()
            .find(|branch| branch.rel_branch == version || branch.rel_branch == with_prefix)
    }
}

/// One release branch and its signing keys.
#[derive(Clone, Debug, Deserialize)]
pub struct ReleaseBranch {
    pub rel_branch: String,

    #[serde(default)]
    pub arches: Vec<String>,

    /// Signing keys per architecture.
    #[serde(default)]
    pub keys: HashMap<String, Vec<ReleaseKey>>,
}

impl ReleaseBranch {
    /// URLs of the keys valid for an architecture at the given date.
    pub fn keys_for(&self, arch: &str, date: NaiveDate) -> Vec<&str> {
        self.keys
            .get(arch)
            .map(|keys| {
                keys.iter()
                    .filter(|key| match key.deprecated_since {
                        Some(deprecated) => deprecated > date,
                        None => true,
                    })
                    .map(|key| key.url.as_str())
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// One signing key entry.
#[derive(Clone, Debug, Deserialize)]
pub struct ReleaseKey {
    pub url: String,

    #[serde(default)]
    pub deprecated_since: Option<NaiveDate>,
}

#[cfg(test)]
mod test {
    use super::*;

    const SAMPLE: &str = r#"{
        "architectures": ["x86_64", "aarch64"],
        "latest_stable": "3.18.4",
        "release_branches": [
            {
                "rel_branch": "v3.18",
                "arches": ["x86_64", "aarch64"],
                "keys": {
                    "x86_64": [
                        {"url": "https://alpinelinux.org/keys/alpine-devel@lists.alpinelinux.org-4a6a0840.rsa.pub"},
                        {"url": "https://alpinelinux.org/keys/old.rsa.pub", "deprecated_since": "2020-01-01"}
                    ]
                }
            }
        ]
    }"#;

    #[test]
    fn parse_and_select_keys() {
        let releases: Releases = serde_json::from_str(SAMPLE).unwrap();

        assert_eq!(releases.latest_stable, "3.18.4");
        assert!(releases.release_branch("v3.18").is_some());
        assert!(releases.release_branch("3.18").is_some());
        assert!(releases.release_branch("2.0").is_none());

        let branch = releases.release_branch("3.18").unwrap();
        let date = NaiveDate::from_ymd_opt(2023, 6, 1).unwrap();
        let keys = branch.keys_for("x86_64", date);
        assert_eq!(keys.len(), 1);
        assert!(keys[0].ends_with("4a6a0840.rsa.pub"));

        assert!(branch.keys_for("riscv64", date).is_empty());
    }
}
