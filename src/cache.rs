// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Package and response caching.

Two concerns live here. Expanded package parts are stored under
content-addressed names (`<hex digest>.<kind>`) inside a per-package
directory derived from the architecture and the package URL; renames from
uniquely named temp files in the same directory make publication atomic.
Separately, [CachingClient] decorates an HTTP client with a URL-keyed
on-disk store for small cacheable documents (indexes, keys, releases
metadata). Package bodies never go through the URL cache; they are
content-addressed instead.
*/

use {
    crate::{
        error::{ApkError, Result},
        expand::{control_paragraph_from_gz, ApkExpanded},
        package::IndexPackage,
    },
    log::debug,
    std::{
        fs::File,
        io::Write,
        path::{Path, PathBuf},
    },
    tokio_util::sync::CancellationToken,
    url::Url,
};

const CONTROL_SUFFIX: &str = ".ctl.tar.gz";
const SIGNATURE_SUFFIX: &str = ".sig.tar.gz";
const DATA_SUFFIX: &str = ".dat.tar.gz";

/// Content-addressed cache of expanded packages rooted at a directory.
#[derive(Clone, Debug)]
pub struct Cache {
    dir: PathBuf,
}

impl Cache {
    /// Construct an instance rooted at the given directory.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// The cache root directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// The directory holding a package's artifacts:
    /// `<root>/<arch>/<url path components>/<name>-<version>`.
    pub(crate) fn package_cache_dir(&self, pkg: &IndexPackage) -> Result<PathBuf> {
        let url = Url::parse(&pkg.url())?;

        let mut dir = self.dir.clone();
        dir.push(if pkg.arch.is_empty() {
            "noarch"
        } else {
            pkg.arch.as_str()
        });

        if let Some(host) = url.host_str() {
            dir.push(host);
        }
        if let Some(segments) = url.path_segments() {
            let segments = segments.collect::<Vec<_>>();
            // The final segment is the archive filename.
            for segment in segments.iter().take(segments.len().saturating_sub(1)) {
                if !segment.is_empty() {
                    dir.push(segment);
                }
            }
        }
        dir.push(format!("{}-{}", pkg.name, pkg.version));

        Ok(dir)
    }

    /// Rename an expansion's temp files to content-addressed names.
    ///
    /// The temp files must already live in `cache_dir` so the renames stay
    /// within one directory and publication is atomic.
    pub(crate) fn store(&self, mut exp: ApkExpanded, cache_dir: &Path) -> Result<ApkExpanded> {
        let ctl_hex = hex::encode(&exp.control_hash);

        let ctl_dst = cache_dir.join(format!("{}{}", ctl_hex, CONTROL_SUFFIX));
        std::fs::rename(&exp.control_file, &ctl_dst)?;
        exp.control_file = ctl_dst;

        if let Some(sig) = &exp.signature_file {
            let sig_dst = cache_dir.join(format!("{}{}", ctl_hex, SIGNATURE_SUFFIX));
            std::fs::rename(sig, &sig_dst)?;
            exp.signature_file = Some(sig_dst);
        }

        let dat_hex = hex::encode(&exp.package_hash);

        let dat_dst = cache_dir.join(format!("{}{}", dat_hex, DATA_SUFFIX));
        std::fs::rename(&exp.package_file, &dat_dst)?;
        exp.package_file = dat_dst;

        let tar_dst = cache_dir.join(format!("{}.dat.tar", dat_hex));
        std::fs::rename(&exp.tar_file, &tar_dst)?;
        exp.tar_file = tar_dst;

        Ok(exp)
    }

    /// Look up a package's expansion by its control checksum.
    ///
    /// Any missing or unreadable artifact is reported as an error; callers
    /// treat errors as cache misses.
    pub(crate) fn load(&self, pkg: &IndexPackage, cache_dir: &Path) -> Result<ApkExpanded> {
        let checksum = pkg
            .checksum
            .as_ref()
            .ok_or_else(|| ApkError::Internal(format!("package {} has no checksum", pkg.name)))?;
        let ctl_hex = checksum.hex_digest();

        let control_file = cache_dir.join(format!("{}{}", ctl_hex, CONTROL_SUFFIX));
        let mut size = std::fs::metadata(&control_file)?.len();

        let sig = cache_dir.join(format!("{}{}", ctl_hex, SIGNATURE_SUFFIX));
        let signature_file = match std::fs::metadata(&sig) {
            Ok(meta) => {
                size += meta.len();
                Some(sig)
            }
            Err(_) => None,
        };

        let paragraph = control_paragraph_from_gz(File::open(&control_file)?)?;
        let dat_hex = paragraph
            .field_str("datahash")
            .map(|v| v.trim().to_string())
            .ok_or_else(|| {
                ApkError::ControlParse(format!("cached control for {} lacks datahash", pkg.name))
            })?;

        let package_file = cache_dir.join(format!("{}{}", dat_hex, DATA_SUFFIX));
        size += std::fs::metadata(&package_file)?.len();

        let tar_file = cache_dir.join(format!("{}.dat.tar", dat_hex));
        std::fs::metadata(&tar_file)?;

        Ok(ApkExpanded {
            control_file,
            signed: signature_file.is_some(),
            signature_file,
            package_file,
            tar_file,
            control_hash: checksum.as_bytes().to_vec(),
            package_hash: hex::decode(dat_hex)?,
            size,
        })
    }

    /// Decorate an HTTP client with this cache.
    pub fn client(&self, client: reqwest::Client) -> CachingClient {
        CachingClient {
            client,
            root: Some(self.dir.clone()),
        }
    }
}

/// An HTTP client with an optional URL-keyed response store.
///
/// Requests for `file://` URLs (or bare paths) are served straight from the
/// filesystem and never recorded.
#[derive(Clone, Debug)]
pub struct CachingClient {
    client: reqwest::Client,
    root: Option<PathBuf>,
}

impl CachingClient {
    /// Construct an instance, caching responses when a cache is supplied.
    pub fn new(client: reqwest::Client, cache: Option<&Cache>) -> Self {
        Self {
            client,
            root: cache.map(|c| c.dir.clone()),
        }
    }

    /// The undecorated HTTP client.
    pub fn inner(&self) -> &reqwest::Client {
        &self.client
    }

    /// Fetch a small cacheable document, consulting the on-disk store.
    pub async fn get_cached(&self, token: &CancellationToken, url: &str) -> Result<Vec<u8>> {
        if token.is_cancelled() {
            return Err(ApkError::Cancelled);
        }

        if let Some(path) = local_path(url) {
            return Ok(std::fs::read(path)?);
        }

        let cache_path = match &self.root {
            Some(root) => {
                let path = url_cache_path(root, url)?;
                if path.is_file() {
                    debug!("response cache hit for {}", url);
                    return Ok(std::fs::read(path)?);
                }
                Some(path)
            }
            None => None,
        };

        let response = self.client.get(url).send().await?;
        if !response.status().is_success() {
            return Err(ApkError::Fetch(format!(
                "unexpected status {} fetching {}",
                response.status(),
                url
            )));
        }
        let body = response.bytes().await?;

        if let Some(path) = cache_path {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
                let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
                tmp.write_all(&body)?;
                tmp.persist(&path).map_err(|e| e.error)?;
            }
        }

        Ok(body.to_vec())
    }
}

/// Interpret a URL as a local filesystem path, when possible.
pub(crate) fn local_path(url: &str) -> Option<PathBuf> {
    if let Some(path) = url.strip_prefix("file://") {
        Some(PathBuf::from(path))
    } else if !url.contains("://") {
        Some(PathBuf::from(url))
    } else {
        None
    }
}

/// On-disk location for a cached response body.
fn url_cache_path(root: &Path, url: &str) -> Result<PathBuf> {
    let url = Url::parse(url)?;

    let mut path = root.to_path_buf();
    path.push(url.scheme());
    if let Some(host) = url.host_str() {
        path.push(host);
    }

    let mut pushed = false;
    if let Some(segments) = url.path_segments() {
        for segment in segments.filter(|s| !s.is_empty()) {
            path.push(segment);
            pushed = true;
        }
    }
    if !pushed {
        path.push("index");
    }

    Ok(path)
}

#[cfg(test)]
mod test {
    use {
        super::*,
        crate::{expand::expand_apk, package::Checksum, testutil::build_apk},
    };

    fn test_package(fixture_control_hash: &[u8]) -> IndexPackage {
        IndexPackage {
            name: "hello".to_string(),
            version: "1.0-r0".to_string(),
            arch: "x86_64".to_string(),
            checksum: Some(Checksum::from_bytes(fixture_control_hash.to_vec())),
            repository_uri: "https://dl.example.org/alpine/v3.18/main/x86_64".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn package_cache_dir_layout() -> Result<()> {
        let cache = Cache::new("/var/cache/apk-packaging");
        let pkg = test_package(&[0u8; 20]);

        assert_eq!(
            cache.package_cache_dir(&pkg)?,
            PathBuf::from(
                "/var/cache/apk-packaging/x86_64/dl.example.org/alpine/v3.18/main/x86_64/hello-1.0-r0"
            )
        );

        Ok(())
    }

    #[test]
    fn store_then_load() -> Result<()> {
        let root = tempfile::tempdir()?;
        let cache = Cache::new(root.path());
        let fixture = build_apk("hello", "1.0-r0", &[], &[("etc/motd", b"hi\n")], true);
        let pkg = test_package(&fixture.control_hash());

        let pkg_dir = cache.package_cache_dir(&pkg)?;
        std::fs::create_dir_all(&pkg_dir)?;

        let exp = expand_apk(std::io::Cursor::new(fixture.bytes.clone()), &pkg_dir)?;
        let stored = cache.store(exp, &pkg_dir)?;

        let ctl_hex = hex::encode(&stored.control_hash);
        assert_eq!(
            stored.control_file,
            pkg_dir.join(format!("{}.ctl.tar.gz", ctl_hex))
        );
        assert!(stored.tar_file.to_string_lossy().ends_with(".dat.tar"));

        let loaded = cache.load(&pkg, &pkg_dir)?;
        assert_eq!(loaded.control_hash, fixture.control_hash());
        assert_eq!(loaded.package_hash, fixture.data_hash());
        assert!(loaded.signed);
        assert_eq!(std::fs::read(&loaded.tar_file)?, fixture.data_tar);
        assert_eq!(loaded.size, fixture.bytes.len() as u64);

        Ok(())
    }

    #[test]
    fn load_miss_is_an_error() {
        let root = tempfile::tempdir().unwrap();
        let cache = Cache::new(root.path());
        let pkg = test_package(&[7u8; 20]);

        let pkg_dir = cache.package_cache_dir(&pkg).unwrap();
        assert!(cache.load(&pkg, &pkg_dir).is_err());
    }

    #[test]
    fn local_paths() {
        assert_eq!(
            local_path("file:///tmp/x.apk"),
            Some(PathBuf::from("/tmp/x.apk"))
        );
        assert_eq!(local_path("/tmp/x.apk"), Some(PathBuf::from("/tmp/x.apk")));
        assert_eq!(local_path("https://example.org/x.apk"), None);
    }

    #[tokio::test]
    async fn get_cached_serves_local_files() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("APKINDEX.tar.gz");
        std::fs::write(&path, b"payload")?;

        let client = CachingClient::new(reqwest::Client::new(), None);
        let token = CancellationToken::new();

        let body = client
            .get_cached(&token, &format!("file://{}", path.display()))
            .await?;
        assert_eq!(body, b"payload");

        token.cancel();
        assert!(matches!(
            client.get_cached(&token, "https://example.invalid/x").await,
            Err(ApkError::Cancelled)
        ));

        Ok(())
    }
}
