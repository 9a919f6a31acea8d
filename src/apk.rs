// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! The top-level APK installer.

[Apk] ties the pieces together over a target filesystem: database
initialization, keyring installation, repository configuration, world
resolution and the fetch/expand/install pipeline.

`fixate_world` fans the fetch+expand of each resolved package out across a
bounded worker pool while a single consumer installs strictly in resolver
order: per-slot oneshot channels signal readiness, and the consumer's
blocking read on the next slot is what throttles the pipeline. The first
error cancels the shared token and everything else stops promptly.
*/

use {
    crate::{
        cache::{local_path, Cache, CachingClient},
        database::{self, ARCH_FILE, KEYS_DIR, REPOSITORIES_FILE, SCRIPTS_FILE, WORLD_FILE},
        dependency_resolution::DependencyResolver,
        error::{ApkError, Result},
        expand::{self, ApkExpanded},
        fetch,
        fs::ApkFilesystem,
        index::{fetch_repository_indexes, NamedIndex},
        install,
        package::IndexPackage,
        releases::{Releases, RELEASES_URL},
    },
    log::{debug, info, warn},
    std::{
        collections::HashMap,
        path::{Path, PathBuf},
        sync::Arc,
    },
    tokio::{
        sync::{oneshot, Semaphore},
        task::JoinSet,
    },
    tokio_util::{io::SyncIoBridge, sync::CancellationToken},
    url::Url,
};

struct InitDirectory {
    path: &'static str,
    mode: u32,
}

struct InitFile {
    path: &'static str,
    mode: u32,
    contents: &'static [u8],
}

struct InitDeviceFile {
    path: &'static str,
    major: u64,
    minor: u64,
    mode: u32,
}

const BASE_DIRECTORIES: &[InitDirectory] = &[
    InitDirectory { path: "/tmp", mode: 0o1777 },
    InitDirectory { path: "/dev", mode: 0o755 },
    InitDirectory { path: "/etc", mode: 0o755 },
    InitDirectory { path: "/lib", mode: 0o755 },
    InitDirectory { path: "/proc", mode: 0o555 },
    InitDirectory { path: "/var", mode: 0o755 },
];

// Created in order; parents precede children.
const INIT_DIRECTORIES: &[InitDirectory] = &[
    InitDirectory { path: "/etc/apk", mode: 0o755 },
    InitDirectory { path: "/etc/apk/keys", mode: 0o755 },
    InitDirectory { path: "/lib/apk", mode: 0o755 },
    InitDirectory { path: "/lib/apk/db", mode: 0o755 },
    InitDirectory { path: "/var/cache", mode: 0o755 },
    InitDirectory { path: "/var/cache/apk", mode: 0o755 },
    InitDirectory { path: "/var/cache/misc", mode: 0o755 },
];

const INIT_FILES: &[InitFile] = &[
    InitFile { path: "/etc/apk/world", mode: 0o644, contents: b"\n" },
    InitFile { path: "/etc/apk/repositories", mode: 0o644, contents: b"\n" },
    InitFile { path: "/lib/apk/db/lock", mode: 0o600, contents: b"" },
    InitFile { path: "/lib/apk/db/triggers", mode: 0o644, contents: b"" },
    InitFile { path: "/lib/apk/db/installed", mode: 0o644, contents: b"" },
];

const INIT_DEVICE_FILES: &[InitDeviceFile] = &[
    InitDeviceFile { path: "/dev/zero", major: 1, minor: 5, mode: 0o666 },
    InitDeviceFile { path: "/dev/urandom", major: 1, minor: 9, mode: 0o666 },
    InitDeviceFile { path: "/dev/null", major: 1, minor: 3, mode: 0o666 },
    InitDeviceFile { path: "/dev/random", major: 1, minor: 8, mode: 0o666 },
    InitDeviceFile { path: "/dev/console", major: 5, minor: 1, mode: 0o620 },
];

/// An APK installer bound to a target filesystem.
#[derive(Clone)]
pub struct Apk {
    arch: String,
    fs: Arc<dyn ApkFilesystem>,
    client: reqwest::Client,
    cache: Option<Cache>,
    ignore_signatures: bool,
    ignore_mknod_errors: bool,
    parallelism: usize,
}

/// Builder for [Apk].
pub struct ApkBuilder {
    arch: String,
    fs: Option<Arc<dyn ApkFilesystem>>,
    client: Option<reqwest::Client>,
    cache: Option<Cache>,
    ignore_signatures: bool,
    ignore_mknod_errors: bool,
    parallelism: usize,
}

impl Default for ApkBuilder {
    fn default() -> Self {
        Self {
            arch: "x86_64".to_string(),
            fs: None,
            client: None,
            cache: None,
            ignore_signatures: false,
            ignore_mknod_errors: false,
            parallelism: 0,
        }
    }
}

impl ApkBuilder {
    /// The target architecture. Defaults to `x86_64`.
    pub fn arch(mut self, arch: impl ToString) -> Self {
        self.arch = arch.to_string();
        self
    }

    /// The target filesystem. Required.
    pub fn filesystem(mut self, fs: Arc<dyn ApkFilesystem>) -> Self {
        self.fs = Some(fs);
        self
    }

    /// HTTP client to use for downloads. A default client is used when
    /// unset.
    pub fn http_client(mut self, client: reqwest::Client) -> Self {
        self.client = Some(client);
        self
    }

    /// Package and response cache.
    pub fn cache(mut self, cache: Cache) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Skip repository index signature verification.
    pub fn ignore_signatures(mut self, ignore: bool) -> Self {
        self.ignore_signatures = ignore;
        self
    }

    /// Tolerate device node creation failures during `init_db`.
    pub fn ignore_mknod_errors(mut self, ignore: bool) -> Self {
        self.ignore_mknod_errors = ignore;
        self
    }

    /// Lower bound on the fetch/expand worker pool size. The pool is
    /// `max(parallelism, available CPUs) + 1`.
    pub fn parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism;
        self
    }

    pub fn build(self) -> Result<Apk> {
        let fs = self
            .fs
            .ok_or_else(|| ApkError::Internal("a target filesystem is required".to_string()))?;

        Ok(Apk {
            arch: self.arch,
            fs,
            client: self.client.unwrap_or_default(),
            cache: self.cache,
            ignore_signatures: self.ignore_signatures,
            ignore_mknod_errors: self.ignore_mknod_errors,
            parallelism: self.parallelism,
        })
    }
}

impl Apk {
    pub fn builder() -> ApkBuilder {
        ApkBuilder::default()
    }

    /// The target architecture.
    pub fn arch(&self) -> &str {
        &self.arch
    }

    /// Tar headers for everything `init_db` materializes.
    pub fn list_init_files(&self) -> Vec<tar::Header> {
        let mut headers = Vec::with_capacity(
            INIT_DIRECTORIES.len() + INIT_FILES.len() + INIT_DEVICE_FILES.len() + 2,
        );

        for dir in INIT_DIRECTORIES {
            let mut header = tar::Header::new_ustar();
            header.set_entry_type(tar::EntryType::Directory);
            header.set_path(dir.path.trim_start_matches('/')).ok();
            header.set_mode(dir.mode);
            header.set_size(0);
            header.set_cksum();
            headers.push(header);
        }

        for file in INIT_FILES {
            let mut header = tar::Header::new_ustar();
            header.set_entry_type(tar::EntryType::Regular);
            header.set_path(file.path.trim_start_matches('/')).ok();
            header.set_mode(file.mode);
            header.set_size(file.contents.len() as u64);
            header.set_cksum();
            headers.push(header);
        }

        let mut arch_header = tar::Header::new_ustar();
        arch_header.set_entry_type(tar::EntryType::Regular);
        arch_header.set_path(ARCH_FILE).ok();
        arch_header.set_mode(0o644);
        arch_header.set_size(self.arch.len() as u64 + 1);
        arch_header.set_cksum();
        headers.push(arch_header);

        for device in INIT_DEVICE_FILES {
            let mut header = tar::Header::new_ustar();
            header.set_entry_type(tar::EntryType::Char);
            header.set_path(device.path.trim_start_matches('/')).ok();
            header.set_mode(device.mode);
            header.set_size(0);
            header.set_device_major(device.major as u32).ok();
            header.set_device_minor(device.minor as u32).ok();
            header.set_cksum();
            headers.push(header);
        }

        let mut scripts_header = tar::Header::new_ustar();
        scripts_header.set_entry_type(tar::EntryType::Regular);
        scripts_header.set_path(SCRIPTS_FILE).ok();
        scripts_header.set_mode(0o644);
        scripts_header.set_size(0);
        scripts_header.set_cksum();
        headers.push(scripts_header);

        headers
    }

    /// Initialize the APK database: base directories, database files,
    /// device nodes, an empty `scripts.tar`, and optionally the Alpine
    /// keyring for the named releases.
    pub async fn init_db(
        &self,
        token: &CancellationToken,
        alpine_versions: &[String],
    ) -> Result<()> {
        info!("initializing apk database");

        for dir in BASE_DIRECTORIES.iter().chain(INIT_DIRECTORIES) {
            self.fs.mkdir(dir.path, dir.mode)?;
        }

        for file in INIT_FILES {
            self.fs.write_file(file.path, file.contents, file.mode)?;
        }
        self.fs
            .write_file(ARCH_FILE, format!("{}\n", self.arch).as_bytes(), 0o644)?;

        for device in INIT_DEVICE_FILES {
            let res = self
                .fs
                .mknod(device.path, device.mode, device.major, device.minor);
            if let Err(e) = res {
                if !self.ignore_mknod_errors {
                    return Err(e);
                }
                debug!("ignoring mknod failure for {}: {}", device.path, e);
            }
        }

        // scripts.tar starts out as a valid empty archive.
        let empty_tar = tar::Builder::new(Vec::new())
            .into_inner()
            .map_err(|e| ApkError::Internal(format!("serializing empty tar: {}", e)))?;
        self.fs.write_file(SCRIPTS_FILE, &empty_tar, 0o644)?;

        if !alpine_versions.is_empty() {
            match self.fetch_alpine_keys(token, alpine_versions).await {
                Ok(()) => {}
                Err(ApkError::NoKeysFound { arch, releases }) => {
                    warn!("ignoring missing keys for arch {} ({:?})", arch, releases);
                }
                Err(e) => return Err(e),
            }
        }

        info!("finished initializing apk database");

        Ok(())
    }

    /// Fetch the Alpine signing keys for the given releases into the
    /// target keyring.
    async fn fetch_alpine_keys(
        &self,
        token: &CancellationToken,
        alpine_versions: &[String],
    ) -> Result<()> {
        let client = CachingClient::new(self.client.clone(), self.cache.as_ref());

        let body = client.get_cached(token, RELEASES_URL).await?;
        let releases: Releases = serde_json::from_slice(&body)?;

        let today = chrono::Utc::now().date_naive();
        let mut urls = Vec::new();
        for version in alpine_versions {
            if let Some(branch) = releases.release_branch(version) {
                urls.extend(
                    branch
                        .keys_for(&self.arch, today)
                        .into_iter()
                        .map(|url| url.to_string()),
                );
            }
        }

        if urls.is_empty() {
            return Err(ApkError::NoKeysFound {
                arch: self.arch.clone(),
                releases: alpine_versions.to_vec(),
            });
        }

        for url in urls {
            let data = client.get_cached(token, &url).await?;
            let name = url.rsplit('/').next().unwrap_or("alpine.rsa.pub");
            self.fs
                .write_file(&format!("{}/{}", KEYS_DIR, name), &data, 0o644)?;
        }

        Ok(())
    }

    /// Install keys into the target keyring.
    ///
    /// Sources may be `file://` URLs, bare paths, or `https://` URLs
    /// (optionally carrying HTTP Basic credentials). Keys are installed
    /// concurrently; the first failure wins.
    pub async fn init_keyring(
        &self,
        token: &CancellationToken,
        key_files: &[String],
        extra_key_files: &[String],
    ) -> Result<()> {
        info!("initializing apk keyring");

        self.fs.mkdir_all(KEYS_DIR, 0o755)?;

        if !extra_key_files.is_empty() {
            debug!("appending {} extra keys to keyring", extra_key_files.len());
        }

        let mut set: JoinSet<Result<()>> = JoinSet::new();
        for source in key_files.iter().chain(extra_key_files) {
            let apk = self.clone();
            let token = token.clone();
            let source = source.clone();

            set.spawn(async move {
                debug!("installing key {}", source);
                let (name, data) = apk.fetch_key(&token, &source).await?;
                apk.fs
                    .write_file(&format!("{}/{}", KEYS_DIR, name), &data, 0o644)
            });
        }

        let mut first_error = None;
        while let Some(res) = set.join_next().await {
            let outcome = res
                .map_err(|e| ApkError::Internal(format!("keyring task failed: {}", e)))
                .and_then(|inner| inner);
            if let Err(e) = outcome {
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn fetch_key(
        &self,
        token: &CancellationToken,
        source: &str,
    ) -> Result<(String, Vec<u8>)> {
        if token.is_cancelled() {
            return Err(ApkError::Cancelled);
        }

        if let Some(path) = local_path(source) {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .ok_or_else(|| ApkError::Fetch(format!("key path {} has no name", source)))?;
            return Ok((name, tokio::fs::read(&path).await?));
        }

        let url = Url::parse(source)?;
        if url.scheme() != "https" {
            return Err(ApkError::UnsupportedScheme(url.scheme().to_string()));
        }

        let name = url
            .path_segments()
            .and_then(|segments| segments.last())
            .filter(|s| !s.is_empty())
            .unwrap_or("alpine.rsa.pub")
            .to_string();

        if url.username().is_empty() {
            let client = CachingClient::new(self.client.clone(), self.cache.as_ref());
            return Ok((name, client.get_cached(token, source).await?));
        }

        // Credentialed fetches bypass the response cache.
        let user = url.username().to_string();
        let password = url.password().map(|p| p.to_string());
        let mut bare = url.clone();
        let _ = bare.set_username("");
        let _ = bare.set_password(None);

        let response = self
            .client
            .get(bare)
            .basic_auth(user, password)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(ApkError::Fetch(format!(
                "unexpected status {} fetching key {}",
                response.status(),
                url
            )));
        }

        Ok((name, response.bytes().await?.to_vec()))
    }

    /// Write `/etc/apk/repositories`.
    pub fn set_repositories(&self, repositories: &[String]) -> Result<()> {
        info!("setting apk repositories");

        if repositories.is_empty() {
            return Err(ApkError::Internal(
                "must provide at least one repository".to_string(),
            ));
        }

        let data = format!("{}\n", repositories.join("\n"));
        self.fs
            .write_file(REPOSITORIES_FILE, data.as_bytes(), 0o644)
    }

    /// Read `/etc/apk/repositories`.
    pub fn get_repositories(&self) -> Result<Vec<String>> {
        let data = self.fs.read_file(REPOSITORIES_FILE)?;

        Ok(String::from_utf8_lossy(&data)
            .lines()
            .map(|line| line.trim().to_string())
            .filter(|line| !line.is_empty())
            .collect())
    }

    /// Write the requested package atoms to `/etc/apk/world`.
    pub fn set_world(&self, packages: &[String]) -> Result<()> {
        info!("setting apk world");

        let data = format!("{}\n", packages.join("\n"));
        self.fs.write_file(WORLD_FILE, data.as_bytes(), 0o644)
    }

    /// Read the package atoms from `/etc/apk/world`.
    pub fn get_world(&self) -> Result<Vec<String>> {
        let data = self.fs.read_file(WORLD_FILE)?;

        Ok(String::from_utf8_lossy(&data)
            .lines()
            .map(|line| line.trim().to_string())
            .filter(|line| !line.is_empty())
            .collect())
    }

    /// Load and verify the indexes for the configured repositories.
    async fn repository_indexes(&self, token: &CancellationToken) -> Result<Vec<NamedIndex>> {
        let repositories = self.get_repositories()?;

        let arch_data = self.fs.read_file(ARCH_FILE)?;
        let arch = String::from_utf8_lossy(&arch_data).trim_end().to_string();

        let mut keys = HashMap::new();
        for name in self.fs.read_dir(KEYS_DIR)? {
            let data = self.fs.read_file(&format!("{}/{}", KEYS_DIR, name))?;
            keys.insert(name, data);
        }

        let client = CachingClient::new(self.client.clone(), self.cache.as_ref());

        fetch_repository_indexes(
            token,
            &client,
            &repositories,
            &keys,
            &arch,
            self.ignore_signatures,
        )
        .await
    }

    /// Determine the target state for `/etc/apk/world` without installing
    /// anything.
    pub async fn resolve_world(
        &self,
        token: &CancellationToken,
    ) -> Result<(Vec<Arc<IndexPackage>>, Vec<String>)> {
        info!("determining desired apk world");

        let indexes = self.repository_indexes(token).await?;
        debug!("got {} indexes", indexes.len());

        let world = self.get_world()?;
        let resolver = DependencyResolver::new(&indexes);

        resolver.resolve(&world)
    }

    /// Resolve `/etc/apk/world` and install the result.
    pub async fn fixate_world(
        &self,
        token: &CancellationToken,
        source_date_epoch: Option<i64>,
    ) -> Result<()> {
        info!("synchronizing with desired apk world");

        let (to_install, conflicts) = self.resolve_world(token).await?;

        for name in &conflicts {
            if database::is_installed(&*self.fs, name)? {
                return Err(ApkError::Conflict(name.clone()));
            }
        }

        let jobs = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
            .max(self.parallelism)
            + 1;

        let run_token = token.child_token();
        let semaphore = Arc::new(Semaphore::new(jobs));

        // Expansions land in the cache when configured, otherwise in a
        // scratch directory that lives for the duration of the run.
        let scratch = match &self.cache {
            Some(_) => None,
            None => Some(tempfile::tempdir()?),
        };
        let scratch_path = scratch.as_ref().map(|dir| dir.path().to_path_buf());

        let mut set: JoinSet<Result<()>> = JoinSet::new();
        let mut receivers = Vec::with_capacity(to_install.len());

        for pkg in &to_install {
            let (tx, rx) = oneshot::channel::<ApkExpanded>();
            receivers.push(rx);

            let apk = self.clone();
            let pkg = Arc::clone(pkg);
            let worker_token = run_token.clone();
            let semaphore = Arc::clone(&semaphore);
            let scratch = scratch_path.clone();

            set.spawn(async move {
                let _permit = tokio::select! {
                    permit = semaphore.acquire_owned() => {
                        permit.map_err(|_| ApkError::Cancelled)?
                    }
                    _ = worker_token.cancelled() => return Err(ApkError::Cancelled),
                };

                let expanded = apk
                    .expand_package(&worker_token, &pkg, scratch.as_deref())
                    .await?;

                // The consumer may already have failed; nothing to do then.
                let _ = tx.send(expanded);

                Ok(())
            });
        }

        // Install strictly in resolver order as slots become ready.
        let mut first_error: Option<ApkError> = None;
        for (i, rx) in receivers.into_iter().enumerate() {
            let pkg = &to_install[i];

            let expanded = tokio::select! {
                _ = run_token.cancelled() => {
                    first_error.get_or_insert(ApkError::Cancelled);
                    break;
                }
                res = rx => match res {
                    Ok(expanded) => expanded,
                    Err(_) => {
                        // The worker for this slot died; its error surfaces
                        // from the join below.
                        first_error.get_or_insert(ApkError::Cancelled);
                        break;
                    }
                },
            };

            if database::is_installed(&*self.fs, &pkg.name)? {
                debug!("{} is already installed", pkg.name);
                continue;
            }

            if let Err(e) = install::install_package(&*self.fs, pkg, &expanded, source_date_epoch)
            {
                first_error = Some(e);
                break;
            }
        }

        if first_error.is_some() {
            run_token.cancel();
        }

        while let Some(res) = set.join_next().await {
            match res {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    run_token.cancel();
                    let placeholder =
                        matches!(first_error, None | Some(ApkError::Cancelled));
                    if placeholder {
                        first_error = Some(e);
                    }
                }
                Err(e) => {
                    run_token.cancel();
                    first_error
                        .get_or_insert(ApkError::Internal(format!("worker failed: {}", e)));
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Produce the expanded form of a package, from the cache when
    /// possible, else by fetching and splitting the archive.
    async fn expand_package(
        &self,
        token: &CancellationToken,
        pkg: &Arc<IndexPackage>,
        scratch: Option<&Path>,
    ) -> Result<ApkExpanded> {
        let cache_dir: Option<PathBuf> = match &self.cache {
            Some(cache) => {
                let dir = cache.package_cache_dir(pkg)?;

                match cache.load(pkg, &dir) {
                    Ok(expanded) => {
                        debug!("cache hit ({})", pkg.name);
                        return Ok(expanded);
                    }
                    Err(e) => debug!("cache miss ({}): {}", pkg.name, e),
                }

                std::fs::create_dir_all(&dir)?;
                Some(dir)
            }
            None => None,
        };

        let out_dir = cache_dir
            .clone()
            .or_else(|| scratch.map(|p| p.to_path_buf()))
            .ok_or_else(|| {
                ApkError::Internal("no directory available for expansion".to_string())
            })?;

        let reader = fetch::fetch_package(token, &self.client, pkg).await?;

        // The splitter is synchronous; bridge the fetch body onto a
        // blocking thread.
        let expanded = tokio::task::spawn_blocking(move || {
            expand::expand_apk(SyncIoBridge::new(reader), &out_dir)
        })
        .await
        .map_err(|e| ApkError::Internal(format!("expansion task failed: {}", e)))??;

        match (&self.cache, cache_dir) {
            (Some(cache), Some(dir)) => cache.store(expanded, &dir),
            _ => Ok(expanded),
        }
    }
}
