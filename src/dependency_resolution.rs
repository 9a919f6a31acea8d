// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Dependency resolution.

[DependencyResolver] indexes known packages and computes, for a set of
requested atoms, the complete ordered installation list plus the set of
conflicting names. Resolution is a depth-first walk over textual dependency
atoms: dependencies are emitted in post-order (deeper before shallower, and
in declaration order at equal depth), so every package precedes the
packages that depend on it. The dependency language permits cycles; a
package already on the current walk path is skipped rather than revisited.

The resolver is built once per set of indexes and never mutates them. Its
memoization tables use interior mutability, so an instance is intended for
single-threaded use; resolve output is deterministic for identical inputs.
*/

use {
    crate::{
        dependency::Dependency,
        error::{ApkError, Result},
        index::NamedIndex,
        package::IndexPackage,
        package_version::{Comparator, PackageVersion},
    },
    log::debug,
    std::{
        cell::RefCell,
        cmp::Ordering,
        collections::{HashMap, HashSet},
        sync::Arc,
    },
};

/// Remove duplicates from a list, keeping first occurrences in order.
fn uniqify(values: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    values
        .into_iter()
        .filter(|v| seen.insert(v.clone()))
        .collect()
}

/// Resolves packages from a list of indexes.
///
/// If the indexes change, build a new resolver.
pub struct DependencyResolver {
    /// Package name (or provided name) to candidate packages.
    name_map: HashMap<String, Vec<Arc<IndexPackage>>>,

    /// Provided name to the packages that provide (but do not own) it.
    provides_only_map: HashMap<String, Vec<Arc<IndexPackage>>>,

    /// `install_if` trigger atom to the packages it can pull in.
    install_if_map: HashMap<String, Vec<Arc<IndexPackage>>>,

    parsed_versions: RefCell<HashMap<String, Option<PackageVersion>>>,
    parsed_deps: RefCell<HashMap<String, Dependency>>,
}

impl DependencyResolver {
    /// Build a resolver over a set of loaded indexes.
    pub fn new(indexes: &[NamedIndex]) -> Self {
        let mut name_map: HashMap<String, Vec<Arc<IndexPackage>>> = HashMap::new();
        let mut provides_only_map: HashMap<String, Vec<Arc<IndexPackage>>> = HashMap::new();
        let mut install_if_map: HashMap<String, Vec<Arc<IndexPackage>>> = HashMap::new();

        for index in indexes {
            for pkg in index.packages() {
                name_map
                    .entry(pkg.name.clone())
                    .or_default()
                    .push(Arc::clone(pkg));

                for trigger in &pkg.install_if {
                    install_if_map
                        .entry(trigger.clone())
                        .or_default()
                        .push(Arc::clone(pkg));
                }
            }
        }

        // Provided names resolve like package names, so they are indexed in
        // both maps. Iteration stays in index order to keep tie-breaking
        // deterministic.
        for index in indexes {
            for pkg in index.packages() {
                for provide in &pkg.provides {
                    let name = match Dependency::parse(provide) {
                        Ok(parsed) => parsed.name,
                        Err(_) => continue,
                    };

                    name_map.entry(name.clone()).or_default().push(Arc::clone(pkg));
                    provides_only_map
                        .entry(name)
                        .or_default()
                        .push(Arc::clone(pkg));
                }
            }
        }

        Self {
            name_map,
            provides_only_map,
            install_if_map,
            parsed_versions: RefCell::new(HashMap::new()),
            parsed_deps: RefCell::new(HashMap::new()),
        }
    }

    /// Compute the ordered install list and conflict set for a set of
    /// requested atoms.
    ///
    /// Every returned package precedes the packages that depend on it and
    /// appears at most once. Conflicts are collected from `!name` atoms in
    /// the request and in any walked dependency; they never prune
    /// candidates and are surfaced for the caller to check against the
    /// installed set.
    pub fn resolve(
        &self,
        world: &[String],
    ) -> Result<(Vec<Arc<IndexPackage>>, Vec<String>)> {
        let mut conflicts = Vec::new();

        // First resolve each explicit atom so every top-level walk sees the
        // full requested set when breaking ties.
        let mut existing: HashMap<String, Arc<IndexPackage>> = HashMap::new();
        for atom in world {
            let dep = self.parse_dependency(atom)?;
            if dep.conflict {
                conflicts.push(dep.name);
                continue;
            }

            let pkgs = self.resolve_package(atom)?;
            let pkg = &pkgs[0];
            existing
                .entry(pkg.name.clone())
                .or_insert_with(|| Arc::clone(pkg));
        }

        let mut to_install: Vec<Arc<IndexPackage>> = Vec::new();
        let mut tracked: HashSet<String> = HashSet::new();

        for atom in world {
            if self.parse_dependency(atom)?.conflict {
                continue;
            }

            let (pkg, deps, confs) = self.package_with_dependencies(atom, &existing)?;

            for dep in deps {
                if tracked.insert(dep.name.clone()) {
                    to_install.push(Arc::clone(&dep));
                }
                existing.entry(dep.name.clone()).or_insert(dep);
            }
            if tracked.insert(pkg.name.clone()) {
                to_install.push(Arc::clone(&pkg));
            }
            existing.entry(pkg.name.clone()).or_insert(pkg);

            conflicts.extend(confs);
        }

        self.add_install_if_packages(&mut to_install, &mut tracked);

        let conflicts = uniqify(conflicts);
        debug!(
            "resolved {} packages to install, {} conflicts",
            to_install.len(),
            conflicts.len()
        );

        Ok((to_install, conflicts))
    }

    /// Resolve a single atom to the candidate packages that satisfy it, in
    /// descending order of preference. The first entry is the best match.
    pub fn resolve_package(&self, atom: &str) -> Result<Vec<Arc<IndexPackage>>> {
        let dep = self.parse_dependency(atom)?;
        let pin = dep.pin.clone().unwrap_or_default();

        if let Some(candidates) = self.name_map.get(&dep.name) {
            let mut pkgs = self.filter_candidates(candidates, &dep, None, true, None);
            if pkgs.is_empty() {
                return Err(ApkError::PackageNotFound(atom.to_string()));
            }
            self.sort_candidates(&mut pkgs, None, &dep.name, &HashMap::new(), &pin);
            Ok(pkgs)
        } else {
            let providers = self
                .provides_only_map
                .get(&dep.name)
                .filter(|p| !p.is_empty())
                .ok_or_else(|| ApkError::PackageNotFound(atom.to_string()))?;

            let mut pkgs = providers.clone();
            self.sort_candidates(&mut pkgs, None, &dep.name, &HashMap::new(), "");
            Ok(pkgs)
        }
    }

    /// Resolve one atom plus its transitive dependencies.
    ///
    /// `existing` is the view of already-chosen packages; tie-breaking
    /// prefers candidates consistent with it. It is not modified.
    fn package_with_dependencies(
        &self,
        atom: &str,
        existing: &HashMap<String, Arc<IndexPackage>>,
    ) -> Result<(Arc<IndexPackage>, Vec<Arc<IndexPackage>>, Vec<String>)> {
        let pkgs = self.resolve_package(atom)?;
        let pkg = Arc::clone(&pkgs[0]);

        let pin = self.parse_dependency(atom)?.pin.unwrap_or_default();

        let mut parents = HashSet::new();
        let mut local_existing = existing.clone();
        let (deps, conflicts) =
            self.package_dependencies(&pkg, &pin, true, &mut parents, &mut local_existing)?;

        // Deduplicate, keeping first occurrences so post-order is retained.
        let mut dependencies = Vec::with_capacity(deps.len());
        let mut added: HashMap<String, Arc<IndexPackage>> = HashMap::with_capacity(deps.len());
        for dep in deps {
            if !added.contains_key(&dep.name) {
                added.insert(dep.name.clone(), Arc::clone(&dep));
                dependencies.push(dep);
            }
        }

        Ok((pkg, dependencies, conflicts))
    }

    /// Append packages whose `install_if` conditions are fully satisfied by
    /// the chosen set.
    fn add_install_if_packages(
        &self,
        to_install: &mut Vec<Arc<IndexPackage>>,
        tracked: &mut HashSet<String>,
    ) {
        // Walk in install order so the output stays deterministic.
        let mut pos = 0;
        while pos < to_install.len() {
            let pkg = Arc::clone(&to_install[pos]);
            pos += 1;

            let candidates = match self
                .install_if_map
                .get(&pkg.name)
                .or_else(|| self.install_if_map.get(&format!("{}={}", pkg.name, pkg.version)))
            {
                Some(candidates) => candidates,
                None => continue,
            };

            for trigger in candidates {
                if tracked.contains(&trigger.name) {
                    continue;
                }

                let satisfied = trigger.install_if.iter().all(|atom| {
                    let chosen = to_install.iter().find(|p| {
                        p.name == *atom
                            || match self.parse_dependency(atom) {
                                Ok(parsed) => {
                                    p.name == parsed.name
                                        && parsed.version.as_deref() == Some(p.version.as_str())
                                }
                                Err(_) => false,
                            }
                    });
                    chosen.is_some()
                });

                if satisfied {
                    debug!(
                        "install_if adds {} (triggered by {})",
                        trigger.name, pkg.name
                    );
                    tracked.insert(trigger.name.clone());
                    to_install.push(Arc::clone(trigger));
                }
            }
        }
    }

    /// Walk the dependencies of one package depth-first, appending chosen
    /// packages in post-order and collecting `!name` conflicts.
    ///
    /// `parents` holds the names on the current walk path; a chosen
    /// dependency already on the path closes a cycle and is skipped.
    /// `existing` accumulates choices made in this subtree so later ties
    /// prefer already-chosen packages.
    fn package_dependencies(
        &self,
        pkg: &Arc<IndexPackage>,
        allow_pin: &str,
        allow_self_fulfill: bool,
        parents: &mut HashSet<String>,
        existing: &mut HashMap<String, Arc<IndexPackage>>,
    ) -> Result<(Vec<Arc<IndexPackage>>, Vec<String>)> {
        parents.insert(pkg.name.clone());

        // Anything this package provides is already satisfied by itself.
        let mut my_provides = HashSet::with_capacity(2 * pkg.provides.len());
        for provide in &pkg.provides {
            if let Ok(parsed) = self.parse_dependency(provide) {
                my_provides.insert(parsed.name);
            }
            my_provides.insert(provide.clone());
        }

        let mut dependencies = Vec::new();
        let mut conflicts = Vec::new();

        for dep in &pkg.depends {
            let parsed = self.parse_dependency(dep)?;

            if parsed.conflict {
                conflicts.push(parsed.name);
                continue;
            }

            if my_provides.contains(dep) || my_provides.contains(&parsed.name) {
                continue;
            }

            if allow_self_fulfill && parsed.name == pkg.name && self.self_satisfies(pkg, &parsed) {
                continue;
            }

            let chosen = if let Some(candidates) = self.name_map.get(&parsed.name) {
                let filtered = self.filter_candidates(
                    candidates,
                    &parsed,
                    Some(allow_pin),
                    false,
                    existing.get(&parsed.name),
                );
                if filtered.is_empty() {
                    return Err(ApkError::PackageNotFound(dep.clone()));
                }

                let mut filtered = filtered;
                self.sort_candidates(&mut filtered, None, &parsed.name, existing, "");
                filtered.swap_remove(0)
            } else {
                let initial = self
                    .provides_only_map
                    .get(&parsed.name)
                    .filter(|p| !p.is_empty())
                    .ok_or_else(|| {
                        ApkError::PackageNotFound(format!("{} (required by {})", dep, pkg.name))
                    })?;

                // Providers from a pinned repository are only eligible when
                // the pin was requested; the package itself satisfying the
                // name short-circuits the lookup.
                let mut is_self = false;
                let mut providers = Vec::new();
                for provider in initial {
                    if !provider.pinned_repo_name.is_empty()
                        && provider.pinned_repo_name != allow_pin
                    {
                        continue;
                    }
                    if provider.name == pkg.name {
                        is_self = true;
                        break;
                    }
                    providers.push(Arc::clone(provider));
                }
                if is_self {
                    continue;
                }
                if providers.is_empty() {
                    return Err(ApkError::PackageNotFound(format!(
                        "{} (required by {})",
                        dep, pkg.name
                    )));
                }

                self.sort_candidates(&mut providers, Some(pkg), &parsed.name, existing, "");
                providers.swap_remove(0)
            };

            // Cycle: the chosen package is already on the walk path and
            // will be emitted by an ancestor.
            if parents.contains(&chosen.name) {
                continue;
            }

            let result =
                self.package_dependencies(&chosen, allow_pin, true, parents, existing);
            let (sub_deps, sub_conflicts) = result?;

            for sub in &sub_deps {
                existing.insert(sub.name.clone(), Arc::clone(sub));
            }
            dependencies.extend(sub_deps);
            dependencies.push(chosen);
            conflicts.extend(sub_conflicts);
        }

        parents.remove(&pkg.name);

        Ok((dependencies, conflicts))
    }

    /// Whether a package's own version satisfies a self-referential atom.
    fn self_satisfies(&self, pkg: &IndexPackage, dep: &Dependency) -> bool {
        match (&dep.comparator, &dep.version) {
            (Comparator::None, _) | (_, None) => true,
            (cmp, Some(required)) => {
                match (self.parse_version(&pkg.version), self.parse_version(required)) {
                    (Some(actual), Some(required)) => cmp.satisfies(&actual, &required),
                    _ => false,
                }
            }
        }
    }

    /// Filter candidates by version constraint, repository pin and the
    /// already-chosen view.
    fn filter_candidates(
        &self,
        candidates: &[Arc<IndexPackage>],
        dep: &Dependency,
        allow_pin: Option<&str>,
        prefer_pin: bool,
        installed: Option<&Arc<IndexPackage>>,
    ) -> Vec<Arc<IndexPackage>> {
        let version_ok = |pkg: &IndexPackage| -> bool {
            match (&dep.comparator, &dep.version) {
                (Comparator::None, _) | (_, None) => true,
                (cmp, Some(required)) => {
                    match (self.parse_version(&pkg.version), self.parse_version(required)) {
                        (Some(actual), Some(required)) => cmp.satisfies(&actual, &required),
                        _ => false,
                    }
                }
            }
        };

        let mut filtered: Vec<Arc<IndexPackage>> = candidates
            .iter()
            .filter(|pkg| version_ok(pkg))
            .filter(|pkg| match allow_pin {
                Some(pin) => pkg.pinned_repo_name.is_empty() || pkg.pinned_repo_name == pin,
                None => true,
            })
            .map(Arc::clone)
            .collect();

        // A package already chosen at an exact version wins outright.
        if let Some(installed) = installed {
            let exact: Vec<Arc<IndexPackage>> = filtered
                .iter()
                .filter(|pkg| pkg.name == installed.name && pkg.version == installed.version)
                .map(Arc::clone)
                .collect();
            if !exact.is_empty() {
                return exact;
            }
        }

        // Pins are a preference: restrict to matches only when any exist.
        if prefer_pin {
            if let Some(pin) = &dep.pin {
                let pinned: Vec<Arc<IndexPackage>> = filtered
                    .iter()
                    .filter(|pkg| &pkg.pinned_repo_name == pin)
                    .map(Arc::clone)
                    .collect();
                if !pinned.is_empty() {
                    filtered = pinned;
                }
            }
        }

        filtered
    }

    /// Sort candidates in descending order of preference.
    ///
    /// `compare` is the package requesting the dependency, when resolving a
    /// provided name; `name` is the name being looked for, which may be
    /// provided rather than owned, in which case the version carried by the
    /// matching `provides` atom is what gets compared.
    fn sort_candidates(
        &self,
        pkgs: &mut [Arc<IndexPackage>],
        compare: Option<&IndexPackage>,
        name: &str,
        existing: &HashMap<String, Arc<IndexPackage>>,
        pin: &str,
    ) {
        let existing_origins: HashSet<&str> = existing
            .values()
            .filter(|pkg| !pkg.origin.is_empty())
            .map(|pkg| pkg.origin.as_str())
            .collect();

        pkgs.sort_by(|a, b| {
            if let Some(compare) = compare {
                let a_repo = a.repository_uri == compare.repository_uri;
                let b_repo = b.repository_uri == compare.repository_uri;
                match b_repo.cmp(&a_repo) {
                    Ordering::Equal => {}
                    res => return res,
                }

                let a_origin = a.origin == compare.origin;
                let b_origin = b.origin == compare.origin;
                match b_origin.cmp(&a_origin) {
                    Ordering::Equal => {}
                    res => return res,
                }
            }

            let a_exact = existing
                .get(&a.name)
                .map_or(false, |pkg| pkg.version == a.version);
            let b_exact = existing
                .get(&b.name)
                .map_or(false, |pkg| pkg.version == b.version);
            match b_exact.cmp(&a_exact) {
                Ordering::Equal => {}
                res => return res,
            }

            let a_origin = existing_origins.contains(a.origin.as_str());
            let b_origin = existing_origins.contains(b.origin.as_str());
            match b_origin.cmp(&a_origin) {
                Ordering::Equal => {}
                res => return res,
            }

            let a_pin = a.pinned_repo_name == pin;
            let b_pin = b.pinned_repo_name == pin;
            match b_pin.cmp(&a_pin) {
                Ordering::Equal => {}
                res => return res,
            }

            match b.provider_priority.cmp(&a.provider_priority) {
                Ordering::Equal => {}
                res => return res,
            }

            // Compare the version of the *name* being resolved, which for a
            // provider is the version carried by its provides atom.
            let a_ver_str = self.dep_version_for_name(a, name);
            let b_ver_str = self.dep_version_for_name(b, name);
            let a_ver = a_ver_str.as_deref().and_then(|v| self.parse_version(v));
            let b_ver = b_ver_str.as_deref().and_then(|v| self.parse_version(v));

            match (&a_ver, &b_ver) {
                (Some(a_ver), Some(b_ver)) => match b_ver.cmp(a_ver) {
                    Ordering::Equal => {}
                    res => return res,
                },
                // Unparseable versions sort last.
                (Some(_), None) => return Ordering::Less,
                (None, Some(_)) => return Ordering::Greater,
                (None, None) => {}
            }

            // Equal provided versions may still differ as packages.
            if a_ver_str.as_deref() != Some(a.version.as_str())
                || b_ver_str.as_deref() != Some(b.version.as_str())
            {
                let a_pkg_ver = self.parse_version(&a.version);
                let b_pkg_ver = self.parse_version(&b.version);
                match (&a_pkg_ver, &b_pkg_ver) {
                    (Some(a_ver), Some(b_ver)) => match b_ver.cmp(a_ver) {
                        Ordering::Equal => {}
                        res => return res,
                    },
                    (Some(_), None) => return Ordering::Less,
                    (None, Some(_)) => return Ordering::Greater,
                    (None, None) => {}
                }
            }

            a.name.cmp(&b.name)
        });
    }

    /// The version under which a package satisfies `name`: its own version
    /// when it owns the name, else the version carried by the matching
    /// provides atom (unversioned provides count as the package version).
    fn dep_version_for_name(&self, pkg: &IndexPackage, name: &str) -> Option<String> {
        if name.is_empty() || name == pkg.name {
            return Some(pkg.version.clone());
        }

        for provide in &pkg.provides {
            if let Ok(parsed) = self.parse_dependency(provide) {
                if parsed.name == name {
                    return Some(parsed.version.unwrap_or_else(|| pkg.version.clone()));
                }
            }
        }

        None
    }

    /// Memoized version parsing. Unparseable versions resolve to [None].
    fn parse_version(&self, version: &str) -> Option<PackageVersion> {
        if let Some(cached) = self.parsed_versions.borrow().get(version) {
            return cached.clone();
        }

        let parsed = PackageVersion::parse(version).ok();
        self.parsed_versions
            .borrow_mut()
            .insert(version.to_string(), parsed.clone());
        parsed
    }

    /// Memoized dependency atom parsing.
    fn parse_dependency(&self, atom: &str) -> Result<Dependency> {
        if let Some(cached) = self.parsed_deps.borrow().get(atom) {
            return Ok(cached.clone());
        }

        let parsed = Dependency::parse(atom)?;
        self.parsed_deps
            .borrow_mut()
            .insert(atom.to_string(), parsed.clone());
        Ok(parsed)
    }
}
