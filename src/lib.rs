// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Alpine Linux (APK) packaging primitives.

This crate defines pure Rust implementations of the install-time behavior
of the Alpine Linux package manager: given a set of desired package names
and a list of repositories, it resolves a complete dependency closure,
fetches and verifies the selected archives, expands their contents into a
target filesystem and maintains the on-disk package database.

# A Tour of Functionality

`APKINDEX` and `.PKGINFO` files consist of line-oriented `key:value`
records. Low-level primitives for these are defined in the [control]
module: [control::ControlParagraph] holds an ordered set of
[control::ControlField] and [control::ControlParagraphReader] implements a
streaming reader. Well-formed input round-trips byte-for-byte.

The [package_version] module implements Alpine version string parsing and
comparison via [package_version::PackageVersion], along with the
comparison operators dependency atoms can carry. The [dependency] module
parses the atom language itself (`name>=1.2@pin`, `!conflict`) into
[dependency::Dependency] values.

A package record from a repository index is an [package::IndexPackage],
constructed from a control paragraph. The [index] module fetches
`APKINDEX.tar.gz` archives, verifies their RSA signatures against a
keyring and produces [index::NamedIndex] values.

The [dependency_resolution] module turns indexes into install plans.
[dependency_resolution::DependencyResolver] computes, for a set of
requested atoms, an ordered installation list (dependencies before
dependents) plus the set of conflicting names, honoring provider
priorities, repository pins, origin affinity and `install_if` triggers.

Package archives are concatenations of gzip members. The [expand] module
splits an archive into its signature/control/data streams while preserving
the raw bytes of each member and validating content digests, producing an
[expand::ApkExpanded]. The [cache] module stores expanded parts under
content-addressed names and optionally serves small HTTP documents from an
on-disk response store. The [fetch] module retrieves archives over
`file://` or `https://`, transparently resuming interrupted downloads with
byte-range requests.

Installation goes through the [fs::ApkFilesystem] trait, so a target root
can be a plain directory ([fs::DirFilesystem]) or any other
implementation. The [database] module maintains `/lib/apk/db` (the
`installed` file, `triggers` and `scripts.tar`).

[apk::Apk] is the high-level entry point tying everything together:
`init_db`, `init_keyring`, repository and world configuration,
`resolve_world` and `fixate_world`.
*/

pub mod apk;
pub mod cache;
pub mod control;
pub mod database;
pub mod dependency;
pub mod dependency_resolution;
pub mod error;
pub mod expand;
pub mod fetch;
pub mod fs;
pub mod index;
mod install;
pub mod io;
pub mod package;
pub mod package_version;
pub mod releases;
#[cfg(test)]
mod testutil;
