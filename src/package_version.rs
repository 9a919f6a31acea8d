// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Alpine package version string handling. */

use {
    std::{
        cmp::Ordering,
        fmt::{Display, Formatter},
        num::ParseIntError,
        str::FromStr,
    },
    thiserror::Error,
};

#[derive(Clone, Debug, Error)]
pub enum VersionError {
    #[error("error parsing string to integer: {0}")]
    ParseInt(#[from] ParseIntError),

    #[error("version does not start with a digit: {0}")]
    MissingDigits(String),

    #[error("unknown version suffix: {0}")]
    UnknownSuffix(String),

    #[error("trailing characters in version: {0}")]
    TrailingInput(String),
}

pub type Result<T> = std::result::Result<T, VersionError>;

/// A pre- or post-release suffix in a version string.
///
/// Suffixes are introduced by `_`. All suffixes except `p` denote states
/// before the plain version; `p` (patch) denotes a state after it.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum SuffixKind {
    Alpha,
    Beta,
    Pre,
    Rc,
    Cvs,
    Svn,
    Git,
    Hg,
    P,
}

impl SuffixKind {
    fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "alpha" => Self::Alpha,
            "beta" => Self::Beta,
            "pre" => Self::Pre,
            "rc" => Self::Rc,
            "cvs" => Self::Cvs,
            "svn" => Self::Svn,
            "git" => Self::Git,
            "hg" => Self::Hg,
            "p" => Self::P,
            _ => return None,
        })
    }

    fn as_str(&self) -> &'static str {
        match self {
            Self::Alpha => "alpha",
            Self::Beta => "beta",
            Self::Pre => "pre",
            Self::Rc => "rc",
            Self::Cvs => "cvs",
            Self::Svn => "svn",
            Self::Git => "git",
            Self::Hg => "hg",
            Self::P => "p",
        }
    }

    /// Sort rank relative to the suffix-less version, which ranks 8.
    fn rank(&self) -> u8 {
        match self {
            Self::Alpha => 0,
            Self::Beta => 1,
            Self::Pre => 2,
            Self::Rc => 3,
            Self::Cvs => 4,
            Self::Svn => 5,
            Self::Git => 6,
            Self::Hg => 7,
            Self::P => 9,
        }
    }
}

/// Rank of "no further suffix". Suffixes before `p` sort below this, `p` above.
const BASE_RANK: u8 = 8;

/// A parsed `_suffix[N]` component.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct VersionSuffix {
    pub kind: SuffixKind,
    pub number: Option<u64>,
}

/// An Alpine package version.
///
/// The format is `digits(.digits)*[letter][_suffix[N]]*[-rN]`. Ordering is
/// total: numeric components compare numerically, a trailing letter compares
/// after the bare number, pre-release suffixes compare before the bare
/// version and `_p` after it, and `-rN` build revisions compare last.
///
/// Equality is defined through the ordering, so an absent build revision
/// equals an explicit `-r0`.
#[derive(Clone, Debug)]
pub struct PackageVersion {
    components: Vec<u64>,
    letter: Option<char>,
    suffixes: Vec<VersionSuffix>,
    revision: Option<u64>,
}

impl PackageVersion {
    /// Construct an instance by parsing a version string.
    pub fn parse(s: &str) -> Result<Self> {
        let mut remaining = s;

        let mut components = Vec::new();
        loop {
            let digits: &str = remaining
                .split(|c: char| !c.is_ascii_digit())
                .next()
                .unwrap_or("");
            if digits.is_empty() {
                return Err(VersionError::MissingDigits(s.to_string()));
            }

            components.push(u64::from_str(digits)?);
            remaining = &remaining[digits.len()..];

            if let Some(rest) = remaining.strip_prefix('.') {
                remaining = rest;
            } else {
                break;
            }
        }

        let letter = match remaining.chars().next() {
            Some(c) if c.is_ascii_lowercase() => {
                remaining = &remaining[1..];
                Some(c)
            }
            _ => None,
        };

        let mut suffixes = Vec::new();
        while let Some(rest) = remaining.strip_prefix('_') {
            let word: &str = rest
                .split(|c: char| !c.is_ascii_lowercase())
                .next()
                .unwrap_or("");
            let kind = SuffixKind::parse(word)
                .ok_or_else(|| VersionError::UnknownSuffix(s.to_string()))?;

            let after_word = &rest[word.len()..];
            let digits: &str = after_word
                .split(|c: char| !c.is_ascii_digit())
                .next()
                .unwrap_or("");
            let number = if digits.is_empty() {
                None
            } else {
                Some(u64::from_str(digits)?)
            };

            suffixes.push(VersionSuffix { kind, number });
            remaining = &after_word[digits.len()..];
        }

        let revision = if let Some(rest) = remaining.strip_prefix("-r") {
            if rest.is_empty() || !rest.chars().all(|c| c.is_ascii_digit()) {
                return Err(VersionError::TrailingInput(s.to_string()));
            }
            remaining = "";
            Some(u64::from_str(rest)?)
        } else {
            None
        };

        if !remaining.is_empty() {
            return Err(VersionError::TrailingInput(s.to_string()));
        }

        Ok(Self {
            components,
            letter,
            suffixes,
            revision,
        })
    }

    /// Numeric dotted components of the version.
    pub fn components(&self) -> &[u64] {
        &self.components
    }

    /// The optional single-letter component following the numbers.
    pub fn letter(&self) -> Option<char> {
        self.letter
    }

    /// Parsed `_suffix[N]` components, in order of appearance.
    pub fn suffixes(&self) -> &[VersionSuffix] {
        &self.suffixes
    }

    /// The `-rN` build revision, if present.
    pub fn revision(&self) -> Option<u64> {
        self.revision
    }

    /// Compare two versions ignoring their build revisions.
    pub fn cmp_ignoring_revision(&self, other: &Self) -> Ordering {
        let a = Self {
            revision: None,
            ..self.clone()
        };
        let b = Self {
            revision: None,
            ..other.clone()
        };
        a.cmp(&b)
    }
}

impl Display for PackageVersion {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let components = self
            .components
            .iter()
            .map(|c| c.to_string())
            .collect::<Vec<_>>()
            .join(".");
        write!(f, "{}", components)?;

        if let Some(letter) = self.letter {
            write!(f, "{}", letter)?;
        }

        for suffix in &self.suffixes {
            write!(f, "_{}", suffix.kind.as_str())?;
            if let Some(number) = suffix.number {
                write!(f, "{}", number)?;
            }
        }

        if let Some(revision) = self.revision {
            write!(f, "-r{}", revision)?;
        }

        Ok(())
    }
}

fn compare_suffixes(a: &[VersionSuffix], b: &[VersionSuffix]) -> Ordering {
    for pos in 0..std::cmp::max(a.len(), b.len()) {
        let a_rank = a.get(pos).map(|s| s.kind.rank()).unwrap_or(BASE_RANK);
        let b_rank = b.get(pos).map(|s| s.kind.rank()).unwrap_or(BASE_RANK);

        match a_rank.cmp(&b_rank) {
            Ordering::Equal => {}
            res => return res,
        }

        let a_number = a.get(pos).and_then(|s| s.number).unwrap_or(0);
        let b_number = b.get(pos).and_then(|s| s.number).unwrap_or(0);

        match a_number.cmp(&b_number) {
            Ordering::Equal => {}
            res => return res,
        }
    }

    Ordering::Equal
}

impl PartialEq for PackageVersion {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for PackageVersion {}

impl PartialOrd<Self> for PackageVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PackageVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        // Numeric components first. When one version has more components and
        // the shared prefix is equal, the longer one is newer (1.2 < 1.2.1).
        for pos in 0..std::cmp::max(self.components.len(), other.components.len()) {
            match (self.components.get(pos), other.components.get(pos)) {
                (Some(a), Some(b)) => match a.cmp(b) {
                    Ordering::Equal => {}
                    res => return res,
                },
                (Some(_), None) => return Ordering::Greater,
                (None, Some(_)) => return Ordering::Less,
                (None, None) => unreachable!(),
            }
        }

        match self.letter.cmp(&other.letter) {
            Ordering::Equal => {}
            res => return res,
        }

        match compare_suffixes(&self.suffixes, &other.suffixes) {
            Ordering::Equal => {}
            res => return res,
        }

        self.revision.unwrap_or(0).cmp(&other.revision.unwrap_or(0))
    }
}

/// Comparison operator of a versioned dependency.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub enum Comparator {
    /// No version constraint. Always satisfied.
    #[default]
    None,
    Equal,
    Less,
    LessOrEqual,
    Greater,
    GreaterOrEqual,
    /// `~=`: equal ignoring the trailing `-rN` build revision.
    Tilde,
    /// `><`: treated as a fuzzy match, like [Self::Tilde].
    Fuzzy,
}

impl Comparator {
    /// String form of the operator as it appears in dependency atoms.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "",
            Self::Equal => "=",
            Self::Less => "<",
            Self::LessOrEqual => "<=",
            Self::Greater => ">",
            Self::GreaterOrEqual => ">=",
            Self::Tilde => "~=",
            Self::Fuzzy => "><",
        }
    }

    /// Whether `actual` satisfies this operator against `required`.
    pub fn satisfies(&self, actual: &PackageVersion, required: &PackageVersion) -> bool {
        match self {
            Self::None => true,
            Self::Equal => actual == required,
            Self::Less => actual < required,
            Self::LessOrEqual => actual <= required,
            Self::Greater => actual > required,
            Self::GreaterOrEqual => actual >= required,
            Self::Tilde | Self::Fuzzy => {
                actual.cmp_ignoring_revision(required) == Ordering::Equal
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn v(s: &str) -> PackageVersion {
        PackageVersion::parse(s).unwrap()
    }

    #[test]
    fn parse() -> Result<()> {
        let version = v("1.2.3");
        assert_eq!(version.components(), &[1, 2, 3]);
        assert_eq!(version.letter(), None);
        assert!(version.suffixes().is_empty());
        assert_eq!(version.revision(), None);

        let version = v("1.2.3a_rc2-r4");
        assert_eq!(version.components(), &[1, 2, 3]);
        assert_eq!(version.letter(), Some('a'));
        assert_eq!(
            version.suffixes(),
            &[VersionSuffix {
                kind: SuffixKind::Rc,
                number: Some(2)
            }]
        );
        assert_eq!(version.revision(), Some(4));

        assert!(PackageVersion::parse("").is_err());
        assert!(PackageVersion::parse("abc").is_err());
        assert!(PackageVersion::parse("1.2_flurble").is_err());
        assert!(PackageVersion::parse("1.2-r").is_err());
        assert!(PackageVersion::parse("1.2-rc").is_err());

        Ok(())
    }

    #[test]
    fn format() {
        for s in ["1.2.3", "0.5", "1.2.3a_rc2-r4", "3.0_alpha_p1", "7-r1"] {
            assert_eq!(format!("{}", v(s)), s);
        }
    }

    #[test]
    fn ordering() {
        let ascending = [
            "0.9",
            "1.0_alpha",
            "1.0_beta2",
            "1.0_pre",
            "1.0_rc1",
            "1.0_git",
            "1.0",
            "1.0_p1",
            "1.0a",
            "1.0.1",
            "1.2-r0",
            "1.2-r1",
            "2.0",
        ];

        for pair in ascending.windows(2) {
            assert!(
                v(pair[0]) < v(pair[1]),
                "expected {} < {}",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn revision_is_least_significant() {
        assert_eq!(v("1.2"), v("1.2"));
        assert!(v("1.2") < v("1.2-r1"));
        assert_eq!(v("1.2-r0").cmp(&v("1.2")), Ordering::Equal);
    }

    #[test]
    fn comparator_satisfies() {
        assert!(Comparator::None.satisfies(&v("1.0"), &v("9.9")));
        assert!(Comparator::Equal.satisfies(&v("1.0"), &v("1.0")));
        assert!(!Comparator::Equal.satisfies(&v("1.0-r1"), &v("1.0")));
        assert!(Comparator::Less.satisfies(&v("1.0"), &v("1.1")));
        assert!(Comparator::GreaterOrEqual.satisfies(&v("1.1"), &v("1.1")));
        assert!(Comparator::Tilde.satisfies(&v("1.0-r5"), &v("1.0")));
        assert!(Comparator::Fuzzy.satisfies(&v("1.0-r5"), &v("1.0-r2")));
        assert!(!Comparator::Tilde.satisfies(&v("1.0.1"), &v("1.0")));
    }
}
