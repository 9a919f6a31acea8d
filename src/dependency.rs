// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! The APK dependency expression language.

A dependency atom has the form `[!]name[{op}version][@pin]`, where `op` is
one of `=`, `<`, `<=`, `>`, `>=`, `~=` or `><`. A leading `!` turns the atom
into a conflict ("cannot be installed alongside `name`") rather than a
requirement. The `@pin` suffix biases resolution toward a named repository.
*/

use {
    crate::{
        error::{ApkError, Result},
        package_version::{Comparator, PackageVersion},
    },
    std::fmt::{Display, Formatter},
    std::str::FromStr,
};

/// Comparison operators in the order they must be matched (longest first).
const OPERATORS: &[(&str, Comparator)] = &[
    ("><", Comparator::Fuzzy),
    ("~=", Comparator::Tilde),
    (">=", Comparator::GreaterOrEqual),
    ("<=", Comparator::LessOrEqual),
    ("=", Comparator::Equal),
    ("<", Comparator::Less),
    (">", Comparator::Greater),
];

/// A parsed dependency atom.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Dependency {
    /// The package or provided name being constrained.
    pub name: String,

    /// Version comparison operator. [Comparator::None] when unversioned.
    pub comparator: Comparator,

    /// The version operand, unparsed. `Some` iff an operator is present.
    pub version: Option<String>,

    /// Repository pin label from an `@pin` suffix.
    pub pin: Option<String>,

    /// Whether the atom is a `!name` conflict.
    pub conflict: bool,
}

impl Dependency {
    /// Parse a dependency atom from its textual form.
    pub fn parse(s: &str) -> Result<Self> {
        let (conflict, s) = match s.strip_prefix('!') {
            Some(rest) => (true, rest),
            None => (false, s),
        };

        let (s, pin) = match s.rsplit_once('@') {
            Some((base, pin)) if !pin.is_empty() => (base, Some(pin.to_string())),
            _ => (s, None),
        };

        let mut name = s;
        let mut comparator = Comparator::None;
        let mut version = None;

        for (op, cmp) in OPERATORS {
            if let Some(pos) = s.find(op) {
                let operand = &s[pos + op.len()..];
                if operand.is_empty() {
                    return Err(ApkError::DependencyParse(s.to_string()));
                }
                name = &s[..pos];
                comparator = *cmp;
                version = Some(operand.to_string());
                break;
            }
        }

        if name.is_empty() {
            return Err(ApkError::DependencyParse(s.to_string()));
        }

        Ok(Self {
            name: name.to_string(),
            comparator,
            version,
            pin,
            conflict,
        })
    }

    /// Whether a concrete version satisfies this atom's constraint.
    ///
    /// Unversioned atoms accept any version. An unparseable operand never
    /// matches.
    pub fn version_satisfies(&self, actual: &PackageVersion) -> bool {
        match (&self.comparator, &self.version) {
            (Comparator::None, _) => true,
            (cmp, Some(required)) => match PackageVersion::parse(required) {
                Ok(required) => cmp.satisfies(actual, &required),
                Err(_) => false,
            },
            (_, None) => true,
        }
    }
}

impl FromStr for Dependency {
    type Err = ApkError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl Display for Dependency {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.conflict {
            write!(f, "!")?;
        }
        write!(f, "{}", self.name)?;
        if let Some(version) = &self.version {
            write!(f, "{}{}", self.comparator.as_str(), version)?;
        }
        if let Some(pin) = &self.pin {
            write!(f, "@{}", pin)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parse_forms() -> Result<()> {
        let d = Dependency::parse("busybox")?;
        assert_eq!(d.name, "busybox");
        assert_eq!(d.comparator, Comparator::None);
        assert_eq!(d.version, None);
        assert_eq!(d.pin, None);
        assert!(!d.conflict);

        let d = Dependency::parse("openssl>=3.1.0-r1")?;
        assert_eq!(d.name, "openssl");
        assert_eq!(d.comparator, Comparator::GreaterOrEqual);
        assert_eq!(d.version.as_deref(), Some("3.1.0-r1"));

        let d = Dependency::parse("!openssl")?;
        assert!(d.conflict);
        assert_eq!(d.name, "openssl");

        let d = Dependency::parse("curl=8.4.0-r0@edge")?;
        assert_eq!(d.name, "curl");
        assert_eq!(d.comparator, Comparator::Equal);
        assert_eq!(d.pin.as_deref(), Some("edge"));

        let d = Dependency::parse("zlib@edge")?;
        assert_eq!(d.name, "zlib");
        assert_eq!(d.comparator, Comparator::None);
        assert_eq!(d.pin.as_deref(), Some("edge"));

        let d = Dependency::parse("musl~=1.2")?;
        assert_eq!(d.comparator, Comparator::Tilde);

        let d = Dependency::parse("musl><1.2")?;
        assert_eq!(d.comparator, Comparator::Fuzzy);

        assert!(Dependency::parse("").is_err());
        assert!(Dependency::parse("=1.0").is_err());
        assert!(Dependency::parse("pkg=").is_err());

        Ok(())
    }

    #[test]
    fn display_round_trip() {
        for s in [
            "busybox",
            "openssl>=3.1.0-r1",
            "!openssl",
            "curl=8.4.0-r0@edge",
            "zlib@edge",
            "musl~=1.2",
        ] {
            assert_eq!(Dependency::parse(s).unwrap().to_string(), s);
        }
    }

    #[test]
    fn version_satisfaction() {
        let v = PackageVersion::parse("1.5.2").unwrap();

        assert!(Dependency::parse("a").unwrap().version_satisfies(&v));
        assert!(Dependency::parse("a=1.5.2").unwrap().version_satisfies(&v));
        assert!(Dependency::parse("a>1.5").unwrap().version_satisfies(&v));
        assert!(!Dependency::parse("a<1.5").unwrap().version_satisfies(&v));
        assert!(!Dependency::parse("a=bogus..version")
            .unwrap()
            .version_satisfies(&v));
    }
}
