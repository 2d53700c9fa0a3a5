//! Component identity types: component tags, versions, and release versions.

use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};
use std::borrow::Borrow;
use std::str::FromStr;

use crate::SchemaError;

/// Maximum length of a component type tag.
pub const MAX_COMPONENT_TYPE_LENGTH: usize = 50;

const COMPONENT_TYPE_PATTERN: &str = r"^[a-zA-Z][a-zA-Z0-9_-]*$";

const VERSION_PATTERN: &str = concat!(
    r"^(?P<major>\d+)\.(?P<minor>\d+)\.(?P<patch>\d+)",
    r"(?:-(?P<prerelease>[0-9A-Za-z-]+(?:\.[0-9A-Za-z-]+)*))?",
    r"(?:\+(?P<build>[0-9A-Za-z-]+(?:\.[0-9A-Za-z-]+)*))?$",
);

const RELEASE_DATE_PATTERN: &str = r"^(\d{4})\.(\d{2})\.(\d{2})$";

const PATH_SAFE_PATTERN: &str = r"^[0-9A-Za-z][0-9A-Za-z._+-]*$";

fn matches(pattern: &str, input: &str) -> Result<bool, SchemaError> {
    Ok(Regex::new(pattern)?.is_match(input))
}

/// A user-defined component tag such as `model` or `runtime`.
///
/// Stored verbatim (no case folding): the tag is also a directory and
/// storage-key segment.
///
/// Deserialization validates like [`ComponentType::parse`], so a tag read
/// from a manifest is always a single safe path segment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ComponentType(String);

impl ComponentType {
    /// Wrap a tag without validation.
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Parse and validate a tag.
    ///
    /// # Errors
    ///
    /// Returns [`SchemaError::InvalidComponentType`] if the tag is empty,
    /// longer than [`MAX_COMPONENT_TYPE_LENGTH`], or does not start with a
    /// letter followed by letters, digits, `_` or `-`.
    pub fn parse(s: &str) -> Result<Self, SchemaError> {
        if s.is_empty() {
            return Err(SchemaError::InvalidComponentType {
                value: s.to_string(),
                reason: "must not be empty".into(),
            });
        }
        if s.len() > MAX_COMPONENT_TYPE_LENGTH {
            return Err(SchemaError::InvalidComponentType {
                value: s.to_string(),
                reason: format!("longer than {MAX_COMPONENT_TYPE_LENGTH} characters"),
            });
        }
        if !matches(COMPONENT_TYPE_PATTERN, s)? {
            return Err(SchemaError::InvalidComponentType {
                value: s.to_string(),
                reason: "must start with a letter and contain only letters, digits, '_' or '-'"
                    .into(),
            });
        }
        Ok(Self(s.to_string()))
    }

    /// Return the tag as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ComponentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl<'de> Deserialize<'de> for ComponentType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

impl std::ops::Deref for ComponentType {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl AsRef<str> for ComponentType {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl AsRef<std::path::Path> for ComponentType {
    fn as_ref(&self) -> &std::path::Path {
        std::path::Path::new(&self.0)
    }
}

impl Borrow<str> for ComponentType {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl PartialEq<str> for ComponentType {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

impl PartialEq<&str> for ComponentType {
    fn eq(&self, other: &&str) -> bool {
        self.0 == *other
    }
}

impl From<&str> for ComponentType {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for ComponentType {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

/// A component version string.
///
/// Ordering uses semantic-version precedence when both sides parse as
/// semver; semver versions sort below non-semver tags, and two non-semver
/// tags compare lexically.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct Version(String);

impl Ord for Version {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        match (
            semver::Version::parse(&self.0),
            semver::Version::parse(&other.0),
        ) {
            (Ok(a), Ok(b)) => a.cmp(&b),
            (Ok(_), Err(_)) => std::cmp::Ordering::Less,
            (Err(_), Ok(_)) => std::cmp::Ordering::Greater,
            (Err(_), Err(_)) => self.0.cmp(&other.0),
        }
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Version {
    /// Create a new version from the given string (stored as-is).
    pub fn new(v: &str) -> Self {
        Self(v.to_string())
    }

    /// Parse and validate a component version against the
    /// `MAJOR.MINOR.PATCH[-pre][+build]` pattern.
    ///
    /// # Errors
    ///
    /// Returns [`SchemaError::InvalidVersion`] when the string does not match.
    pub fn parse(v: &str) -> Result<Self, SchemaError> {
        if matches(VERSION_PATTERN, v)? {
            Ok(Self(v.to_string()))
        } else {
            Err(SchemaError::InvalidVersion(v.to_string()))
        }
    }

    /// Return the version string as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl<'de> Deserialize<'de> for Version {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

impl std::ops::Deref for Version {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl AsRef<str> for Version {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl AsRef<std::path::Path> for Version {
    fn as_ref(&self) -> &std::path::Path {
        std::path::Path::new(&self.0)
    }
}

impl From<&str> for Version {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for Version {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl PartialEq<str> for Version {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

impl PartialEq<&str> for Version {
    fn eq(&self, other: &&str) -> bool {
        self.0 == *other
    }
}

/// Identity of a packaged artifact: `(type, version)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Component {
    /// Component type tag.
    #[serde(rename = "type")]
    pub kind: ComponentType,
    /// Component version.
    pub version: Version,
}

impl Component {
    /// Build a component identity without validation.
    pub fn new(kind: impl Into<ComponentType>, version: impl Into<Version>) -> Self {
        Self {
            kind: kind.into(),
            version: version.into(),
        }
    }

    /// Build a component identity, validating both halves.
    ///
    /// # Errors
    ///
    /// Propagates [`ComponentType::parse`] and [`Version::parse`] failures.
    pub fn parse(kind: &str, version: &str) -> Result<Self, SchemaError> {
        Ok(Self {
            kind: ComponentType::parse(kind)?,
            version: Version::parse(version)?,
        })
    }
}

impl std::fmt::Display for Component {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.kind, self.version)
    }
}

/// Parses the `type:version` form used on the command line.
impl FromStr for Component {
    type Err = SchemaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, version) = s
            .split_once(':')
            .ok_or_else(|| SchemaError::InvalidComponentSpec(s.to_string()))?;
        Self::parse(kind, version)
    }
}

/// Which naming scheme a release version follows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseVersionKind {
    /// Calendar form `YYYY.MM.DD`.
    Date,
    /// Semantic version.
    Semantic,
    /// Any other path-safe token.
    Custom,
}

/// Identity of a release bundle, e.g. `2024.01.20` or `1.4.0`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ReleaseVersion(String);

impl ReleaseVersion {
    /// Wrap a release version without validation.
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Validate a release version and classify it.
    ///
    /// Custom tags are accepted as long as they are safe to use as a single
    /// path segment and storage key component; callers may warn on
    /// [`ReleaseVersionKind::Custom`].
    ///
    /// # Errors
    ///
    /// Returns [`SchemaError::InvalidReleaseVersion`] for empty or path-unsafe
    /// values, or for date-shaped values with an out-of-range month or day.
    pub fn parse(s: &str) -> Result<(Self, ReleaseVersionKind), SchemaError> {
        let invalid = |reason: &str| SchemaError::InvalidReleaseVersion {
            value: s.to_string(),
            reason: reason.to_string(),
        };

        if let Some(caps) = Regex::new(RELEASE_DATE_PATTERN)?.captures(s) {
            let month: u32 = caps[2].parse().map_err(|_| invalid("bad month"))?;
            let day: u32 = caps[3].parse().map_err(|_| invalid("bad day"))?;
            if !(1..=12).contains(&month) {
                return Err(invalid("month must be between 01 and 12"));
            }
            if !(1..=31).contains(&day) {
                return Err(invalid("day must be between 01 and 31"));
            }
            return Ok((Self(s.to_string()), ReleaseVersionKind::Date));
        }

        if matches(VERSION_PATTERN, s)? {
            return Ok((Self(s.to_string()), ReleaseVersionKind::Semantic));
        }

        if s.contains("..") || !matches(PATH_SAFE_PATTERN, s)? {
            return Err(invalid(
                "must be YYYY.MM.DD, a semantic version, or a token of letters, digits, '.', '_', '+', '-'",
            ));
        }

        Ok((Self(s.to_string()), ReleaseVersionKind::Custom))
    }

    /// Return the release version as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ReleaseVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl<'de> Deserialize<'de> for ReleaseVersion {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s)
            .map(|(version, _)| version)
            .map_err(serde::de::Error::custom)
    }
}

impl AsRef<str> for ReleaseVersion {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl AsRef<std::path::Path> for ReleaseVersion {
    fn as_ref(&self) -> &std::path::Path {
        std::path::Path::new(&self.0)
    }
}

impl PartialEq<&str> for ReleaseVersion {
    fn eq(&self, other: &&str) -> bool {
        self.0 == *other
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_component_type_validation() {
        assert!(ComponentType::parse("model").is_ok());
        assert!(ComponentType::parse("runtime_v2-cpu").is_ok());
        assert!(ComponentType::parse("").is_err());
        assert!(ComponentType::parse("9model").is_err());
        assert!(ComponentType::parse("mo del").is_err());
        assert!(ComponentType::parse(&"a".repeat(51)).is_err());
    }

    #[test]
    fn test_version_validation() {
        assert!(Version::parse("1.0.0").is_ok());
        assert!(Version::parse("1.0.0-rc.1+build.5").is_ok());
        assert!(Version::parse("1.0").is_err());
        assert!(Version::parse("v1.0.0").is_err());
    }

    #[test]
    fn test_version_ordering_is_semantic() {
        let mut versions: Vec<Version> = ["1.10.0", "1.2.0", "1.9.3", "1.10.0-rc.1"]
            .into_iter()
            .map(Version::from)
            .collect();
        versions.sort();
        let sorted: Vec<&str> = versions.iter().map(Version::as_str).collect();
        assert_eq!(sorted, ["1.2.0", "1.9.3", "1.10.0-rc.1", "1.10.0"]);
    }

    #[test]
    fn test_component_from_str() {
        let c: Component = "model:1.0.0".parse().unwrap();
        assert_eq!(c.kind, "model");
        assert_eq!(c.version, "1.0.0");
        assert_eq!(c.to_string(), "model:1.0.0");
        assert!("model".parse::<Component>().is_err());
    }

    #[test]
    fn test_deserialization_rejects_path_like_values() {
        for bad in [r#""/tmp/outside""#, r#""../model""#, r#""a/b""#, r#""""#] {
            assert!(serde_json::from_str::<ComponentType>(bad).is_err(), "{bad}");
            assert!(serde_json::from_str::<Version>(bad).is_err(), "{bad}");
            assert!(serde_json::from_str::<ReleaseVersion>(bad).is_err(), "{bad}");
        }
        let c: Component = serde_json::from_str(r#"{"type": "model", "version": "1.0.0"}"#).unwrap();
        assert_eq!(c, Component::new("model", "1.0.0"));
        let r: ReleaseVersion = serde_json::from_str(r#""2024.01.20""#).unwrap();
        assert_eq!(r, "2024.01.20");
    }

    #[test]
    fn test_release_version_kinds() {
        assert_eq!(
            ReleaseVersion::parse("2024.01.20").unwrap().1,
            ReleaseVersionKind::Date
        );
        assert_eq!(
            ReleaseVersion::parse("2.3.4").unwrap().1,
            ReleaseVersionKind::Semantic
        );
        assert_eq!(
            ReleaseVersion::parse("nightly-42").unwrap().1,
            ReleaseVersionKind::Custom
        );
        assert!(ReleaseVersion::parse("2024.13.01").is_err());
        assert!(ReleaseVersion::parse("2024.01.32").is_err());
        assert!(ReleaseVersion::parse("../etc").is_err());
        assert!(ReleaseVersion::parse("a/b").is_err());
        assert!(ReleaseVersion::parse("").is_err());
    }
}
