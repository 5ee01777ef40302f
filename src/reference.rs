//! Docker image references and content digests.
//!
//! An [ImageRef] is the identity the resolver keys on: a canonicalized
//! Docker-style reference (`[registry/]repository[:tag][@digest]`). A
//! [ContentDigest] is the immutable identity a reference pins to. Both are
//! grammar-validated at the boundary so that everything past parsing can
//! rely on structural equality.

use std::fmt;
use std::str::FromStr;

use once_cell::sync::Lazy;
use regex::Regex;

/// Raised when a reference or digest string does not match the grammar.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReferenceError {
    #[error("invalid image reference: {0}")]
    InvalidReference(String),
    #[error("invalid content digest: {0}")]
    InvalidDigest(String),
}

static REGISTRY_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-zA-Z0-9][a-zA-Z0-9.-]*(?::[0-9]+)?$").expect("registry regex")
});

static REPOSITORY_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-z0-9]+(?:[._-][a-z0-9]+)*(?:/[a-z0-9]+(?:[._-][a-z0-9]+)*)*$")
        .expect("repository regex")
});

static TAG_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-zA-Z0-9_][a-zA-Z0-9_.-]{0,127}$").expect("tag regex"));

static DIGEST_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?P<algorithm>[a-z0-9]+(?:[.+_-][a-z0-9]+)*):(?P<hex>[a-f0-9]{32,})$")
        .expect("digest regex")
});

/// A content digest naming a concrete image manifest.
///
/// Serialized as `algorithm:hex` with at least 32 lowercase hex digits;
/// in practice the algorithm is always `sha256`. Digests are immutable and
/// compare structurally.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentDigest {
    algorithm: String,
    hex: String,
}

impl ContentDigest {
    /// Parse an `algorithm:hex` string.
    pub fn parse(s: &str) -> Result<Self, ReferenceError> {
        let captures = DIGEST_RE
            .captures(s)
            .ok_or_else(|| ReferenceError::InvalidDigest(s.to_owned()))?;
        Ok(ContentDigest {
            algorithm: captures["algorithm"].to_owned(),
            hex: captures["hex"].to_owned(),
        })
    }

    /// The hash algorithm name, e.g. `sha256`.
    pub fn algorithm(&self) -> &str {
        &self.algorithm
    }

    /// The lowercase hexadecimal digest payload.
    pub fn hex(&self) -> &str {
        &self.hex
    }
}

impl FromStr for ContentDigest {
    type Err = ReferenceError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ContentDigest::parse(s)
    }
}

impl fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.hex)
    }
}

impl fmt::Debug for ContentDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

/// A parsed, canonicalized Docker image reference.
///
/// The registry component is detected the way Docker detects it: the first
/// path section is a registry when it contains a dot or a port, or is
/// exactly `localhost`. A reference carrying neither a tag nor a digest
/// canonicalizes to the `latest` tag, so two spellings of the same identity
/// compare equal. The canonical form is what [fmt::Display] emits and what
/// gets persisted.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ImageRef {
    registry: Option<String>,
    repository: String,
    tag: Option<String>,
    digest: Option<ContentDigest>,
}

impl ImageRef {
    /// Parse a Docker-style reference string.
    pub fn parse(s: &str) -> Result<Self, ReferenceError> {
        let invalid = || ReferenceError::InvalidReference(s.to_owned());

        let (rest, digest) = match s.rsplit_once('@') {
            Some((head, tail)) => {
                let digest = ContentDigest::parse(tail).map_err(|_| invalid())?;
                (head, Some(digest))
            }
            None => (s, None),
        };

        let (registry, path) = match rest.split_once('/') {
            Some((first, remainder)) if looks_like_registry(first) => {
                if !REGISTRY_RE.is_match(first) {
                    return Err(invalid());
                }
                (Some(first.to_owned()), remainder)
            }
            _ => (None, rest),
        };

        // With the registry stripped, a colon can only introduce a tag.
        let (repository, tag) = match path.rsplit_once(':') {
            Some((repo, tag)) => (repo, Some(tag.to_owned())),
            None => (path, None),
        };

        if !REPOSITORY_RE.is_match(repository) {
            return Err(invalid());
        }
        if let Some(tag) = &tag {
            if !TAG_RE.is_match(tag) {
                return Err(invalid());
            }
        }

        let tag = match (tag, &digest) {
            (None, None) => Some("latest".to_owned()),
            (tag, _) => tag,
        };

        Ok(ImageRef {
            registry,
            repository: repository.to_owned(),
            tag,
            digest,
        })
    }

    /// The registry host, when one was written.
    pub fn registry(&self) -> Option<&str> {
        self.registry.as_deref()
    }

    /// The repository path, e.g. `library/ubuntu`.
    pub fn repository(&self) -> &str {
        &self.repository
    }

    /// The tag, when present. Always present unless the reference carries
    /// a digest.
    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    /// The pinned digest, when the reference already names one.
    pub fn digest(&self) -> Option<&ContentDigest> {
        self.digest.as_ref()
    }
}

fn looks_like_registry(first: &str) -> bool {
    first == "localhost" || first.contains('.') || first.contains(':')
}

impl FromStr for ImageRef {
    type Err = ReferenceError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ImageRef::parse(s)
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(registry) = &self.registry {
            write!(f, "{registry}/")?;
        }
        f.write_str(&self.repository)?;
        if let Some(tag) = &self.tag {
            write!(f, ":{tag}")?;
        }
        if let Some(digest) = &self.digest {
            write!(f, "@{digest}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEX: &str = "7c9c2aebf01ce96a196fc1a876d9a8ee4c2282e38a9a0a9a1213eca3bd584701";

    #[test]
    fn parses_repository_and_tag() {
        let reference = ImageRef::parse("ubuntu:18.04").expect("parse");
        assert_eq!(reference.registry(), None);
        assert_eq!(reference.repository(), "ubuntu");
        assert_eq!(reference.tag(), Some("18.04"));
        assert_eq!(reference.digest(), None);
        assert_eq!(reference.to_string(), "ubuntu:18.04");
    }

    #[test]
    fn detects_registry_with_dot() {
        let reference = ImageRef::parse("ghcr.io/acme/tool:v1.2").expect("parse");
        assert_eq!(reference.registry(), Some("ghcr.io"));
        assert_eq!(reference.repository(), "acme/tool");
        assert_eq!(reference.tag(), Some("v1.2"));
    }

    #[test]
    fn detects_localhost_registry_with_port() {
        let reference = ImageRef::parse("localhost:5000/app").expect("parse");
        assert_eq!(reference.registry(), Some("localhost:5000"));
        assert_eq!(reference.repository(), "app");
        assert_eq!(reference.tag(), Some("latest"));
    }

    #[test]
    fn plain_path_section_is_part_of_the_repository() {
        let reference = ImageRef::parse("library/ubuntu:18.04").expect("parse");
        assert_eq!(reference.registry(), None);
        assert_eq!(reference.repository(), "library/ubuntu");
    }

    #[test]
    fn bare_repository_canonicalizes_to_latest() {
        let reference = ImageRef::parse("alpine").expect("parse");
        assert_eq!(reference.tag(), Some("latest"));
        assert_eq!(reference.to_string(), "alpine:latest");
        assert_eq!(reference, ImageRef::parse("alpine:latest").expect("parse"));
    }

    #[test]
    fn digest_reference_does_not_gain_a_tag() {
        let raw = format!("ubuntu@sha256:{HEX}");
        let reference = ImageRef::parse(&raw).expect("parse");
        assert_eq!(reference.tag(), None);
        assert_eq!(reference.digest().map(|d| d.hex()), Some(HEX));
        assert_eq!(reference.to_string(), raw);
    }

    #[test]
    fn tag_and_digest_can_coexist() {
        let raw = format!("ghcr.io/acme/tool:v1@sha256:{HEX}");
        let reference = ImageRef::parse(&raw).expect("parse");
        assert_eq!(reference.tag(), Some("v1"));
        assert!(reference.digest().is_some());
        assert_eq!(reference.to_string(), raw);
    }

    #[test]
    fn rejects_malformed_references() {
        for raw in [
            "",
            "Ubuntu:18.04",
            "ubuntu:",
            "ubuntu:a tag",
            "ubuntu@sha256:zz",
            "re po/app",
        ] {
            assert!(ImageRef::parse(raw).is_err(), "{raw:?} should not parse");
        }
    }

    #[test]
    fn canonical_form_round_trips() {
        for raw in ["ubuntu:18.04", "ghcr.io/acme/tool:v1.2", "localhost:5000/app:dev"] {
            let reference = ImageRef::parse(raw).expect("parse");
            assert_eq!(
                ImageRef::parse(&reference.to_string()).expect("reparse"),
                reference
            );
        }
    }

    #[test]
    fn digest_parses_into_parts() {
        let digest = ContentDigest::parse(&format!("sha256:{HEX}")).expect("parse");
        assert_eq!(digest.algorithm(), "sha256");
        assert_eq!(digest.hex(), HEX);
        assert_eq!(digest.to_string(), format!("sha256:{HEX}"));
    }

    #[test]
    fn digest_rejects_short_or_uppercase_hex() {
        assert!(ContentDigest::parse("sha256:abc123").is_err());
        assert!(ContentDigest::parse(&format!("sha256:{}", HEX.to_uppercase())).is_err());
        assert!(ContentDigest::parse("no-colon").is_err());
    }
}
