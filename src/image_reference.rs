use std::fmt;
use thiserror::Error;

static DANGLING_REFERENCES: [&str; 2] = ["<none>:<none>", "<none>@<none>"];
static DIGEST_PREFIX: &str = "sha256:";

/// A container image reference as written in a pod template or reported by Docker,
/// e.g. `redis:7.2`, `registry.local/app@sha256:...` or a bare `sha256:...` image id.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ImageReference(String);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("image reference is empty")]
    Empty,
    #[error("dangling image reference: {0}")]
    Dangling(String),
    #[error("invalid image format: {0}")]
    InvalidFormat(String),
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl ImageReference {
    pub fn parse(s: &str) -> Result<Self, ParseError> {
        if s.is_empty() {
            return Err(ParseError::Empty);
        }
        if DANGLING_REFERENCES.contains(&s) {
            return Err(ParseError::Dangling(s.to_string()));
        }
        if s.chars().any(char::is_whitespace) {
            return Err(ParseError::InvalidFormat(s.to_string()));
        }
        Ok(Self(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Everything before the first `:`. A digest pin keeps its `@sha256` suffix
    /// (`app@sha256:...` has base name `app@sha256`), so it never matches a tag.
    pub fn base_name(&self) -> &str {
        let end = self.0.find(':').unwrap_or(self.0.len());
        &self.0[..end]
    }

    /// Same logical image, different build.
    pub fn is_other_build_of(&self, other: &ImageReference) -> bool {
        self.base_name() == other.base_name() && self.0 != other.0
    }

    /// Bare content identifier as Docker reports it for image ids.
    pub fn is_digest(&self) -> bool {
        self.0
            .strip_prefix(DIGEST_PREFIX)
            .is_some_and(|hex| !hex.is_empty() && hex.chars().all(|c| c.is_ascii_hexdigit()))
    }
}
