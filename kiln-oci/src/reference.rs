//! Store-level image references.
//!
//! The engine addresses images in three ways: by raw ID (`@<hex>` or a bare
//! hex string), by tagged name, or by name plus manifest digest. All three
//! are content-addressed once resolved against the store.

use std::fmt;

use crate::{Digest, Error, Result};

/// A reference into the image store.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ImageRef {
    /// Direct image ID (`@0abc…` or 64 hex digits).
    Id(String),
    /// `name[:tag]`; the tag defaults to `latest`.
    Tagged {
        /// Repository name, possibly with a registry prefix.
        name: String,
        /// Tag.
        tag: String,
    },
    /// `name@algorithm:hex`.
    Digested {
        /// Repository name, possibly with a registry prefix.
        name: String,
        /// Manifest digest.
        digest: Digest,
    },
}

impl ImageRef {
    /// Parses a reference string.
    pub fn parse(s: &str) -> Result<Self> {
        if s.is_empty() {
            return Err(Error::InvalidReference(s.into()));
        }
        if let Some(id) = s.strip_prefix('@') {
            return Self::id_from_hex(id, s);
        }
        if let Some((name, digest)) = s.split_once('@') {
            if name.is_empty() {
                return Err(Error::InvalidReference(s.into()));
            }
            return Ok(Self::Digested {
                name: name.to_owned(),
                digest: Digest::new(digest)?,
            });
        }
        if s.len() == 64 && s.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Ok(Self::Id(s.to_owned()));
        }
        // Split the tag on the last ':' that comes after the last '/', so
        // registry ports (localhost:5000/app) survive.
        let slash = s.rfind('/').map_or(0, |at| at + 1);
        match s[slash..].rfind(':') {
            Some(colon) => {
                let at = slash + colon;
                Ok(Self::Tagged {
                    name: s[..at].to_owned(),
                    tag: s[at + 1..].to_owned(),
                })
            }
            None => Ok(Self::Tagged {
                name: s.to_owned(),
                tag: "latest".to_owned(),
            }),
        }
    }

    fn id_from_hex(id: &str, original: &str) -> Result<Self> {
        if id.is_empty() || !id.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(Error::InvalidReference(original.into()));
        }
        Ok(Self::Id(id.to_owned()))
    }

    /// The repository name, if this reference has one.
    pub fn name(&self) -> Option<&str> {
        match self {
            Self::Id(_) => None,
            Self::Tagged { name, .. } | Self::Digested { name, .. } => Some(name),
        }
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Id(id) => write!(f, "@{id}"),
            Self::Tagged { name, tag } => write!(f, "{name}:{tag}"),
            Self::Digested { name, digest } => write!(f, "{name}@{digest}"),
        }
    }
}
