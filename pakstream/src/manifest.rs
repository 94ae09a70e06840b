//! Package identity and manifest data model.
//!
//! A [`PakId`] names one immutable pak container on the content server. A
//! [`PakManifest`] is supplied by the pak-format collaborator at registration
//! time and carries everything the streaming core needs to address the
//! package: its total byte length, the SHA-256 digest of its whole body, and
//! the map from logical asset paths to byte ranges. The core never interprets
//! asset paths beyond looking them up in that map.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::range::ChunkRange;

/// Errors raised while building or validating manifest data.
#[derive(Debug, Error)]
pub enum ManifestError {
    /// Package name is empty or would escape the cache/remote namespace.
    #[error("invalid pak name {name:?}: {reason}")]
    InvalidPakName {
        /// Offending name.
        name: String,
        /// Why it was rejected.
        reason: &'static str,
    },

    /// Digest is not a 64-character lowercase hex SHA-256.
    #[error("invalid content digest {digest:?}")]
    InvalidDigest {
        /// Offending digest string.
        digest: String,
    },

    /// An asset entry points outside the package body.
    #[error("asset {path:?} range [{offset}, {end}) exceeds package length {total_length}")]
    AssetOutOfBounds {
        /// Asset path as listed in the manifest.
        path: String,
        /// Asset start offset.
        offset: u64,
        /// One past the asset's last byte.
        end: u64,
        /// Declared package length.
        total_length: u64,
    },

    /// Manifest JSON could not be decoded.
    #[error("manifest decode failed: {0}")]
    Decode(#[from] serde_json::Error),
}

// ============================================================================
// PakId
// ============================================================================

/// Stable identifier of a pak container.
///
/// Names are plain file stems: they become `{name}.pak` on the remote store
/// and feed into local cache file names, so the charset is restricted to
/// `[A-Za-z0-9._-]` and relative path components are rejected outright.
///
/// # Example
///
/// ```
/// use pakstream::manifest::PakId;
///
/// let id = PakId::new("island_textures").unwrap();
/// assert_eq!(id.as_str(), "island_textures");
/// assert_eq!(id.pak_file_name(), "island_textures.pak");
///
/// assert!(PakId::new("../escape").is_err());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PakId(String);

impl PakId {
    /// Creates a validated package identifier.
    pub fn new(name: impl Into<String>) -> Result<Self, ManifestError> {
        let name = name.into();
        let safe_charset = |b: u8| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-');
        let reason = if name.is_empty() {
            Some("name is empty")
        } else if name == "." || name == ".." {
            Some("name is a relative path component")
        } else if !name.bytes().all(safe_charset) {
            Some("name contains characters outside [A-Za-z0-9._-]")
        } else {
            None
        };
        match reason {
            Some(reason) => Err(ManifestError::InvalidPakName { name, reason }),
            None => Ok(Self(name)),
        }
    }

    /// The raw package name.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// File name of the pak container on the remote store.
    pub fn pak_file_name(&self) -> String {
        format!("{}.pak", self.0)
    }

    /// File name of the package manifest on the remote store.
    pub fn manifest_file_name(&self) -> String {
        format!("{}.manifest.json", self.0)
    }
}

impl fmt::Display for PakId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for PakId {
    type Error = ManifestError;

    fn try_from(name: String) -> Result<Self, Self::Error> {
        Self::new(name)
    }
}

impl From<PakId> for String {
    fn from(id: PakId) -> Self {
        id.0
    }
}

// ============================================================================
// Manifest
// ============================================================================

/// One logical asset inside a pak container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetEntry {
    /// Logical path of the asset inside the package (opaque to the core).
    pub path: String,
    /// Byte offset of the asset within the package.
    pub offset: u64,
    /// Length of the asset in bytes.
    pub length: u64,
}

impl AssetEntry {
    /// The byte range this asset occupies.
    pub fn range(&self) -> ChunkRange {
        ChunkRange::at(self.offset, self.length)
    }
}

/// Describes one pak container: identity, size, digest, and asset map.
///
/// Immutable once registered; only the package's residency state evolves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PakManifest {
    /// Package identifier.
    pub name: PakId,
    /// Total length of the pak body in bytes.
    pub total_length: u64,
    /// Lowercase hex SHA-256 of the whole pak body.
    pub digest: String,
    /// Logical asset paths and the byte ranges they occupy.
    #[serde(default)]
    pub assets: Vec<AssetEntry>,
}

impl PakManifest {
    /// Decodes a manifest from JSON and validates it.
    pub fn from_json(bytes: &[u8]) -> Result<Self, ManifestError> {
        let manifest: PakManifest = serde_json::from_slice(bytes)?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Checks digest shape and asset bounds.
    ///
    /// # Errors
    ///
    /// Returns [`ManifestError::InvalidDigest`] unless the digest is a
    /// 64-character lowercase hex string, and
    /// [`ManifestError::AssetOutOfBounds`] for any asset whose range pokes
    /// past `total_length`.
    pub fn validate(&self) -> Result<(), ManifestError> {
        let digest_ok = self.digest.len() == 64
            && self
                .digest
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        if !digest_ok {
            return Err(ManifestError::InvalidDigest {
                digest: self.digest.clone(),
            });
        }
        for asset in &self.assets {
            let end = asset.offset.saturating_add(asset.length);
            if end > self.total_length || asset.offset.checked_add(asset.length).is_none() {
                return Err(ManifestError::AssetOutOfBounds {
                    path: asset.path.clone(),
                    offset: asset.offset,
                    end,
                    total_length: self.total_length,
                });
            }
        }
        Ok(())
    }

    /// Resolves a logical asset path to its byte range.
    ///
    /// # Example
    ///
    /// ```
    /// use pakstream::manifest::{AssetEntry, PakId, PakManifest};
    ///
    /// let manifest = PakManifest {
    ///     name: PakId::new("core").unwrap(),
    ///     total_length: 1000,
    ///     digest: "a".repeat(64),
    ///     assets: vec![AssetEntry { path: "maps/hub.umap".into(), offset: 128, length: 256 }],
    /// };
    ///
    /// let range = manifest.asset_range("maps/hub.umap").unwrap();
    /// assert_eq!((range.start, range.end), (128, 384));
    /// assert!(manifest.asset_range("missing").is_none());
    /// ```
    pub fn asset_range(&self, path: &str) -> Option<ChunkRange> {
        self.assets
            .iter()
            .find(|asset| asset.path == path)
            .map(AssetEntry::range)
    }

    /// The whole package body as a range.
    pub fn body_range(&self) -> ChunkRange {
        ChunkRange::new(0, self.total_length)
    }
}

impl fmt::Display for PakManifest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({} bytes, {} assets)",
            self.name,
            self.total_length,
            self.assets.len()
        )
    }
}
