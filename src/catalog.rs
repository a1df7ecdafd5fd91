//! Video catalog — loaded once at startup, immutable for the process lifetime.
//!
//! The index file is a JSON array of video records. The serving process never
//! writes it; [`append_to_index`] exists for the offline `catalog add`
//! provisioning flow only.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::authz::{self, IdentityTokens};
use crate::{Error, Result};

/// A catalog entry
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Video {
    /// Opaque identifier, unique within the catalog
    pub id: String,
    /// Display title
    pub title: String,
    /// Streaming manifest URI
    pub locator: String,
    /// Thumbnail image URI
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail: Option<String>,
    /// Identity tokens permitted to view; the literal `"all"` means public
    pub viewers: HashSet<String>,
    /// DRM content key identifiers associated with this video
    pub content_key_ids: HashSet<String>,
}

impl Video {
    /// Whether `content_key_id` belongs to this video's protected streams.
    #[must_use]
    pub fn owns_content_key(&self, content_key_id: &str) -> bool {
        self.content_key_ids.contains(content_key_id)
    }
}

/// The immutable video catalog
#[derive(Debug, Default)]
pub struct Catalog {
    videos: Vec<Video>,
    by_id: HashMap<String, usize>,
}

impl Catalog {
    /// Build a catalog from records, enforcing id uniqueness.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Catalog`] on a duplicate id.
    pub fn from_videos(videos: Vec<Video>) -> Result<Self> {
        let mut by_id = HashMap::with_capacity(videos.len());
        for (index, video) in videos.iter().enumerate() {
            if by_id.insert(video.id.clone(), index).is_some() {
                return Err(Error::Catalog(format!("duplicate video id '{}'", video.id)));
            }
        }
        Ok(Self { videos, by_id })
    }

    /// Load the catalog from a JSON index file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, is not a JSON array of
    /// video records, or contains duplicate ids.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|e| Error::Catalog(format!("cannot read {}: {e}", path.display())))?;
        let videos: Vec<Video> = serde_json::from_str(&raw)
            .map_err(|e| Error::Catalog(format!("cannot parse {}: {e}", path.display())))?;
        Self::from_videos(videos)
    }

    /// Look up a video by id.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&Video> {
        self.by_id.get(id).map(|&index| &self.videos[index])
    }

    /// All videos, in index-file order.
    #[must_use]
    pub fn all(&self) -> &[Video] {
        &self.videos
    }

    /// The videos a caller with `tokens` may view.
    pub fn visible_for<'a>(
        &'a self,
        tokens: &'a IdentityTokens,
    ) -> impl Iterator<Item = &'a Video> {
        self.videos
            .iter()
            .filter(move |video| authz::can_view(Some(video), tokens))
    }

    /// Number of catalog entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.videos.len()
    }

    /// Whether the catalog is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.videos.is_empty()
    }
}

/// Append a video to an index file, creating the file if absent.
///
/// Read-modify-write: existing entries are preserved, the output is
/// pretty-printed. Offline provisioning only; the serving process loads the
/// index once and never watches it for changes.
///
/// # Errors
///
/// Returns an error if the existing file cannot be parsed, the new id
/// collides with an existing one, or the file cannot be written.
pub fn append_to_index(path: &Path, video: Video) -> Result<()> {
    let mut videos: Vec<Video> = match fs::read_to_string(path) {
        Ok(raw) if !raw.trim().is_empty() => serde_json::from_str(&raw)
            .map_err(|e| Error::Catalog(format!("cannot parse {}: {e}", path.display())))?,
        Ok(_) => Vec::new(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
        Err(e) => {
            return Err(Error::Catalog(format!(
                "cannot read {}: {e}",
                path.display()
            )));
        }
    };

    if videos.iter().any(|existing| existing.id == video.id) {
        return Err(Error::Catalog(format!(
            "video id '{}' already present in {}",
            video.id,
            path.display()
        )));
    }

    videos.push(video);
    fs::write(path, serde_json::to_string_pretty(&videos)?)?;
    Ok(())
}
