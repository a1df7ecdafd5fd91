//! View authorization — pure set intersection, no I/O.

use std::collections::HashSet;

use crate::catalog::Video;

/// The wildcard viewer token marking a video as public.
pub const PUBLIC_VIEWER: &str = "all";

/// The identity tokens of one authenticated caller: the principal's own
/// directory object id plus every security group it transitively belongs to.
///
/// Computed fresh per request; never cached across requests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdentityTokens(HashSet<String>);

impl IdentityTokens {
    /// Seed a token set with the caller's own principal id.
    #[must_use]
    pub fn for_principal(principal_id: impl Into<String>) -> Self {
        let mut tokens = HashSet::new();
        tokens.insert(principal_id.into());
        Self(tokens)
    }

    /// Whether `token` is in the set.
    #[must_use]
    pub fn contains(&self, token: &str) -> bool {
        self.0.contains(token)
    }

    /// Number of tokens in the set.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the set is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Extend<String> for IdentityTokens {
    fn extend<I: IntoIterator<Item = String>>(&mut self, iter: I) {
        self.0.extend(iter);
    }
}

impl FromIterator<String> for IdentityTokens {
    fn from_iter<I: IntoIterator<Item = String>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Whether a caller holding `tokens` may view `video`.
///
/// `false` for an absent video. Otherwise true iff the video is public
/// (`"all"` in its viewer set) or its viewer set intersects the caller's
/// tokens. Order-independent; set semantics only.
#[must_use]
pub fn can_view(video: Option<&Video>, tokens: &IdentityTokens) -> bool {
    video.is_some_and(|v| {
        v.viewers
            .iter()
            .any(|viewer| viewer == PUBLIC_VIEWER || tokens.contains(viewer))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn video(viewers: &[&str]) -> Video {
        Video {
            id: "v1".to_string(),
            title: "Video".to_string(),
            locator: "//streaming.example.invalid/v1/manifest".to_string(),
            thumbnail: None,
            viewers: viewers.iter().map(|s| (*s).to_string()).collect(),
            content_key_ids: HashSet::new(),
        }
    }

    fn tokens(ids: &[&str]) -> IdentityTokens {
        ids.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn absent_video_is_never_viewable() {
        assert!(!can_view(None, &tokens(&["u1", "g1"])));
        assert!(!can_view(None, &IdentityTokens::default()));
    }

    #[test]
    fn public_wildcard_matches_any_caller() {
        let v = video(&["all"]);

        assert!(can_view(Some(&v), &tokens(&["u1"])));
        assert!(can_view(Some(&v), &IdentityTokens::default()));
    }

    #[test]
    fn overlapping_viewer_set_grants_access() {
        let v = video(&["g7", "g9"]);

        assert!(can_view(Some(&v), &tokens(&["u1", "g9"])));
    }

    #[test]
    fn disjoint_viewer_set_denies_access() {
        let v = video(&["g9"]);

        assert!(!can_view(Some(&v), &tokens(&["u1"])));
        assert!(!can_view(Some(&v), &IdentityTokens::default()));
    }

    #[test]
    fn empty_viewer_set_denies_everyone() {
        let v = video(&[]);

        assert!(!can_view(Some(&v), &tokens(&["u1", "g1"])));
    }

    #[test]
    fn principal_seed_is_a_member() {
        let t = IdentityTokens::for_principal("u1");

        assert!(t.contains("u1"));
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn extend_deduplicates() {
        let mut t = IdentityTokens::for_principal("u1");
        t.extend(["g1".to_string(), "g1".to_string(), "u1".to_string()]);

        assert_eq!(t.len(), 2);
    }
}
