//! Interface to the manifest parser.
//!
//! The coordinator never parses playlists itself. It asks a
//! [`ManifestSource`] for the root, the primary media playlists and each side
//! track in turn, and reacts to the resulting [`DiscoveryEvent`]s.

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Result;

/// One addressable chunk of media referenced by a sub-manifest.
#[derive(Debug, Clone, PartialEq)]
pub struct Fragment {
    pub url: String,
    /// Start of the fragment on the presentation timeline, in seconds.
    pub playback_offset: f64,
}

impl Fragment {
    pub fn new(url: impl Into<String>, playback_offset: f64) -> Self {
        Self {
            url: url.into(),
            playback_offset,
        }
    }
}

/// A playlist listing the fragments of one variant, rendition or side track.
#[derive(Debug, Clone, PartialEq)]
pub struct SubManifest {
    pub url: String,
    pub raw: Bytes,
    pub fragments: Vec<Fragment>,
}

/// An alternate, independently-manifested stream such as subtitles.
#[derive(Debug, Clone, PartialEq)]
pub struct SideTrack {
    pub name: String,
    pub language: Option<String>,
    pub url: String,
}

/// The manifest a download starts from.
#[derive(Debug, Clone, PartialEq)]
pub struct RootManifest {
    pub url: String,
    pub raw: Bytes,
    /// Playlists making up the primary presentation (video and audio).
    pub primary: Vec<String>,
    pub side_tracks: Vec<SideTrack>,
}

/// Which discovery channel a sub-manifest arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackRef {
    /// Index into [`RootManifest::primary`].
    Primary(usize),
    /// Index into [`RootManifest::side_tracks`].
    Side(usize),
}

/// Events the coordinator's state machine is driven by.
#[derive(Debug, Clone)]
pub enum DiscoveryEvent {
    RootManifestReady { url: String, raw: Bytes },
    SubManifestReady { track: TrackRef, manifest: SubManifest },
    SideTrackListReady { tracks: Vec<SideTrack> },
}

/// Parser collaborator.
#[async_trait]
pub trait ManifestSource: Send + Sync {
    /// Load and parse the root manifest at `url`.
    async fn load_root(&self, url: &str) -> Result<RootManifest>;

    /// Load every playlist of the primary presentation.
    async fn load_primary(&self, root: &RootManifest) -> Result<Vec<SubManifest>>;

    /// Load the playlist of side track `index`.
    async fn load_side_track(&self, root: &RootManifest, index: usize) -> Result<SubManifest>;
}
