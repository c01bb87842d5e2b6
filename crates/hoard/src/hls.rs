//! HLS implementation of [`ManifestSource`] on top of `m3u8-rs`.
//!
//! The primary presentation is one selected variant plus the audio rendition
//! its `AUDIO` group points at; every `SUBTITLES` rendition with a URI is a
//! side track.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use m3u8_rs::{AlternativeMedia, AlternativeMediaType, MasterPlaylist, MediaPlaylist, Playlist};
use tracing::{debug, trace};
use url::Url;

use crate::error::{CacheError, Result};
use crate::fetcher::Fetcher;
use crate::manifest::{Fragment, ManifestSource, RootManifest, SideTrack, SubManifest};

/// Which variant of a master playlist to cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum VariantSelection {
    #[default]
    HighestBandwidth,
    LowestBandwidth,
    /// The first variant listed.
    First,
}

pub struct HlsManifestSource {
    fetcher: Arc<dyn Fetcher>,
    selection: VariantSelection,
}

impl HlsManifestSource {
    pub fn new(fetcher: Arc<dyn Fetcher>) -> Self {
        Self {
            fetcher,
            selection: VariantSelection::default(),
        }
    }

    pub fn with_selection(mut self, selection: VariantSelection) -> Self {
        self.selection = selection;
        self
    }

    async fn load_media(&self, url: &str) -> Result<SubManifest> {
        let raw = self.fetcher.fetch(url).await?;
        media_from_bytes(url, raw)
    }

    fn primary_urls(&self, base: &Url, master: &MasterPlaylist) -> Result<Vec<String>> {
        let mut variants = master.variants.iter().filter(|v| !v.is_i_frame);
        let variant = match self.selection {
            VariantSelection::HighestBandwidth => variants.max_by_key(|v| v.bandwidth),
            VariantSelection::LowestBandwidth => variants.min_by_key(|v| v.bandwidth),
            VariantSelection::First => variants.next(),
        }
        .ok_or_else(|| CacheError::manifest_discovery(base.as_str(), "master playlist has no variants"))?;

        let mut urls = vec![resolve(base, &variant.uri)?];

        if let Some(group) = variant.audio.as_deref() {
            let renditions: Vec<&AlternativeMedia> = master
                .alternatives
                .iter()
                .filter(|alt| matches!(alt.media_type, AlternativeMediaType::Audio))
                .filter(|alt| alt.group_id == group && alt.uri.is_some())
                .collect();
            let chosen = renditions
                .iter()
                .find(|alt| alt.default)
                .or_else(|| renditions.first());
            if let Some(uri) = chosen.and_then(|alt| alt.uri.as_deref()) {
                let audio = resolve(base, uri)?;
                if !urls.contains(&audio) {
                    urls.push(audio);
                }
            }
        }

        debug!(
            bandwidth = variant.bandwidth,
            playlists = urls.len(),
            "Selected primary presentation"
        );
        Ok(urls)
    }
}

fn resolve(base: &Url, uri: &str) -> Result<String> {
    base.join(uri)
        .map(|u| u.to_string())
        .map_err(|e| CacheError::manifest_discovery(base.as_str(), format!("bad URI `{uri}`: {e}")))
}

fn parse(url: &str, raw: &[u8]) -> Result<Playlist> {
    m3u8_rs::parse_playlist_res(raw)
        .map_err(|e| CacheError::manifest_discovery(url, format!("unparseable playlist: {e}")))
}

fn parse_base(url: &str) -> Result<Url> {
    Url::parse(url).map_err(|e| CacheError::invalid_url(url, e.to_string()))
}

/// `EXT-X-MAP` placed before the first segment ends up in `unknown_tags`.
fn playlist_level_map_uri(playlist: &MediaPlaylist) -> Option<String> {
    let tag = playlist
        .unknown_tags
        .iter()
        .rev()
        .find(|t| t.tag == "X-MAP")?;
    let rest = tag.rest.as_deref()?;
    let start = rest.find("URI=\"")? + "URI=\"".len();
    let len = rest[start..].find('"')?;
    Some(rest[start..start + len].to_string())
}

fn fragments(base: &Url, playlist: &MediaPlaylist) -> Result<Vec<Fragment>> {
    let mut out = Vec::with_capacity(playlist.segments.len() + 1);
    let mut offset = 0.0f64;
    let mut last_map: Option<String> = playlist_level_map_uri(playlist)
        .map(|uri| resolve(base, &uri))
        .transpose()?;

    if let Some(map) = &last_map {
        out.push(Fragment::new(map.clone(), 0.0));
    }

    for segment in &playlist.segments {
        if let Some(map) = &segment.map {
            let map_url = resolve(base, &map.uri)?;
            if last_map.as_ref() != Some(&map_url) {
                out.push(Fragment::new(map_url.clone(), offset));
                last_map = Some(map_url);
            }
        }
        out.push(Fragment::new(resolve(base, &segment.uri)?, offset));
        offset += f64::from(segment.duration);
    }

    trace!(fragments = out.len(), duration = offset, "Listed fragments");
    Ok(out)
}

fn media_from_bytes(url: &str, raw: Bytes) -> Result<SubManifest> {
    let base = parse_base(url)?;
    match parse(url, &raw)? {
        Playlist::MediaPlaylist(playlist) => Ok(SubManifest {
            url: url.to_string(),
            fragments: fragments(&base, &playlist)?,
            raw,
        }),
        Playlist::MasterPlaylist(_) => Err(CacheError::manifest_discovery(
            url,
            "expected a media playlist, found a master playlist",
        )),
    }
}

#[async_trait]
impl ManifestSource for HlsManifestSource {
    async fn load_root(&self, url: &str) -> Result<RootManifest> {
        let base = parse_base(url)?;
        let raw = self.fetcher.fetch(url).await?;

        match parse(url, &raw)? {
            Playlist::MasterPlaylist(master) => {
                let primary = self.primary_urls(&base, &master)?;
                let side_tracks = master
                    .alternatives
                    .iter()
                    .filter(|alt| matches!(alt.media_type, AlternativeMediaType::Subtitles))
                    .filter_map(|alt| {
                        let uri = alt.uri.as_deref()?;
                        Some(resolve(&base, uri).map(|url| SideTrack {
                            name: alt.name.clone(),
                            language: alt.language.clone(),
                            url,
                        }))
                    })
                    .collect::<Result<Vec<_>>>()?;
                Ok(RootManifest {
                    url: url.to_string(),
                    raw,
                    primary,
                    side_tracks,
                })
            }
            // A bare media playlist is its own primary presentation.
            Playlist::MediaPlaylist(_) => Ok(RootManifest {
                url: url.to_string(),
                raw,
                primary: vec![url.to_string()],
                side_tracks: Vec::new(),
            }),
        }
    }

    async fn load_primary(&self, root: &RootManifest) -> Result<Vec<SubManifest>> {
        let mut manifests = Vec::with_capacity(root.primary.len());
        for url in &root.primary {
            let manifest = if *url == root.url {
                media_from_bytes(url, root.raw.clone())?
            } else {
                self.load_media(url).await?
            };
            manifests.push(manifest);
        }
        Ok(manifests)
    }

    async fn load_side_track(&self, root: &RootManifest, index: usize) -> Result<SubManifest> {
        let track = root.side_tracks.get(index).ok_or_else(|| {
            CacheError::manifest_discovery(&root.url, format!("no side track at index {index}"))
        })?;
        self.load_media(&track.url).await
    }
}
