//! Segment manifest (M3U8 media playlist) handling.
//!
//! The encoder appends to the manifest while recording; retention rewrites
//! it when trimming old segments. Only the tags ffmpeg's segment muxer
//! emits are modeled. The media sequence number advances on every trim so
//! the playlist stays valid for standard streaming players.

use std::path::Path;

use crate::utils::fs::io_error;
use crate::{Error, Result};

/// One segment reference in a manifest.
#[derive(Debug, Clone, PartialEq)]
pub struct ManifestSegment {
    pub duration: f64,
    pub uri: String,
}

/// An M3U8 media playlist.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentManifest {
    pub version: u32,
    pub target_duration: u64,
    pub media_sequence: u64,
    pub segments: Vec<ManifestSegment>,
    pub end_list: bool,
}

impl SegmentManifest {
    pub fn new(target_duration: u64) -> Self {
        Self {
            version: 3,
            target_duration,
            media_sequence: 0,
            segments: Vec::new(),
            end_list: false,
        }
    }

    /// Parse manifest text.
    pub fn parse(contents: &str) -> Result<Self> {
        let mut lines = contents.lines().map(str::trim);
        match lines.next() {
            Some("#EXTM3U") => {}
            _ => return Err(Error::validation("manifest missing #EXTM3U header")),
        }

        let mut manifest = Self::new(0);
        let mut pending_duration: Option<f64> = None;

        for line in lines {
            if line.is_empty() {
                continue;
            }
            if let Some(value) = line.strip_prefix("#EXT-X-VERSION:") {
                manifest.version = value.trim().parse().unwrap_or(3);
            } else if let Some(value) = line.strip_prefix("#EXT-X-TARGETDURATION:") {
                manifest.target_duration = value.trim().parse().unwrap_or(0);
            } else if let Some(value) = line.strip_prefix("#EXT-X-MEDIA-SEQUENCE:") {
                manifest.media_sequence = value.trim().parse().unwrap_or(0);
            } else if let Some(value) = line.strip_prefix("#EXTINF:") {
                let duration = value
                    .split(',')
                    .next()
                    .and_then(|d| d.trim().parse().ok())
                    .unwrap_or(0.0);
                pending_duration = Some(duration);
            } else if line == "#EXT-X-ENDLIST" {
                manifest.end_list = true;
            } else if line.starts_with('#') {
                // Tags we do not rewrite are dropped rather than corrupted.
                continue;
            } else {
                let duration = pending_duration.take().unwrap_or(0.0);
                manifest.segments.push(ManifestSegment {
                    duration,
                    uri: line.to_string(),
                });
            }
        }

        Ok(manifest)
    }

    /// Load a manifest from disk.
    pub async fn load(path: &Path) -> Result<Self> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| io_error("reading manifest", path, e))?;
        Self::parse(&contents)
    }

    /// Render manifest text.
    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str("#EXTM3U\n");
        out.push_str(&format!("#EXT-X-VERSION:{}\n", self.version));
        out.push_str(&format!("#EXT-X-MEDIA-SEQUENCE:{}\n", self.media_sequence));
        out.push_str(&format!("#EXT-X-TARGETDURATION:{}\n", self.target_duration));
        for segment in &self.segments {
            out.push_str(&format!("#EXTINF:{:.6},\n", segment.duration));
            out.push_str(&segment.uri);
            out.push('\n');
        }
        if self.end_list {
            out.push_str("#EXT-X-ENDLIST\n");
        }
        out
    }

    /// Write the manifest atomically (temp file + rename).
    pub async fn save(&self, path: &Path) -> Result<()> {
        let tmp = path.with_extension("m3u8.tmp");
        tokio::fs::write(&tmp, self.render())
            .await
            .map_err(|e| io_error("writing manifest", &tmp, e))?;
        tokio::fs::rename(&tmp, path)
            .await
            .map_err(|e| io_error("replacing manifest", path, e))?;
        Ok(())
    }

    pub fn push(&mut self, duration: f64, uri: impl Into<String>) {
        self.segments.push(ManifestSegment {
            duration,
            uri: uri.into(),
        });
    }

    /// Drop the `n` oldest segments, returning their URIs. The media
    /// sequence number advances by the number removed so players do not see
    /// the playlist jump backwards.
    pub fn trim_oldest(&mut self, n: usize) -> Vec<String> {
        let n = n.min(self.segments.len());
        let removed: Vec<String> = self.segments.drain(..n).map(|s| s.uri).collect();
        self.media_sequence += removed.len() as u64;
        removed
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// The shape ffmpeg's segment muxer writes.
    const FFMPEG_STYLE: &str = "#EXTM3U\n\
        #EXT-X-VERSION:3\n\
        #EXT-X-MEDIA-SEQUENCE:0\n\
        #EXT-X-ALLOW-CACHE:YES\n\
        #EXT-X-TARGETDURATION:60\n\
        #EXTINF:60.000000,\n\
        seg7_20260803_090000.mp4\n\
        #EXTINF:60.000000,\n\
        seg7_20260803_090100.mp4\n\
        #EXTINF:42.500000,\n\
        seg7_20260803_090200.mp4\n\
        #EXT-X-ENDLIST\n";

    #[test]
    fn test_parse_ffmpeg_output() {
        let manifest = SegmentManifest::parse(FFMPEG_STYLE).unwrap();
        assert_eq!(manifest.len(), 3);
        assert_eq!(manifest.target_duration, 60);
        assert_eq!(manifest.media_sequence, 0);
        assert!(manifest.end_list);
        assert_eq!(manifest.segments[0].uri, "seg7_20260803_090000.mp4");
        assert_eq!(manifest.segments[2].duration, 42.5);
    }

    #[test]
    fn test_parse_rejects_non_manifest() {
        assert!(SegmentManifest::parse("not a manifest").is_err());
    }

    #[test]
    fn test_trim_advances_media_sequence() {
        let mut manifest = SegmentManifest::parse(FFMPEG_STYLE).unwrap();
        let removed = manifest.trim_oldest(2);
        assert_eq!(
            removed,
            vec!["seg7_20260803_090000.mp4", "seg7_20260803_090100.mp4"]
        );
        assert_eq!(manifest.len(), 1);
        assert_eq!(manifest.media_sequence, 2);
    }

    #[test]
    fn test_trim_more_than_present() {
        let mut manifest = SegmentManifest::parse(FFMPEG_STYLE).unwrap();
        let removed = manifest.trim_oldest(10);
        assert_eq!(removed.len(), 3);
        assert!(manifest.is_empty());
    }

    #[test]
    fn test_render_parse_roundtrip() {
        let mut manifest = SegmentManifest::new(60);
        manifest.push(60.0, "a.mp4");
        manifest.push(31.25, "b.mp4");
        manifest.end_list = true;

        let reparsed = SegmentManifest::parse(&manifest.render()).unwrap();
        assert_eq!(reparsed, manifest);
    }

    #[test]
    fn test_rendered_manifest_is_player_parseable() {
        let mut manifest = SegmentManifest::parse(FFMPEG_STYLE).unwrap();
        manifest.trim_oldest(1);
        let rendered = manifest.render();

        match m3u8_rs::parse_playlist_res(rendered.as_bytes()) {
            Ok(m3u8_rs::Playlist::MediaPlaylist(playlist)) => {
                assert_eq!(playlist.segments.len(), 2);
                assert_eq!(playlist.media_sequence, 1);
            }
            other => panic!("expected a media playlist, got {other:?}"),
        }
    }
}
