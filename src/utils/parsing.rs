use log::debug;

use crate::error::{Result, StreamError};

/// Playlist wrappers that stations publish instead of a direct stream URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaylistKind {
    Pls,
    M3u,
}

impl PlaylistKind {
    /// Classify by path extension, ignoring any query string.
    pub fn from_url(url: &str) -> Option<Self> {
        let path = url.split(['?', '#']).next().unwrap_or(url).to_ascii_lowercase();
        if path.ends_with(".pls") {
            Some(Self::Pls)
        } else if path.ends_with(".m3u") || path.ends_with(".m3u8") {
            Some(Self::M3u)
        } else {
            None
        }
    }
}

/// First `FileN=` entry of a .pls playlist
pub fn parse_pls_content(content: &str) -> Option<String> {
    content
        .lines()
        .find_map(|line| {
            let (key, value) = line.split_once('=')?;
            let key = key.trim();
            let index = key
                .get(..4)
                .filter(|prefix| prefix.eq_ignore_ascii_case("file"))
                .and(key.get(4..))?;
            (!index.is_empty() && index.chars().all(|c| c.is_ascii_digit()))
                .then(|| value.trim().to_string())
        })
        .filter(|url| !url.is_empty())
}

/// First non-comment line of an .m3u/.m3u8 playlist
pub fn parse_m3u_content(content: &str) -> Option<String> {
    content
        .lines()
        .map(|line| line.trim().trim_start_matches('\u{feff}'))
        .find(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
}

/// Resolve URL to actual stream URL (fetches and parses playlist files)
pub async fn resolve_stream_url(client: &reqwest::Client, url: &str) -> Result<String> {
    let Some(kind) = PlaylistKind::from_url(url) else {
        return Ok(url.to_string());
    };

    debug!("Resolving {kind:?} playlist {url}");
    let content = client
        .get(url)
        .send()
        .await?
        .error_for_status()?
        .text()
        .await?;

    let resolved = match kind {
        PlaylistKind::Pls => parse_pls_content(&content),
        PlaylistKind::M3u => parse_m3u_content(&content),
    };
    match resolved {
        Some(stream) => {
            debug!("Playlist {url} resolved to {stream}");
            Ok(stream)
        }
        None => Err(StreamError::connection(format!("no stream URL found in playlist {url}"))),
    }
}
