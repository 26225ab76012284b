use anyhow::{Context, Result};
use std::time::Duration;
use thiserror::Error;

use crate::constants::RESTRICTED_DOMAINS;
use crate::protocol::{SourceKind, VideoReference};

/// A source we refuse to play. Rendered as a permanent explanatory state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{domain} is a subscription streaming platform and cannot be watched together")]
pub struct UnsupportedSource {
    pub url: String,
    pub domain: &'static str,
}

/// Which provider a URL points at
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Provider {
    YouTube { video_id: String },
    GoogleDrive { file_id: String },
    Streamable { id: String },
    Direct,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassifiedSource {
    pub provider: Provider,
    pub kind: SourceKind,
}

/// Restricted-domain check. Runs before anything else looks at the URL.
pub fn restricted_domain(url: &str) -> Option<&'static str> {
    let lowered = url.to_ascii_lowercase();
    RESTRICTED_DOMAINS
        .iter()
        .copied()
        .find(|domain| lowered.contains(domain))
}

pub fn reject_restricted(url: &str) -> Result<(), UnsupportedSource> {
    match restricted_domain(url) {
        Some(domain) => Err(UnsupportedSource {
            url: url.to_string(),
            domain,
        }),
        None => Ok(()),
    }
}

/// Work out the provider and capability kind of a URL
pub fn classify(url: &str) -> Result<ClassifiedSource, UnsupportedSource> {
    reject_restricted(url)?;

    if let Some(video_id) = extract_video_id(url) {
        return Ok(ClassifiedSource {
            provider: Provider::YouTube { video_id },
            kind: SourceKind::EmbedApi,
        });
    }
    if let Some(file_id) = extract_drive_id(url) {
        return Ok(ClassifiedSource {
            provider: Provider::GoogleDrive { file_id },
            kind: SourceKind::NoControl,
        });
    }
    if let Some(id) = extract_streamable_id(url) {
        return Ok(ClassifiedSource {
            provider: Provider::Streamable { id },
            kind: SourceKind::FullControl,
        });
    }
    Ok(ClassifiedSource {
        provider: Provider::Direct,
        kind: SourceKind::FullControl,
    })
}

/// Turn a pasted URL into a playable reference. Streamable pages are resolved
/// to their direct MP4 so every participant loads the same file. Drive files
/// become the preview embed, or with `drive_direct` the raw download stream,
/// which a media element can control.
pub async fn prepare(
    url: &str,
    http: &reqwest::Client,
    drive_direct: bool,
) -> crate::error::SyncResult<VideoReference> {
    let trimmed = url.trim();
    let classified = classify(trimmed)?;
    match classified.provider {
        Provider::Streamable { id } => {
            let direct = resolve_streamable(http, &id)
                .await?
                .ok_or_else(|| anyhow::anyhow!("No MP4 found on Streamable page {id}"))?;
            Ok(VideoReference::new(direct, SourceKind::FullControl))
        }
        Provider::GoogleDrive { file_id } if drive_direct => Ok(VideoReference::new(
            drive_direct_url(&file_id),
            SourceKind::FullControl,
        )),
        Provider::GoogleDrive { file_id } => Ok(VideoReference::new(
            drive_preview_url(&file_id),
            SourceKind::NoControl,
        )),
        _ => Ok(VideoReference::new(trimmed, classified.kind)),
    }
}

/// Check if a URL is a YouTube URL
pub fn is_youtube_url(url: &str) -> bool {
    url.contains("youtube.com/watch")
        || url.contains("youtu.be/")
        || url.contains("youtube.com/shorts/")
        || url.contains("youtube.com/live/")
        || url.contains("youtube.com/embed/")
}

/// Extract the 11-character video ID from a YouTube URL
pub fn extract_video_id(url: &str) -> Option<String> {
    if !is_youtube_url(url) {
        return None;
    }

    let candidate = if let Some(rest) = url.split("youtu.be/").nth(1) {
        Some(rest)
    } else if url.contains("youtube.com/watch") {
        url.split('?').nth(1).and_then(|query| {
            query
                .split('&')
                .find_map(|param| param.strip_prefix("v="))
        })
    } else {
        ["/shorts/", "/live/", "/embed/"]
            .iter()
            .find_map(|marker| url.split(marker).nth(1))
    }?;

    let id = candidate
        .split(&['?', '&', '/', '#'][..])
        .next()
        .unwrap_or(candidate);
    (id.len() == 11).then(|| id.to_string())
}

/// Extract a Google Drive file id from share/preview/open links
pub fn extract_drive_id(url: &str) -> Option<String> {
    if !url.contains("drive.google.com") {
        return None;
    }
    let rest = ["/file/d/", "/d/", "id="]
        .iter()
        .find_map(|marker| url.split(marker).nth(1))?;
    let id: String = rest
        .chars()
        .take_while(|ch| ch.is_ascii_alphanumeric() || *ch == '_' || *ch == '-')
        .collect();
    (!id.is_empty()).then_some(id)
}

/// Preview iframe for a Drive file
pub fn drive_preview_url(file_id: &str) -> String {
    format!("https://drive.google.com/file/d/{file_id}/preview")
}

/// Raw download link; playable by a media element when the file is small
/// enough for Drive to serve it directly.
pub fn drive_direct_url(file_id: &str) -> String {
    format!("https://drive.google.com/uc?export=download&id={file_id}")
}

pub fn extract_streamable_id(url: &str) -> Option<String> {
    let rest = url.split("streamable.com/").nth(1)?;
    let id: String = rest
        .chars()
        .take_while(|ch| ch.is_ascii_alphanumeric())
        .collect();
    (!id.is_empty()).then_some(id)
}

/// Find the MP4 location in a Streamable page
pub fn extract_streamable_mp4(html: &str) -> Option<String> {
    const OG_MARKER: &str = r#"<meta property="og:video:url" content=""#;
    if let Some(rest) = html.split(OG_MARKER).nth(1) {
        if let Some(url) = rest.split('"').next().filter(|url| !url.is_empty()) {
            return Some(url.to_string());
        }
    }

    // <source src="https://..." type="video/mp4">
    let (before, _) = html.split_once(r#"" type="video/mp4""#)?;
    let start = before.rfind(r#"src=""#)? + r#"src=""#.len();
    let url = &before[start..];
    (!url.is_empty()).then(|| url.to_string())
}

pub async fn resolve_streamable(http: &reqwest::Client, id: &str) -> Result<Option<String>> {
    let page = format!("https://streamable.com/{id}");
    let response = http
        .get(&page)
        .timeout(Duration::from_secs(10))
        .send()
        .await
        .context("Failed to fetch Streamable page")?;

    if !response.status().is_success() {
        anyhow::bail!("Streamable returned status: {}", response.status());
    }

    let html = response
        .text()
        .await
        .context("Failed to read Streamable page")?;
    let direct = extract_streamable_mp4(&html);
    if direct.is_none() {
        tracing::warn!("No video url found on Streamable page {}", page);
    }
    Ok(direct)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_youtube_url() {
        assert!(is_youtube_url("https://www.youtube.com/watch?v=dQw4w9WgXcQ"));
        assert!(is_youtube_url("https://youtu.be/dQw4w9WgXcQ"));
        assert!(is_youtube_url("https://youtube.com/shorts/abc123"));
        assert!(!is_youtube_url("https://example.com/video.mp4"));
    }

    #[test]
    fn test_extract_video_id() {
        assert_eq!(
            extract_video_id("https://www.youtube.com/watch?list=x&v=dQw4w9WgXcQ&t=3"),
            Some("dQw4w9WgXcQ".to_string())
        );
        assert_eq!(
            extract_video_id("https://youtu.be/dQw4w9WgXcQ?si=abc"),
            Some("dQw4w9WgXcQ".to_string())
        );
        assert_eq!(
            extract_video_id("https://www.youtube.com/embed/dQw4w9WgXcQ"),
            Some("dQw4w9WgXcQ".to_string())
        );
        assert_eq!(extract_video_id("https://youtube.com/shorts/abc123"), None);
    }

    #[test]
    fn restricted_domains_short_circuit() {
        let err = classify("https://www.netflix.com/watch/80100172").unwrap_err();
        assert_eq!(err.domain, "netflix.com");
        // a restricted domain wins even when the URL also looks like something else
        let err = classify("https://www.primevideo.com/?v=youtube.com/watch?v=dQw4w9WgXcQ").unwrap_err();
        assert_eq!(err.domain, "primevideo.com");
    }

    #[test]
    fn classifies_providers() {
        let yt = classify("https://youtu.be/dQw4w9WgXcQ").unwrap();
        assert_eq!(yt.kind, SourceKind::EmbedApi);

        let drive = classify("https://drive.google.com/file/d/1AbC-dEf_9/view?usp=sharing").unwrap();
        assert_eq!(
            drive.provider,
            Provider::GoogleDrive {
                file_id: "1AbC-dEf_9".into()
            }
        );
        assert_eq!(drive.kind, SourceKind::NoControl);

        let streamable = classify("https://streamable.com/x7k2p").unwrap();
        assert_eq!(streamable.provider, Provider::Streamable { id: "x7k2p".into() });

        let direct = classify("https://cdn.example.com/movie.mp4").unwrap();
        assert_eq!(direct.provider, Provider::Direct);
        assert_eq!(direct.kind, SourceKind::FullControl);
    }

    #[test]
    fn drive_links() {
        assert_eq!(
            extract_drive_id("https://drive.google.com/open?id=XYZ_123"),
            Some("XYZ_123".into())
        );
        assert_eq!(extract_drive_id("https://example.com/?id=abc"), None);
    }

    #[tokio::test]
    async fn drive_links_prepare_as_preview_or_direct_stream() {
        let http = reqwest::Client::new();
        let share = "https://drive.google.com/file/d/abc/view?usp=sharing";

        let preview = prepare(share, &http, false).await.unwrap();
        assert_eq!(preview.url, "https://drive.google.com/file/d/abc/preview");
        assert_eq!(preview.source_kind, SourceKind::NoControl);

        let direct = prepare(share, &http, true).await.unwrap();
        assert_eq!(direct.url, "https://drive.google.com/uc?export=download&id=abc");
        assert_eq!(direct.source_kind, SourceKind::FullControl);
    }

    #[test]
    fn streamable_page_extraction() {
        let og = r#"<head><meta property="og:video:url" content="https://cdn.streamable.com/video/mp4/x7k2p.mp4?token=1" /></head>"#;
        assert_eq!(
            extract_streamable_mp4(og).as_deref(),
            Some("https://cdn.streamable.com/video/mp4/x7k2p.mp4?token=1")
        );

        let tag = r#"<video><source src="https://cdn.streamable.com/v.mp4" type="video/mp4"></video>"#;
        assert_eq!(
            extract_streamable_mp4(tag).as_deref(),
            Some("https://cdn.streamable.com/v.mp4")
        );

        assert_eq!(extract_streamable_mp4("<html></html>"), None);
    }
}
