use crate::models::Platform;
use reqwest::Url;

/// Domain fragments checked in order; the first hostname match wins.
const SUPPORTED_PLATFORMS: &[(&str, Platform)] = &[
    ("youtube.com", Platform::Youtube),
    ("youtu.be", Platform::Youtube),
    ("instagram.com", Platform::Instagram),
    ("tiktok.com", Platform::Tiktok),
    ("twitter.com", Platform::Twitter),
];

/// Maps a URL onto a supported platform.
///
/// Returns `None` for anything unparseable or unknown; never panics.
pub fn detect_platform(url: &str) -> Option<Platform> {
    let parsed = Url::parse(url.trim()).ok()?;
    let host = parsed.host_str()?.to_ascii_lowercase();
    let host = host.strip_prefix("www.").unwrap_or(&host);

    SUPPORTED_PLATFORMS
        .iter()
        .find(|(domain, _)| host.contains(domain))
        .map(|(_, platform)| *platform)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_domains_with_and_without_www() {
        let cases = [
            ("https://youtu.be/abc123", Platform::Youtube),
            ("https://www.youtube.com/watch?v=abc123", Platform::Youtube),
            ("https://m.youtube.com/shorts/xyz", Platform::Youtube),
            ("https://instagram.com/p/abc", Platform::Instagram),
            ("https://www.instagram.com/reel/abc", Platform::Instagram),
            ("https://www.tiktok.com/@user/video/1", Platform::Tiktok),
            ("https://twitter.com/user/status/1", Platform::Twitter),
            ("HTTPS://WWW.TWITTER.COM/user/status/1", Platform::Twitter),
        ];
        for (url, expected) in cases {
            assert_eq!(detect_platform(url), Some(expected), "{url}");
        }
    }

    #[test]
    fn unknown_hosts_are_unsupported() {
        assert_eq!(detect_platform("https://vimeo.com/12345"), None);
        assert_eq!(detect_platform("https://example.org/youtube.com"), None);
        assert_eq!(detect_platform("file:///tmp/video.mp4"), None);
    }

    #[test]
    fn malformed_urls_are_unsupported() {
        assert_eq!(detect_platform(""), None);
        assert_eq!(detect_platform("not a url"), None);
        assert_eq!(detect_platform("youtube.com/watch?v=1"), None);
        assert_eq!(detect_platform("https://"), None);
    }
}
