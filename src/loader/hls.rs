//! Minimal M3U8 playlist handling
//!
//! When a fetched body turns out to be an HLS playlist, the loader parses
//! the URI lines and hands each referenced segment to the preload
//! scheduler. The playlist itself stays in the cache as opaque bytes;
//! nothing here interprets tags beyond skipping them.

/// Whether a content type indicates an HLS playlist
pub fn is_playlist_content_type(content_type: &str) -> bool {
    let ct = content_type
        .split(';')
        .next()
        .unwrap_or(content_type)
        .trim()
        .to_ascii_lowercase();
    matches!(
        ct.as_str(),
        "application/vnd.apple.mpegurl"
            | "application/x-mpegurl"
            | "audio/mpegurl"
            | "audio/x-mpegurl"
            | "vnd.apple.mpegurl"
    )
}

/// Extract segment and variant URLs from playlist text, resolved against
/// the playlist's own URL
///
/// Every non-tag, non-empty line is a URI per the M3U8 grammar. Lines that
/// cannot be resolved are skipped.
pub fn segment_urls(playlist: &str, base_url: &str) -> Vec<String> {
    playlist
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| resolve(line, base_url))
        .collect()
}

/// Resolve `reference` against `base_url`
///
/// Handles the three shapes playlists use: absolute URLs, host-relative
/// paths, and document-relative paths. Query strings on the base are
/// dropped before joining.
fn resolve(reference: &str, base_url: &str) -> Option<String> {
    if reference.contains("://") {
        return Some(reference.to_string());
    }

    let scheme_end = base_url.find("://")? + 3;
    let authority_end = base_url[scheme_end..]
        .find('/')
        .map(|i| scheme_end + i)
        .unwrap_or(base_url.len());

    if let Some(path) = reference.strip_prefix('/') {
        return Some(format!("{}/{}", &base_url[..authority_end], path));
    }

    let without_query = base_url
        .find('?')
        .map(|i| &base_url[..i])
        .unwrap_or(base_url);
    let dir_end = without_query.rfind('/').filter(|&i| i >= authority_end);
    match dir_end {
        Some(i) => Some(format!("{}/{}", &without_query[..i], reference)),
        None => Some(format!("{}/{}", without_query, reference)),
    }
}
