use url::Url;

/// Rewrite every URI line of an HLS playlist into a proxy-local segment URL.
///
/// Directive and blank lines pass through verbatim; relative URIs are
/// resolved against the directory of `fetched_from`. Output keeps a 1:1
/// line correspondence with the input.
pub fn rewrite_playlist(
    playlist: &str,
    fetched_from: &Url,
    station_id: &str,
    known_extensions: &[String],
) -> String {
    let mut out = Vec::new();
    for line in playlist.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            out.push(line.to_string());
            continue;
        }
        let absolute = if trimmed.contains("://") {
            Url::parse(trimmed)
        } else {
            fetched_from.join(trimmed)
        };
        match absolute {
            Ok(absolute) => {
                let ext = segment_extension(&absolute, known_extensions);
                out.push(format!(
                    "/seg.{ext}?u={}&station={}",
                    urlencoding::encode(absolute.as_str()),
                    urlencoding::encode(station_id)
                ));
            }
            // Leave lines we cannot resolve for the player to reject.
            Err(_) => out.push(line.to_string()),
        }
    }
    let mut rewritten = out.join("\n");
    rewritten.push('\n');
    rewritten
}

/// Lower-cased path extension of a segment URL, normalized to `bin` when it
/// is not on the allow-list.
pub fn segment_extension(url: &Url, known_extensions: &[String]) -> String {
    let ext = url
        .path()
        .rsplit('/')
        .next()
        .and_then(|name| name.rsplit_once('.'))
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    if !ext.is_empty()
        && known_extensions
            .iter()
            .any(|known| known.eq_ignore_ascii_case(&ext))
    {
        ext
    } else {
        "bin".to_string()
    }
}

/// Re-point a segment URL at a freshly resolved playlist: keep the filename
/// and query string, swap in the new playlist's directory.
pub fn rebase_segment_url(segment: &Url, playlist: &Url) -> Option<Url> {
    let filename = segment
        .path_segments()
        .and_then(|mut segments| segments.next_back())
        .filter(|name| !name.is_empty())?;
    let mut rebased = playlist.join(filename).ok()?;
    rebased.set_query(segment.query());
    Some(rebased)
}

#[cfg(test)]
mod tests {
    use url::Url;

    use super::{rebase_segment_url, rewrite_playlist, segment_extension};
    use crate::config::{parse_extension_list, DEFAULT_SEGMENT_EXTENSIONS};

    fn extensions() -> Vec<String> {
        parse_extension_list(DEFAULT_SEGMENT_EXTENSIONS)
    }

    fn base() -> Url {
        Url::parse("https://cdn.example/live/FMT/master.m3u8").unwrap()
    }

    #[test]
    fn line_count_and_directives_are_preserved() {
        let playlist = "#EXTM3U\n\n#EXT-X-TARGETDURATION:5\nseg_0001.aac\n#EXT-X-ENDLIST";
        let rewritten = rewrite_playlist(playlist, &base(), "FMT", &extensions());
        let lines: Vec<&str> = rewritten.lines().collect();
        assert_eq!(lines.len(), 5);
        assert_eq!(lines[0], "#EXTM3U");
        assert_eq!(lines[1], "");
        assert_eq!(lines[2], "#EXT-X-TARGETDURATION:5");
        assert!(lines[3].starts_with("/seg.aac?u="));
        assert_eq!(lines[4], "#EXT-X-ENDLIST");
    }

    #[test]
    fn relative_uri_is_resolved_against_playlist_directory() {
        let rewritten = rewrite_playlist("chunklist_b128000.m3u8", &base(), "FMT", &extensions());
        assert_eq!(
            rewritten,
            "/seg.m3u8?u=https%3A%2F%2Fcdn.example%2Flive%2FFMT%2Fchunklist_b128000.m3u8&station=FMT\n"
        );
    }

    #[test]
    fn absolute_uri_is_embedded_unchanged() {
        let line = "https://other.example/path/seg_42.aac?token=abc";
        let rewritten = rewrite_playlist(line, &base(), "FMT", &extensions());
        assert_eq!(
            rewritten,
            format!("/seg.aac?u={}&station=FMT\n", urlencoding::encode(line))
        );
    }

    #[test]
    fn unknown_extension_falls_back_to_bin() {
        let rewritten = rewrite_playlist("segment.xyz", &base(), "FMT", &extensions());
        assert!(rewritten.starts_with("/seg.bin?u="));
    }

    #[test]
    fn extension_comparison_is_case_insensitive() {
        let url = Url::parse("https://cdn.example/live/SEG_1.AAC").unwrap();
        assert_eq!(segment_extension(&url, &extensions()), "aac");
    }

    #[test]
    fn extensionless_path_maps_to_bin() {
        let url = Url::parse("https://cdn.example/live/segment").unwrap();
        assert_eq!(segment_extension(&url, &extensions()), "bin");
    }

    #[test]
    fn rebase_keeps_filename_and_query() {
        let segment =
            Url::parse("https://old.example/a/b/seg_9.aac?token=expired&seq=9").unwrap();
        let playlist = Url::parse("https://new.example/x/y/master.m3u8?auth=fresh").unwrap();
        let rebased = rebase_segment_url(&segment, &playlist).unwrap();
        assert_eq!(
            rebased.as_str(),
            "https://new.example/x/y/seg_9.aac?token=expired&seq=9"
        );
    }

    #[test]
    fn station_id_is_url_encoded() {
        let rewritten = rewrite_playlist("seg.aac", &base(), "rb:some uuid", &extensions());
        assert!(rewritten.contains("station=rb%3Asome%20uuid"));
    }
}
