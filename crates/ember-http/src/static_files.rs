use std::{
    fs::{self, File},
    path::{Component, Path, PathBuf},
    time::SystemTime,
};

use tracing::debug;

use crate::HeaderMap;

/// Public-folder settings for one listener.
#[derive(Clone, Debug)]
pub struct StaticSettings {
    pub root: PathBuf,
    /// `Cache-Control: max-age` for 200 responses, seconds.
    pub max_age: u32,
}

/// Result of resolving a request against the public folder.
pub enum StaticOutcome {
    /// Path missing, traversal attempt, or not a regular file.
    NotFound,
    /// Conditional headers matched; emit 304 with the validators.
    NotModified { headers: Vec<(String, String)> },
    /// Requested range cannot be satisfied.
    RangeInvalid { len: u64 },
    /// Serve file bytes (sendfile path).
    File { file: File, offset: u64, len: u64, status: u16, headers: Vec<(String, String)> },
}

/// Resolves `path` under the public folder and applies conditional, range
/// and pre-compressed sidecar negotiation.
pub fn serve_static(settings: &StaticSettings, path: &str, request: &HeaderMap) -> StaticOutcome {
    let Some(resolved) = sanitize(&settings.root, path) else {
        return StaticOutcome::NotFound;
    };

    let mut target = resolved;
    let mut metadata = match fs::metadata(&target) {
        Ok(m) => m,
        Err(_) => return StaticOutcome::NotFound,
    };
    if metadata.is_dir() {
        target = target.join("index.html");
        metadata = match fs::metadata(&target) {
            Ok(m) => m,
            Err(_) => return StaticOutcome::NotFound,
        };
    }
    if !metadata.is_file() {
        return StaticOutcome::NotFound;
    }

    // Content type comes from the logical path, before sidecar swapping.
    let mime = mime_guess::from_path(&target).first_or_octet_stream();

    // Pre-compressed sidecars: prefer .br, then .gz, when advertised.
    let mut encoding = None;
    for (token, suffix) in [("br", "br"), ("gzip", "gz")] {
        if request.has_token("accept-encoding", token) {
            let candidate = sidecar_path(&target, suffix);
            if let Ok(side_meta) = fs::metadata(&candidate)
                && side_meta.is_file()
            {
                target = candidate;
                metadata = side_meta;
                encoding = Some(token);
                break;
            }
        }
    }

    let len = metadata.len();
    let modified = metadata.modified().ok();
    let etag = etag_for(&metadata);

    let mut headers: Vec<(String, String)> = vec![
        ("content-type".into(), mime.to_string()),
        ("etag".into(), etag.clone()),
        ("cache-control".into(), format!("max-age={}", settings.max_age)),
    ];
    if let Some(modified) = modified {
        headers.push(("last-modified".into(), httpdate::fmt_http_date(modified)));
    }
    if let Some(encoding) = encoding {
        headers.push(("content-encoding".into(), encoding.to_string()));
        headers.push(("vary".into(), "accept-encoding".into()));
    }

    if not_modified(request, &etag, modified) {
        return StaticOutcome::NotModified { headers };
    }

    let (offset, span, status) = match parse_range(request.get("range"), len) {
        RangeOutcome::None => (0, len, 200),
        RangeOutcome::Single(start, end) => {
            headers.push(("content-range".into(), format!("bytes {start}-{end}/{len}")));
            (start, end - start + 1, 206)
        }
        RangeOutcome::Unsatisfiable => return StaticOutcome::RangeInvalid { len },
    };
    if status == 200 {
        headers.push(("accept-ranges".into(), "bytes".into()));
    }

    match File::open(&target) {
        Ok(file) => StaticOutcome::File { file, offset, len: span, status, headers },
        Err(err) => {
            debug!(?err, path = %target.display(), "static: open failed");
            StaticOutcome::NotFound
        }
    }
}

/// Joins the decoded request path under the root, rejecting traversal.
fn sanitize(root: &Path, path: &str) -> Option<PathBuf> {
    if path.bytes().any(|b| b == 0) {
        return None;
    }
    let relative = path.trim_start_matches('/');
    let mut clean = PathBuf::new();
    for component in Path::new(relative).components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            // ".." or absolute/prefix parts never escape the root.
            _ => return None,
        }
    }
    Some(root.join(clean))
}

fn sidecar_path(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".");
    name.push(suffix);
    PathBuf::from(name)
}

/// Strong validator from inode mtime + size.
fn etag_for(metadata: &fs::Metadata) -> String {
    let mtime = metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(SystemTime::UNIX_EPOCH).ok())
        .map_or(0, |d| d.as_secs());
    format!("\"{mtime:x}-{:x}\"", metadata.len())
}

fn not_modified(request: &HeaderMap, etag: &str, modified: Option<SystemTime>) -> bool {
    if let Some(candidates) = request.get("if-none-match") {
        return candidates.split(',').any(|c| c.trim() == etag || c.trim() == "*");
    }
    if let (Some(since), Some(modified)) = (request.get("if-modified-since"), modified)
        && let Ok(since) = httpdate::parse_http_date(since)
    {
        // HTTP dates have one-second resolution.
        let modified = modified
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let since =
            since.duration_since(SystemTime::UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0);
        return modified <= since;
    }
    false
}

enum RangeOutcome {
    None,
    /// Inclusive byte range.
    Single(u64, u64),
    Unsatisfiable,
}

/// Single-range `bytes=` parser. Multi-range requests are ignored (full
/// response), syntactically invalid ones too; an empty window is 416.
fn parse_range(header: Option<&str>, len: u64) -> RangeOutcome {
    let Some(spec) = header.and_then(|h| h.strip_prefix("bytes=")) else {
        return RangeOutcome::None;
    };
    if spec.contains(',') || len == 0 {
        return RangeOutcome::None;
    }
    let Some((start, end)) = spec.split_once('-') else { return RangeOutcome::None };

    match (start.trim(), end.trim()) {
        // bytes=-N : final N bytes.
        ("", suffix) => match suffix.parse::<u64>() {
            Ok(0) => RangeOutcome::Unsatisfiable,
            Ok(n) => RangeOutcome::Single(len.saturating_sub(n), len - 1),
            Err(_) => RangeOutcome::None,
        },
        (first, "") => match first.parse::<u64>() {
            Ok(start) if start < len => RangeOutcome::Single(start, len - 1),
            Ok(_) => RangeOutcome::Unsatisfiable,
            Err(_) => RangeOutcome::None,
        },
        (first, last) => match (first.parse::<u64>(), last.parse::<u64>()) {
            (Ok(start), Ok(end)) if start <= end && start < len => {
                RangeOutcome::Single(start, end.min(len - 1))
            }
            (Ok(_), Ok(_)) => RangeOutcome::Unsatisfiable,
            _ => RangeOutcome::None,
        },
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn fixture() -> (tempfile::TempDir, StaticSettings) {
        let dir = tempfile::tempdir().unwrap();
        let mut f = File::create(dir.path().join("page.html")).unwrap();
        f.write_all(b"<html>hello</html>").unwrap();
        let settings = StaticSettings { root: dir.path().to_path_buf(), max_age: 3600 };
        (dir, settings)
    }

    fn header_value<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
        headers.iter().find(|(n, _)| n == name).map(|(_, v)| v.as_str())
    }

    #[test]
    fn serves_existing_file() {
        let (_dir, settings) = fixture();
        match serve_static(&settings, "/page.html", &HeaderMap::new()) {
            StaticOutcome::File { len, status, headers, .. } => {
                assert_eq!(status, 200);
                assert_eq!(len, 18);
                assert_eq!(header_value(&headers, "content-type"), Some("text/html"));
                assert!(header_value(&headers, "etag").unwrap().starts_with('"'));
            }
            _ => panic!("expected a file"),
        }
    }

    #[test]
    fn traversal_is_rejected() {
        let (_dir, settings) = fixture();
        assert!(matches!(
            serve_static(&settings, "/../etc/passwd", &HeaderMap::new()),
            StaticOutcome::NotFound
        ));
        assert!(matches!(
            serve_static(&settings, "/a/../../page.html", &HeaderMap::new()),
            StaticOutcome::NotFound
        ));
    }

    #[test]
    fn etag_revalidation() {
        let (_dir, settings) = fixture();
        let etag = match serve_static(&settings, "/page.html", &HeaderMap::new()) {
            StaticOutcome::File { headers, .. } => {
                header_value(&headers, "etag").unwrap().to_string()
            }
            _ => panic!(),
        };
        let mut conditional = HeaderMap::new();
        conditional.append("If-None-Match", etag);
        assert!(matches!(
            serve_static(&settings, "/page.html", &conditional),
            StaticOutcome::NotModified { .. }
        ));
    }

    #[test]
    fn single_range_is_served() {
        let (_dir, settings) = fixture();
        let mut request = HeaderMap::new();
        request.append("Range", "bytes=6-10");
        match serve_static(&settings, "/page.html", &request) {
            StaticOutcome::File { offset, len, status, headers, .. } => {
                assert_eq!(status, 206);
                assert_eq!(offset, 6);
                assert_eq!(len, 5);
                assert_eq!(header_value(&headers, "content-range"), Some("bytes 6-10/18"));
            }
            _ => panic!("expected a partial file"),
        }
    }

    #[test]
    fn unsatisfiable_range_is_flagged() {
        let (_dir, settings) = fixture();
        let mut request = HeaderMap::new();
        request.append("Range", "bytes=500-");
        assert!(matches!(
            serve_static(&settings, "/page.html", &request),
            StaticOutcome::RangeInvalid { len: 18 }
        ));
    }

    #[test]
    fn precompressed_sidecar_preferred() {
        let (dir, settings) = fixture();
        File::create(dir.path().join("page.html.gz"))
            .unwrap()
            .write_all(b"gzipped")
            .unwrap();

        let mut request = HeaderMap::new();
        request.append("Accept-Encoding", "gzip, deflate");
        match serve_static(&settings, "/page.html", &request) {
            StaticOutcome::File { len, headers, .. } => {
                assert_eq!(len, 7, "sidecar bytes are served");
                assert_eq!(header_value(&headers, "content-encoding"), Some("gzip"));
                assert_eq!(
                    header_value(&headers, "content-type"),
                    Some("text/html"),
                    "content type reflects the logical file"
                );
            }
            _ => panic!("expected the sidecar"),
        }

        // Without the Accept-Encoding token the original is served.
        match serve_static(&settings, "/page.html", &HeaderMap::new()) {
            StaticOutcome::File { len, .. } => assert_eq!(len, 18),
            _ => panic!(),
        }
    }

    #[test]
    fn directory_falls_back_to_index() {
        let (dir, settings) = fixture();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        File::create(dir.path().join("sub/index.html"))
            .unwrap()
            .write_all(b"sub index")
            .unwrap();
        match serve_static(&settings, "/sub", &HeaderMap::new()) {
            StaticOutcome::File { len, .. } => assert_eq!(len, 9),
            _ => panic!("expected index.html fallback"),
        }
    }
}
