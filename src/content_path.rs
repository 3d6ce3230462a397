use std::env;

use anyhow::Context as _;
use regex::Regex;
use sha1::{Digest as _, Sha1};
use url::Url;

pub const DIRECTORY_INDEX: &str = "index.html";
pub const BASENAME_MAX_LENGTH: usize = 196;
pub const DIGEST_LENGTH: usize = 8;
pub const DEFAULT_IGNORE_PARAMS: &[&str] = &["ts"];
pub const IGNORE_PARAMS_ENV: &str = "IGNORE_PARAMS";

/// Maps `(method, url)` to the relative path of a content file.
///
/// `https://example.com/foo/bar.html?hoge=123` becomes
/// `get/https/example.com/foo/bar~hoge=123.html`. Values of the configured
/// volatile query parameters are blanked first, so requests that only differ by
/// a cache-busting timestamp share one file.
#[derive(Debug, Clone)]
pub struct ContentPathResolver {
    ignore_params: Vec<Regex>,
}

impl Default for ContentPathResolver {
    fn default() -> Self {
        Self::with_ignore_params(DEFAULT_IGNORE_PARAMS.iter().copied())
    }
}

impl ContentPathResolver {
    pub fn with_ignore_params<I, S>(params: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let ignore_params = params
            .into_iter()
            .map(|param| param.as_ref().trim().to_owned())
            .filter(|param| !param.is_empty())
            .map(|param| {
                Regex::new(&format!(r"([?&]{}=)[^&]*", regex::escape(&param)))
                    .expect("escaped query parameter pattern is a valid regex")
            })
            .collect();
        Self { ignore_params }
    }

    /// Reads `IGNORE_PARAMS` (comma separated), falling back to the default set.
    pub fn from_env() -> Self {
        match env::var(IGNORE_PARAMS_ENV) {
            Ok(raw) if !raw.trim().is_empty() => Self::with_ignore_params(raw.split(',')),
            _ => Self::default(),
        }
    }

    pub fn normalize_url(&self, url: &str) -> anyhow::Result<Url> {
        let mut parsed = Url::parse(url).with_context(|| format!("parse url `{url}`"))?;
        if let Some(search) = search_of(&parsed) {
            let stripped = self.strip_search(&search);
            let query = stripped.strip_prefix('?').unwrap_or(&stripped).to_owned();
            parsed.set_query(Some(&query));
        }
        Ok(parsed)
    }

    pub fn path_for(&self, method: &str, url: &str) -> anyhow::Result<String> {
        let parsed = self.normalize_url(url)?;

        let scheme = parsed.scheme().replace(':', "");
        let host = host_with_port(&parsed).replace(':', "~");

        let mut pathname = parsed.path().to_owned();
        if pathname.ends_with('/') {
            pathname.push_str(DIRECTORY_INDEX);
        } else if extname(&pathname).is_empty() {
            pathname.push('/');
            pathname.push_str(DIRECTORY_INDEX);
        }

        let (dir, file) = match pathname.rfind('/') {
            Some(idx) => (&pathname[..idx], &pathname[idx + 1..]),
            None => ("", pathname.as_str()),
        };
        let ext = extname(file);
        let mut filename = file[..file.len() - ext.len()].to_owned();

        if let Some(search) = search_of(&parsed) {
            let search = self.strip_search(&search);
            filename = format!("{filename}~{}", &search[1..]);
        }

        if filename.chars().count() > BASENAME_MAX_LENGTH {
            let trunk: String = filename.chars().take(BASENAME_MAX_LENGTH).collect();
            filename = format!("{trunk}_{}", short_digest(&filename));
        }
        filename.push_str(ext);

        let segments = [method, &scheme, &host]
            .into_iter()
            .chain(dir.split('/'))
            .chain(std::iter::once(filename.as_str()))
            .filter(|segment| !segment.is_empty() && *segment != ".")
            .collect::<Vec<_>>();
        Ok(segments.join("/"))
    }

    fn strip_search(&self, search: &str) -> String {
        self.ignore_params
            .iter()
            .fold(search.to_owned(), |search, pattern| {
                pattern.replace_all(&search, "${1}").into_owned()
            })
    }
}

fn search_of(url: &Url) -> Option<String> {
    url.query()
        .filter(|query| !query.is_empty())
        .map(|query| format!("?{query}"))
}

fn host_with_port(url: &Url) -> String {
    let host = url.host_str().unwrap_or_default();
    match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_owned(),
    }
}

/// POSIX `extname`: the last `.suffix` of the final segment, ignoring a leading dot.
fn extname(path: &str) -> &str {
    let base = path.rsplit('/').next().unwrap_or(path);
    match base.rfind('.') {
        Some(0) | None => "",
        Some(idx) => &base[idx..],
    }
}

fn short_digest(input: &str) -> String {
    let digest = Sha1::digest(input.as_bytes());
    let hex = format!("{digest:x}");
    hex[..DIGEST_LENGTH].to_owned()
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContentType {
    pub mime: Option<String>,
    pub charset: Option<String>,
}

pub fn parse_content_type(header: &str) -> ContentType {
    let mut parts = header.split(';').map(str::trim);
    let mime = parts
        .next()
        .filter(|mime| !mime.is_empty())
        .map(str::to_owned);
    let charset = parts
        .find_map(|param| param.strip_prefix("charset="))
        .map(str::to_owned);
    ContentType { mime, charset }
}

pub fn stringify_content_type(
    mime: Option<&str>,
    charset: Option<&str>,
    original: Option<&str>,
) -> String {
    let mut params: Vec<String> = original
        .map(|original| original.split(';').map(|p| p.trim().to_owned()).collect())
        .unwrap_or_default();
    if let Some(mime) = mime {
        if params.is_empty() {
            params.push(mime.to_owned());
        } else {
            params[0] = mime.to_owned();
        }
    }
    if let Some(charset) = charset {
        let param = format!("charset={charset}");
        match params.iter().position(|p| p.starts_with("charset=")) {
            Some(idx) => params[idx] = param,
            None => params.insert(params.len().min(1), param),
        }
    }
    params.join("; ")
}

#[cfg(test)]
mod tests {
    use super::{
        BASENAME_MAX_LENGTH, ContentPathResolver, ContentType, DIGEST_LENGTH, extname,
        parse_content_type, stringify_content_type,
    };

    fn path(method: &str, url: &str) -> String {
        ContentPathResolver::default()
            .path_for(method, url)
            .expect("url should resolve")
    }

    #[test]
    fn trailing_slash_gets_directory_index() {
        assert_eq!(
            path("get", "http://example.com/"),
            "get/http/example.com/index.html"
        );
        assert_eq!(
            path("get", "https://example.com/foo/"),
            "get/https/example.com/foo/index.html"
        );
    }

    #[test]
    fn extensionless_path_becomes_directory() {
        assert_eq!(
            path("get", "https://example.com/foo/bar"),
            "get/https/example.com/foo/bar/index.html"
        );
    }

    #[test]
    fn query_string_joins_basename_before_extension() {
        assert_eq!(
            path("get", "https://example.com/foo/bar.html?hoge=123"),
            "get/https/example.com/foo/bar~hoge=123.html"
        );
        assert_eq!(
            path("post", "https://example.com/?a=1&b=2"),
            "post/https/example.com/index~a=1&b=2.html"
        );
    }

    #[test]
    fn port_colon_is_filesystem_safe() {
        assert_eq!(
            path("get", "http://localhost:8080/app.js"),
            "get/http/localhost~8080/app.js"
        );
        assert_eq!(
            path("get", "https://example.com:443/app.js"),
            "get/https/example.com/app.js"
        );
    }

    #[test]
    fn volatile_parameter_value_is_blanked() {
        let first = path("get", "https://example.com/a.js?ts=111&v=2");
        let second = path("get", "https://example.com/a.js?ts=999&v=2");
        assert_eq!(first, second);
        assert_eq!(first, "get/https/example.com/a~ts=&v=2.js");

        assert_eq!(
            path("get", "https://example.com/a.js?v=2&ts=5"),
            "get/https/example.com/a~v=2&ts=.js"
        );
    }

    #[test]
    fn parameter_sharing_a_prefix_is_untouched() {
        assert_eq!(
            path("get", "https://example.com/a.js?tsx=1"),
            "get/https/example.com/a~tsx=1.js"
        );
    }

    #[test]
    fn custom_ignore_params_are_applied() {
        let resolver = ContentPathResolver::with_ignore_params(["cb", " _ "]);
        assert_eq!(
            resolver
                .path_for("get", "https://example.com/x.css?cb=1&_=2&keep=3")
                .unwrap(),
            "get/https/example.com/x~cb=&_=&keep=3.css"
        );
    }

    #[test]
    fn overlong_basename_is_truncated_with_digest() {
        let long = "a".repeat(300);
        let resolved = path("get", &format!("https://example.com/dir/{long}.js"));
        let file = resolved.rsplit('/').next().unwrap();
        let stem = file.strip_suffix(".js").expect("extension kept");
        assert_eq!(stem.len(), BASENAME_MAX_LENGTH + 1 + DIGEST_LENGTH);
        assert!(stem.starts_with(&"a".repeat(BASENAME_MAX_LENGTH)));
        assert_eq!(&stem[BASENAME_MAX_LENGTH..BASENAME_MAX_LENGTH + 1], "_");

        let again = path("get", &format!("https://example.com/dir/{long}.js"));
        assert_eq!(resolved, again);

        let other = path("get", &format!("https://example.com/dir/{long}b.js"));
        assert_ne!(resolved, other, "digest covers the untruncated basename");
    }

    #[test]
    fn overlong_query_is_truncated() {
        let query = format!("q={}", "x".repeat(250));
        let resolved = path("get", &format!("https://example.com/search?{query}"));
        let file = resolved.rsplit('/').next().unwrap();
        assert_eq!(file.len(), BASENAME_MAX_LENGTH + 1 + DIGEST_LENGTH + ".html".len());
    }

    #[test]
    fn extname_follows_posix_rules() {
        assert_eq!(extname("/foo/bar.html"), ".html");
        assert_eq!(extname("/foo/.hidden"), "");
        assert_eq!(extname("/foo/archive.tar.gz"), ".gz");
        assert_eq!(extname("/foo/bar"), "");
    }

    #[test]
    fn invalid_url_is_an_error() {
        assert!(ContentPathResolver::default().path_for("get", "not a url").is_err());
    }

    #[test]
    fn content_type_header_round_trips() {
        assert_eq!(
            parse_content_type("text/html; charset=Shift_JIS"),
            ContentType {
                mime: Some("text/html".to_owned()),
                charset: Some("Shift_JIS".to_owned()),
            }
        );
        assert_eq!(
            parse_content_type("image/png"),
            ContentType {
                mime: Some("image/png".to_owned()),
                charset: None,
            }
        );
        assert_eq!(
            stringify_content_type(Some("text/html"), Some("utf-8"), None),
            "text/html; charset=utf-8"
        );
        assert_eq!(
            stringify_content_type(
                Some("text/css"),
                Some("utf-8"),
                Some("text/css; charset=euc-jp; foo=bar")
            ),
            "text/css; charset=utf-8; foo=bar"
        );
        assert_eq!(stringify_content_type(Some("image/png"), None, None), "image/png");
    }
}
