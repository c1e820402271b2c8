//! The restfs wire format.
//!
//! Metadata travels in headers, never in bodies:
//!
//! | Header | Value |
//! |---|---|
//! | `File-Mode` | permission bits, octal (`644`) |
//! | `Is-Dir` | `true` or `false` |
//! | `Last-Modified` | RFC 1123 date of the modification time |
//! | `Mtime`, `Atime` | Unix seconds |
//! | `Content-Length` | file size (files only) |
//!
//! Directory bodies are newline-delimited `"<name> <octal st_mode>"` records. The listing mode
//! keeps its type bits because a listing has no other place to say which entries are directories.

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use http::{HeaderMap, HeaderName, HeaderValue, header};
use thiserror::Error;

/// User agent sent with every client request.
pub const USER_AGENT: &str = "restfs-client";

/// Permission bits, octal.
pub const FILE_MODE: HeaderName = HeaderName::from_static("file-mode");
/// `true` for directories.
pub const IS_DIR: HeaderName = HeaderName::from_static("is-dir");
/// Modification time in Unix seconds.
pub const MTIME: HeaderName = HeaderName::from_static("mtime");
/// Access time in Unix seconds.
pub const ATIME: HeaderName = HeaderName::from_static("atime");

/// Mask for the file type bits of `st_mode`.
pub const S_IFMT: u32 = 0o170_000;
/// Directory type bits.
pub const S_IFDIR: u32 = 0o040_000;
/// Regular file type bits.
pub const S_IFREG: u32 = 0o100_000;
/// Mask for permission bits, including setuid, setgid and sticky.
pub const PERM_MASK: u32 = 0o7777;

/// Authorization scheme. Matched case-insensitively.
pub const AUTH_SCHEME: &str = "basic";

/// Errors decoding the wire format.
#[derive(Debug, Error)]
pub enum WireError {
    /// A required header was absent.
    #[error("missing header {0}")]
    MissingHeader(HeaderName),

    /// A header was present but could not be parsed.
    #[error("malformed header {name}: {value:?}")]
    MalformedHeader {
        /// The offending header.
        name: HeaderName,
        /// Its raw value, lossily decoded.
        value: String,
    },

    /// A directory listing line did not have the `<name> <mode>` shape.
    #[error("malformed listing line {0:?}")]
    MalformedListing(String),

    /// The authorization header was not `basic <base64 username>`.
    #[error("malformed authorization")]
    MalformedAuthorization,
}

fn header_str<'a>(headers: &'a HeaderMap, name: &HeaderName) -> Result<&'a str, WireError> {
    let value = headers
        .get(name)
        .ok_or_else(|| WireError::MissingHeader(name.clone()))?;
    value.to_str().map_err(|_| WireError::MalformedHeader {
        name: name.clone(),
        value: String::from_utf8_lossy(value.as_bytes()).into_owned(),
    })
}

fn parse_header<T>(
    headers: &HeaderMap,
    name: &HeaderName,
    parse: impl FnOnce(&str) -> Option<T>,
) -> Result<T, WireError> {
    let raw = header_str(headers, name)?;
    parse(raw.trim()).ok_or_else(|| WireError::MalformedHeader {
        name: name.clone(),
        value: raw.to_owned(),
    })
}

/// Parse an octal mode string such as `644`, `0644` or `100644`.
#[must_use]
pub fn parse_mode(s: &str) -> Option<u32> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    u32::from_str_radix(s, 8).ok()
}

/// Read the permission bits carried in `File-Mode`.
///
/// Any type bits the sender included are dropped.
pub fn mode_from_headers(headers: &HeaderMap) -> Result<u32, WireError> {
    parse_header(headers, &FILE_MODE, parse_mode).map(|m| m & PERM_MASK)
}

/// Encode permission bits for the `File-Mode` header.
#[must_use]
pub fn mode_header_value(mode: u32) -> HeaderValue {
    // Octal digits are always a valid header value.
    HeaderValue::from_str(&format!("{:o}", mode & PERM_MASK))
        .unwrap_or_else(|_| HeaderValue::from_static("0"))
}

fn unix_seconds(s: &str) -> Option<i64> {
    s.parse().ok()
}

fn rfc1123(secs: i64) -> Option<String> {
    chrono::DateTime::from_timestamp(secs, 0)
        .map(|dt| dt.format("%a, %d %b %Y %H:%M:%S GMT").to_string())
}

/// Attributes of one entry as exchanged over the wire.
///
/// `mode` always carries the type bits, and they always agree with `is_dir`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Metadata {
    /// Permission and type bits.
    pub mode: u32,
    /// Size in bytes. Zero for directories.
    pub size: u64,
    /// Modification time, Unix seconds.
    pub mtime: i64,
    /// Access time, Unix seconds.
    pub atime: i64,
    /// Whether the entry is a directory.
    pub is_dir: bool,
}

impl Metadata {
    /// Metadata for a regular file.
    #[must_use]
    pub const fn file(perm: u32, size: u64, mtime: i64, atime: i64) -> Self {
        Self {
            mode: S_IFREG | (perm & PERM_MASK),
            size,
            mtime,
            atime,
            is_dir: false,
        }
    }

    /// Metadata for a directory.
    #[must_use]
    pub const fn directory(perm: u32, mtime: i64, atime: i64) -> Self {
        Self {
            mode: S_IFDIR | (perm & PERM_MASK),
            size: 0,
            mtime,
            atime,
            is_dir: true,
        }
    }

    /// The permission bits alone.
    #[must_use]
    pub const fn permissions(&self) -> u32 {
        self.mode & PERM_MASK
    }

    /// Decode a HEAD or GET response.
    pub fn from_headers(headers: &HeaderMap) -> Result<Self, WireError> {
        let perm = mode_from_headers(headers)?;
        let is_dir = parse_header(headers, &IS_DIR, |s| s.parse::<bool>().ok())?;
        let mtime = parse_header(headers, &MTIME, unix_seconds)?;
        let atime = parse_header(headers, &ATIME, unix_seconds)?;

        if is_dir {
            return Ok(Self::directory(perm, mtime, atime));
        }

        let size = match headers.get(header::CONTENT_LENGTH) {
            Some(_) => parse_header(headers, &header::CONTENT_LENGTH, |s| s.parse().ok())?,
            None => 0,
        };
        Ok(Self::file(perm, size, mtime, atime))
    }

    /// Encode as HEAD/GET response headers.
    pub fn write_headers(&self, headers: &mut HeaderMap) {
        headers.insert(FILE_MODE, mode_header_value(self.mode));
        headers.insert(
            IS_DIR,
            HeaderValue::from_static(if self.is_dir { "true" } else { "false" }),
        );
        if let Some(date) = rfc1123(self.mtime).and_then(|d| HeaderValue::from_str(&d).ok()) {
            headers.insert(header::LAST_MODIFIED, date);
        }
        headers.insert(MTIME, HeaderValue::from(self.mtime));
        headers.insert(ATIME, HeaderValue::from(self.atime));
        if self.is_dir {
            headers.remove(header::CONTENT_LENGTH);
        } else {
            headers.insert(header::CONTENT_LENGTH, HeaderValue::from(self.size));
        }
    }
}

impl From<&std::fs::Metadata> for Metadata {
    fn from(meta: &std::fs::Metadata) -> Self {
        use std::os::unix::fs::MetadataExt as _;

        if meta.is_dir() {
            Self::directory(meta.mode(), meta.mtime(), meta.atime())
        } else {
            Self::file(meta.mode(), meta.len(), meta.mtime(), meta.atime())
        }
    }
}

/// The caller-authoritative attributes that accompany a `PUT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteAttrs {
    /// Permission bits.
    pub mode: u32,
    /// Access time to stamp on the written file.
    pub atime: i64,
    /// Modification time to stamp on the written file.
    pub mtime: i64,
}

impl WriteAttrs {
    /// Decode `File-Mode`, `Atime` and `Mtime`, all of which are required.
    pub fn from_headers(headers: &HeaderMap) -> Result<Self, WireError> {
        Ok(Self {
            mode: mode_from_headers(headers)?,
            atime: parse_header(headers, &ATIME, unix_seconds)?,
            mtime: parse_header(headers, &MTIME, unix_seconds)?,
        })
    }

    /// Encode as `PUT` request headers.
    pub fn write_headers(&self, headers: &mut HeaderMap) {
        headers.insert(FILE_MODE, mode_header_value(self.mode));
        headers.insert(ATIME, HeaderValue::from(self.atime));
        headers.insert(MTIME, HeaderValue::from(self.mtime));
    }
}

impl From<&Metadata> for WriteAttrs {
    fn from(meta: &Metadata) -> Self {
        Self {
            mode: meta.permissions(),
            atime: meta.atime,
            mtime: meta.mtime,
        }
    }
}

/// One record of a directory listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListingEntry {
    /// Entry name within the listed directory.
    pub name: String,
    /// Full `st_mode`, type bits included.
    pub mode: u32,
}

impl ListingEntry {
    /// Whether the entry is a directory. Entries without type bits are files.
    #[must_use]
    pub const fn is_dir(&self) -> bool {
        self.mode & S_IFMT == S_IFDIR
    }

    /// The permission bits alone.
    #[must_use]
    pub const fn permissions(&self) -> u32 {
        self.mode & PERM_MASK
    }
}

/// Render a listing body. Order is whatever the iterator yields.
pub fn encode_listing<'a>(entries: impl IntoIterator<Item = &'a ListingEntry>) -> String {
    let mut body = String::new();
    for entry in entries {
        body.push_str(&entry.name);
        body.push(' ');
        body.push_str(&format!("{:o}", entry.mode));
        body.push('\n');
    }
    body
}

/// Parse a listing body.
///
/// Names may contain spaces; the mode is whatever follows the last one.
pub fn parse_listing(body: &[u8]) -> Result<Vec<ListingEntry>, WireError> {
    let text = std::str::from_utf8(body)
        .map_err(|_| WireError::MalformedListing(String::from_utf8_lossy(body).into_owned()))?;

    text.lines()
        .filter(|line| !line.is_empty())
        .map(|line| {
            let malformed = || WireError::MalformedListing(line.to_owned());
            let (name, mode) = line.rsplit_once(' ').ok_or_else(malformed)?;
            if name.is_empty() || name == "." || name == ".." || name.contains('/') {
                return Err(malformed());
            }
            let mode = parse_mode(mode).ok_or_else(malformed)?;
            Ok(ListingEntry {
                name: name.to_owned(),
                mode,
            })
        })
        .collect()
}

/// Build the `Authorization` value for `username`.
#[must_use]
pub fn encode_authorization(username: &str) -> String {
    format!("{AUTH_SCHEME} {}", BASE64.encode(username))
}

/// Recover the username from an `Authorization` value.
///
/// No credential is checked; the token only names the user.
pub fn decode_authorization(value: &str) -> Result<String, WireError> {
    let (scheme, token) = value
        .trim()
        .split_once(' ')
        .ok_or(WireError::MalformedAuthorization)?;
    if !scheme.eq_ignore_ascii_case(AUTH_SCHEME) {
        return Err(WireError::MalformedAuthorization);
    }
    let raw = BASE64
        .decode(token.trim())
        .map_err(|_| WireError::MalformedAuthorization)?;
    let user = String::from_utf8(raw).map_err(|_| WireError::MalformedAuthorization)?;
    if user.is_empty() {
        return Err(WireError::MalformedAuthorization);
    }
    Ok(user)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn mode_accepts_leading_zero_and_type_bits() {
        assert_eq!(parse_mode("0644"), Some(0o644));
        assert_eq!(parse_mode("100644"), Some(0o100_644));
        assert_eq!(parse_mode("rw-r--r--"), None);
        assert_eq!(parse_mode(""), None);
    }

    #[test]
    fn file_mode_header_is_bare_permissions() {
        let mut headers = HeaderMap::new();
        Metadata::file(0o644, 5, 1_700_000_000, 1_600_000_000).write_headers(&mut headers);

        assert_eq!(headers.get(&FILE_MODE).unwrap(), "644");
        assert_eq!(headers.get(&IS_DIR).unwrap(), "false");
        assert_eq!(headers.get(&MTIME).unwrap(), "1700000000");
        assert_eq!(headers.get(&ATIME).unwrap(), "1600000000");
        assert_eq!(headers.get(header::CONTENT_LENGTH).unwrap(), "5");
        assert_eq!(
            headers.get(header::LAST_MODIFIED).unwrap(),
            "Tue, 14 Nov 2023 22:13:20 GMT"
        );
    }

    #[test]
    fn directories_carry_no_content_length() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(12_u64));
        Metadata::directory(0o755, 10, 10).write_headers(&mut headers);

        assert!(headers.get(header::CONTENT_LENGTH).is_none());
        let decoded = Metadata::from_headers(&headers).unwrap();
        assert!(decoded.is_dir);
        assert_eq!(decoded.mode, S_IFDIR | 0o755);
        assert_eq!(decoded.size, 0);
    }

    #[test]
    fn is_dir_wins_over_type_bits_in_file_mode() {
        let mut headers = HeaderMap::new();
        headers.insert(FILE_MODE, HeaderValue::from_static("40755"));
        headers.insert(IS_DIR, HeaderValue::from_static("false"));
        headers.insert(MTIME, HeaderValue::from_static("3"));
        headers.insert(ATIME, HeaderValue::from_static("4"));

        let meta = Metadata::from_headers(&headers).unwrap();
        assert!(!meta.is_dir);
        assert_eq!(meta.mode, S_IFREG | 0o755);
    }

    #[test]
    fn missing_mtime_is_reported_by_name() {
        let mut headers = HeaderMap::new();
        headers.insert(FILE_MODE, HeaderValue::from_static("644"));
        headers.insert(IS_DIR, HeaderValue::from_static("false"));
        headers.insert(ATIME, HeaderValue::from_static("4"));

        let err = Metadata::from_headers(&headers).unwrap_err();
        assert!(matches!(err, WireError::MissingHeader(name) if name == MTIME));
    }

    #[test]
    fn write_attrs_reject_garbage_times() {
        let mut headers = HeaderMap::new();
        headers.insert(FILE_MODE, HeaderValue::from_static("0644"));
        headers.insert(ATIME, HeaderValue::from_static("yesterday"));
        headers.insert(MTIME, HeaderValue::from_static("1"));

        assert!(matches!(
            WriteAttrs::from_headers(&headers),
            Err(WireError::MalformedHeader { .. })
        ));
    }

    #[test]
    fn listing_keeps_spaces_in_names() {
        let entries = parse_listing(b"my notes.txt 100600\nsub 40755\n\n").unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, "my notes.txt");
        assert!(!entries[0].is_dir());
        assert_eq!(entries[0].permissions(), 0o600);
        assert!(entries[1].is_dir());
    }

    #[test]
    fn listing_without_type_bits_means_files() {
        let entries = parse_listing(b"a.txt 644\n").unwrap();
        assert!(!entries[0].is_dir());
        assert_eq!(entries[0].mode, 0o644);
    }

    #[test]
    fn listing_rejects_traversal_and_bad_modes() {
        assert!(parse_listing(b".. 40755\n").is_err());
        assert!(parse_listing(b"a/b 644\n").is_err());
        assert!(parse_listing(b"lonely\n").is_err());
        assert!(parse_listing(b"x 9z\n").is_err());
    }

    #[test]
    fn encoded_listing_parses_back() {
        let entries = vec![
            ListingEntry {
                name: "a.txt".to_owned(),
                mode: S_IFREG | 0o644,
            },
            ListingEntry {
                name: "sub".to_owned(),
                mode: S_IFDIR | 0o755,
            },
        ];
        let body = encode_listing(&entries);
        assert_eq!(body, "a.txt 100644\nsub 40755\n");
        assert_eq!(parse_listing(body.as_bytes()).unwrap(), entries);
    }

    #[test]
    fn authorization_is_base64_username() {
        let value = encode_authorization("julio");
        assert_eq!(value, "basic anVsaW8=");
        assert_eq!(decode_authorization(&value).unwrap(), "julio");
        assert_eq!(decode_authorization("Basic anVsaW8=").unwrap(), "julio");
        assert!(decode_authorization("bearer anVsaW8=").is_err());
        assert!(decode_authorization("basic !!!").is_err());
        assert!(decode_authorization("basic ").is_err());
    }
}
