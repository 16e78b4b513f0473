//! Document identifiers and the bidirectional URL codec.

use crate::error::MalformedIdError;

/// Opaque identifier for one document within the repository.
///
/// Equality is by string value. The identifier must be non-empty; the
/// codec rejects URLs that would decode to an empty identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DocId(String);

impl DocId {
    /// Creates a document identifier from its unique string.
    pub fn new(unique_id: impl Into<String>) -> Self {
        Self(unique_id.into())
    }

    /// Returns the identifier string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for DocId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DocId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Maps document identifiers to the URLs the appliance crawls and back.
///
/// Encoding percent-escapes every byte of the UTF-8 identifier that is not
/// an unreserved URL character, then prepends the configured base. Decoding
/// reverses the mapping: `decode(encode(d)) == d` for every identifier.
#[derive(Debug, Clone)]
pub struct DocIdCodec {
    /// Scheme + authority of this server, no trailing slash.
    base_uri: String,
    /// Absolute path prefix for document URLs, with leading and trailing slash.
    doc_path: String,
}

impl DocIdCodec {
    /// Creates a codec for the given server base URI (`http://host:port`)
    /// and document path prefix (for example `/doc/`).
    pub fn new(base_uri: impl Into<String>, doc_path: impl Into<String>) -> Self {
        let base_uri = base_uri.into();
        let mut doc_path = doc_path.into();
        if !doc_path.starts_with('/') {
            doc_path.insert(0, '/');
        }
        if !doc_path.ends_with('/') {
            doc_path.push('/');
        }
        Self {
            base_uri: base_uri.trim_end_matches('/').to_string(),
            doc_path,
        }
    }

    /// Returns the absolute URL the appliance should crawl for `doc_id`.
    pub fn encode(&self, doc_id: &DocId) -> String {
        let mut url =
            String::with_capacity(self.base_uri.len() + self.doc_path.len() + doc_id.as_str().len());
        url.push_str(&self.base_uri);
        url.push_str(&self.doc_path);
        url.push_str(&percent_encode(doc_id.as_str()));
        url
    }

    /// Reverses [`encode`](Self::encode) given a request path.
    ///
    /// # Errors
    ///
    /// Returns [`MalformedIdError`] if the path lies outside the document
    /// base, contains an invalid percent escape, is not valid UTF-8, or
    /// decodes to an empty identifier.
    pub fn decode(&self, path: &str) -> Result<DocId, MalformedIdError> {
        let encoded = path
            .strip_prefix(self.doc_path.as_str())
            .ok_or_else(|| MalformedIdError::OutsideBase {
                path: path.to_string(),
                base: self.doc_path.clone(),
            })?;

        let mut bytes = Vec::with_capacity(encoded.len());
        let mut chars = encoded.bytes();
        while let Some(b) = chars.next() {
            if b == b'%' {
                let hi = chars.next();
                let lo = chars.next();
                let value = match (hi, lo) {
                    (Some(hi), Some(lo)) => {
                        let hex = [hi, lo];
                        std::str::from_utf8(&hex)
                            .ok()
                            .and_then(|s| u8::from_str_radix(s, 16).ok())
                    }
                    _ => None,
                };
                match value {
                    Some(v) => bytes.push(v),
                    None => {
                        return Err(MalformedIdError::BadEscape {
                            path: path.to_string(),
                        })
                    }
                }
            } else {
                bytes.push(b);
            }
        }

        let unique_id = String::from_utf8(bytes).map_err(|_| MalformedIdError::BadEscape {
            path: path.to_string(),
        })?;
        if unique_id.is_empty() {
            return Err(MalformedIdError::Empty {
                path: path.to_string(),
            });
        }
        Ok(DocId::new(unique_id))
    }

    /// The configured document path prefix, with surrounding slashes.
    pub fn doc_path(&self) -> &str {
        &self.doc_path
    }

    /// The configured server base URI.
    pub fn base_uri(&self) -> &str {
        &self.base_uri
    }
}

/// Percent-escapes every byte that is not an unreserved URL character.
pub fn percent_encode(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for byte in input.bytes() {
        if is_unreserved(byte) {
            out.push(byte as char);
        } else {
            out.push('%');
            out.push_str(&format!("{byte:02X}"));
        }
    }
    out
}

/// Unreserved URL characters per RFC 3986 §2.3.
fn is_unreserved(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'_' | b'.' | b'~')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codec() -> DocIdCodec {
        DocIdCodec::new("http://adaptor.example.com:5678", "/doc/")
    }

    #[test]
    fn encode_prepends_base_and_path() {
        let url = codec().encode(&DocId::new("hello"));
        assert_eq!(url, "http://adaptor.example.com:5678/doc/hello");
    }

    #[test]
    fn encode_escapes_reserved_bytes() {
        let url = codec().encode(&DocId::new("a/b c?d"));
        assert_eq!(url, "http://adaptor.example.com:5678/doc/a%2Fb%20c%3Fd");
    }

    #[test]
    fn roundtrip_preserves_identifier() {
        let cases = [
            "hello",
            "a/b/c",
            "spaces and ? marks",
            "ünïcode-Ид",
            "trailing/",
            "%already%escaped",
            "..",
        ];
        let codec = codec();
        for case in cases {
            let id = DocId::new(case);
            let url = codec.encode(&id);
            let path = url.strip_prefix(codec.base_uri()).unwrap();
            assert_eq!(codec.decode(path).unwrap(), id, "case: {case}");
        }
    }

    #[test]
    fn decode_rejects_path_outside_base() {
        let err = codec().decode("/other/hello").unwrap_err();
        assert!(matches!(err, MalformedIdError::OutsideBase { .. }));
    }

    #[test]
    fn decode_rejects_empty_identifier() {
        let err = codec().decode("/doc/").unwrap_err();
        assert!(matches!(err, MalformedIdError::Empty { .. }));
    }

    #[test]
    fn decode_rejects_truncated_escape() {
        let err = codec().decode("/doc/bad%2").unwrap_err();
        assert!(matches!(err, MalformedIdError::BadEscape { .. }));
    }

    #[test]
    fn doc_path_is_normalized() {
        let codec = DocIdCodec::new("http://h:1/", "doc");
        assert_eq!(codec.doc_path(), "/doc/");
        assert_eq!(codec.encode(&DocId::new("x")), "http://h:1/doc/x");
    }
}
