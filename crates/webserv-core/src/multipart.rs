// src/multipart.rs
use crate::parser::ParseError;
use memchr::memmem;

#[derive(Debug)]
pub struct Part<'a> {
    pub name: Option<&'a str>,
    pub filename: Option<&'a str>,
    pub content_type: Option<&'a str>,
    pub body: &'a [u8],
}

/// Extract the boundary parameter from a `multipart/form-data` content type.
pub fn boundary(content_type: &str) -> Option<&str> {
    let (mime, params) = content_type.split_once(';')?;
    if !mime.trim().eq_ignore_ascii_case("multipart/form-data") {
        return None;
    }
    params.split(';').find_map(|param| {
        let (key, value) = param.split_once('=')?;
        if !key.trim().eq_ignore_ascii_case("boundary") {
            return None;
        }
        let value = value.trim().trim_matches('"');
        (!value.is_empty()).then_some(value)
    })
}

pub struct Multipart<'a> {
    body: &'a [u8],
    boundary_marker: Vec<u8>,
}

impl<'a> Multipart<'a> {
    pub fn new(body: &'a [u8], boundary: &str) -> Self {
        let mut marker = Vec::with_capacity(boundary.len() + 2);
        marker.extend_from_slice(b"--");
        marker.extend_from_slice(boundary.as_bytes());
        Self {
            body,
            boundary_marker: marker,
        }
    }
}

// Pull `key="value"` out of a Content-Disposition line.
fn disposition_param<'a>(line: &'a str, lower: &str, key: &str) -> Option<&'a str> {
    let needle = format!("; {key}=\"");
    let idx = lower.find(&needle)? + needle.len();
    let rest = &line[idx..];
    rest.find('"').map(|end| &rest[..end])
}

impl<'a> Iterator for Multipart<'a> {
    type Item = Result<Part<'a>, ParseError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.body.is_empty() {
            return None;
        }

        let Some(mut start) = memmem::find(self.body, &self.boundary_marker) else {
            self.body = &[];
            return Some(Err(ParseError::Malformed));
        };
        start += self.boundary_marker.len();

        // Check for -- (end of multiparts)
        if self.body[start..].starts_with(b"--") {
            self.body = &[];
            return None;
        }

        if self.body[start..].starts_with(b"\r\n") {
            start += 2;
        }

        // Parse headers until \r\n\r\n
        let Some(header_end) = memmem::find(&self.body[start..], b"\r\n\r\n") else {
            self.body = &[];
            return Some(Err(ParseError::Incomplete));
        };
        let header_slice = &self.body[start..start + header_end];
        let body_start = start + header_end + 4;

        // find next boundary to determine body end
        let body_end = match memmem::find(&self.body[body_start..], &self.boundary_marker) {
            Some(pos) => body_start + pos,
            None => {
                self.body = &[];
                return Some(Err(ParseError::Incomplete));
            }
        };

        // Body ends with \r\n before the boundary
        let actual_body_end = if self.body[..body_end].ends_with(b"\r\n") && body_end - 2 >= body_start {
            body_end - 2
        } else {
            body_end
        };
        let body_slice = &self.body[body_start..actual_body_end];

        self.body = &self.body[body_end..];

        let Ok(headers_str) = std::str::from_utf8(header_slice) else {
            self.body = &[];
            return Some(Err(ParseError::Malformed));
        };

        let mut name = None;
        let mut filename = None;
        let mut content_type = None;
        for line in headers_str.split("\r\n") {
            let lower = line.to_ascii_lowercase();
            if lower.starts_with("content-disposition:") {
                name = disposition_param(line, &lower, "name");
                filename = disposition_param(line, &lower, "filename");
            } else if lower.starts_with("content-type:") {
                content_type = Some(line[13..].trim());
            }
        }

        Some(Ok(Part {
            name,
            filename,
            content_type,
            body: body_slice,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_file_and_field_parts() {
        let body = b"--XyZ\r\n\
Content-Disposition: form-data; name=\"note\"\r\n\r\n\
hi there\r\n\
--XyZ\r\n\
Content-Disposition: form-data; name=\"file\"; filename=\"a.txt\"\r\n\
Content-Type: text/plain\r\n\r\n\
line1\r\nline2\r\n\
--XyZ--\r\n";

        let parts: Vec<_> = Multipart::new(body, "XyZ").map(Result::unwrap).collect();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].name, Some("note"));
        assert_eq!(parts[0].filename, None);
        assert_eq!(parts[0].body, b"hi there");
        assert_eq!(parts[1].name, Some("file"));
        assert_eq!(parts[1].filename, Some("a.txt"));
        assert_eq!(parts[1].content_type, Some("text/plain"));
        assert_eq!(parts[1].body, b"line1\r\nline2");
    }

    #[test]
    fn truncated_body_is_incomplete() {
        let body = b"--b\r\nContent-Disposition: form-data; name=\"f\"\r\n\r\nno end";
        let mut parts = Multipart::new(body, "b");
        assert!(matches!(parts.next(), Some(Err(ParseError::Incomplete))));
        assert!(parts.next().is_none());
    }

    #[test]
    fn boundary_from_content_type() {
        assert_eq!(boundary("multipart/form-data; boundary=abc"), Some("abc"));
        assert_eq!(boundary("multipart/form-data; charset=x; boundary=\"q q\""), Some("q q"));
        assert_eq!(boundary("text/plain; boundary=abc"), None);
        assert_eq!(boundary("multipart/form-data"), None);
    }
}
