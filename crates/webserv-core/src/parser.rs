// src/parser.rs
use crate::http::{Method, RequestData, host_name};
use memchr::memmem;
use percent_encoding::percent_decode_str;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("request is incomplete")]
    Incomplete,
    #[error("request is malformed")]
    Malformed,
    #[error("request header block exceeds 16 KiB")]
    TooLarge,
}

/// Largest accepted request line + header block, terminator included.
pub const MAX_HEAD_SIZE: usize = 16 * 1024;
/// Longest accepted chunk-size line (hex digits plus extensions).
const MAX_CHUNK_LINE: usize = 1024;

/// Parsed request line and header block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Head {
    pub method: Method,
    pub target: String,
    pub path: String,
    pub query: String,
    pub version: String,
    pub headers: Vec<(String, String)>,
    /// Bytes occupied by the head, including the blank line.
    pub len: usize,
}

impl Head {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn host(&self) -> Option<&str> {
        self.header("host").map(host_name)
    }

    pub fn into_request(self, body: Vec<u8>) -> RequestData {
        RequestData {
            method: self.method,
            target: self.target,
            path: self.path,
            query: self.query,
            version: self.version,
            headers: self.headers,
            body,
            malformed: false,
        }
    }
}

/// How the message body is delimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    None,
    Length(usize),
    Chunked,
}

/// Progress through a chunked body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChunkScan {
    /// Payload bytes announced so far, counting the full size of a chunk
    /// whose data has only partly arrived.
    pub declared_len: usize,
    /// Offset just past the terminating chunk and trailers, once seen.
    pub end: Option<usize>,
}

/// Offset just past the `\r\n\r\n` that ends the header block.
#[inline]
pub fn find_head_end(buf: &[u8]) -> Option<usize> {
    memmem::find(buf, b"\r\n\r\n").map(|pos| pos + 4)
}

/// Parse the request line and headers at the start of `buf`.
pub fn parse_head(buf: &[u8]) -> Result<Head, ParseError> {
    let end = match find_head_end(buf) {
        Some(end) if end > MAX_HEAD_SIZE => return Err(ParseError::TooLarge),
        Some(end) => end,
        None if buf.len() > MAX_HEAD_SIZE => return Err(ParseError::TooLarge),
        None => return Err(ParseError::Incomplete),
    };

    let text = std::str::from_utf8(&buf[..end - 4]).map_err(|_| ParseError::Malformed)?;
    let mut lines = text.split("\r\n");
    let request_line = lines.next().ok_or(ParseError::Malformed)?;

    let mut parts = request_line.split(' ');
    let (Some(method), Some(target), Some(version), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(ParseError::Malformed);
    };

    if method.is_empty() || !method.bytes().all(|b| b.is_ascii_uppercase()) {
        return Err(ParseError::Malformed);
    }
    if version != "HTTP/1.1" && version != "HTTP/1.0" {
        return Err(ParseError::Malformed);
    }
    if !target.starts_with('/') {
        return Err(ParseError::Malformed);
    }

    let (raw_path, query) = match target.split_once('?') {
        Some((p, q)) => (p, q),
        None => (target, ""),
    };
    let path = percent_decode_str(raw_path)
        .decode_utf8()
        .map_err(|_| ParseError::Malformed)?;
    if path.contains('\0') {
        return Err(ParseError::Malformed);
    }

    let mut headers = Vec::new();
    for line in lines {
        let (name, value) = line.split_once(':').ok_or(ParseError::Malformed)?;
        if name.is_empty() || name.bytes().any(|b| b.is_ascii_whitespace()) {
            return Err(ParseError::Malformed);
        }
        headers.push((name.to_ascii_lowercase(), value.trim().to_string()));
    }

    Ok(Head {
        method: Method::from_bytes(method.as_bytes()),
        target: target.to_string(),
        path: path.into_owned(),
        query: query.to_string(),
        version: version.to_string(),
        headers,
        len: end,
    })
}

/// Decide how the body following `head` is framed.
pub fn body_framing(head: &Head) -> Result<BodyFraming, ParseError> {
    let mut length: Option<usize> = None;
    let mut chunked = false;

    for (name, value) in &head.headers {
        match name.as_str() {
            "content-length" => {
                let n = value.parse::<usize>().map_err(|_| ParseError::Malformed)?;
                if length.is_some_and(|prev| prev != n) {
                    return Err(ParseError::Malformed);
                }
                length = Some(n);
            }
            "transfer-encoding" => {
                let last = value.rsplit(',').next().unwrap_or("").trim();
                if !last.eq_ignore_ascii_case("chunked") {
                    return Err(ParseError::Malformed);
                }
                chunked = true;
            }
            _ => {}
        }
    }

    match (chunked, length) {
        (true, Some(_)) => Err(ParseError::Malformed),
        (true, None) => Ok(BodyFraming::Chunked),
        (false, Some(n)) => Ok(BodyFraming::Length(n)),
        (false, None) => Ok(BodyFraming::None),
    }
}

fn walk_chunks(buf: &[u8], mut sink: impl FnMut(&[u8])) -> Result<ChunkScan, ParseError> {
    let mut scan = ChunkScan::default();
    let mut pos = 0;

    loop {
        let Some(line_len) = memmem::find(&buf[pos..], b"\r\n") else {
            if buf.len() - pos > MAX_CHUNK_LINE {
                return Err(ParseError::Malformed);
            }
            return Ok(scan);
        };
        if line_len > MAX_CHUNK_LINE {
            return Err(ParseError::Malformed);
        }
        let line = &buf[pos..pos + line_len];
        let digits = line.split(|&b| b == b';').next().unwrap_or(line);
        let digits = std::str::from_utf8(digits)
            .map_err(|_| ParseError::Malformed)?
            .trim();
        if digits.is_empty() || digits.len() > 15 {
            return Err(ParseError::Malformed);
        }
        let size = usize::from_str_radix(digits, 16).map_err(|_| ParseError::Malformed)?;
        pos += line_len + 2;

        if size == 0 {
            // Trailer section ends with an empty line.
            loop {
                let Some(trailer_len) = memmem::find(&buf[pos..], b"\r\n") else {
                    return Ok(scan);
                };
                pos += trailer_len + 2;
                if trailer_len == 0 {
                    scan.end = Some(pos);
                    return Ok(scan);
                }
            }
        }

        scan.declared_len = scan.declared_len.saturating_add(size);
        if buf.len() < pos + size + 2 {
            return Ok(scan);
        }
        if &buf[pos + size..pos + size + 2] != b"\r\n" {
            return Err(ParseError::Malformed);
        }
        sink(&buf[pos..pos + size]);
        pos += size + 2;
    }
}

/// Measure a chunked body without decoding it.
pub fn scan_chunked(buf: &[u8]) -> Result<ChunkScan, ParseError> {
    walk_chunks(buf, |_| {})
}

/// Decode a complete chunked body. Returns the payload and the number of
/// bytes of `buf` it occupied.
pub fn decode_chunked(buf: &[u8]) -> Result<(Vec<u8>, usize), ParseError> {
    let mut body = Vec::new();
    let scan = walk_chunks(buf, |chunk| body.extend_from_slice(chunk))?;
    match scan.end {
        Some(end) => Ok((body, end)),
        None => Err(ParseError::Incomplete),
    }
}

/// Encode `body` as chunks of at most `chunk_size` bytes plus the last chunk.
pub fn encode_chunked(body: &[u8], chunk_size: usize) -> Vec<u8> {
    let chunk_size = if chunk_size == 0 { body.len().max(1) } else { chunk_size };
    let mut out = Vec::with_capacity(body.len() + 16);
    for chunk in body.chunks(chunk_size) {
        out.extend_from_slice(format!("{:x}\r\n", chunk.len()).as_bytes());
        out.extend_from_slice(chunk);
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"0\r\n\r\n");
    out
}

/// Parse one complete request from the front of `buf`.
/// Returns the request and the total number of bytes consumed.
pub fn parse_request(buf: &[u8]) -> Result<(RequestData, usize), ParseError> {
    let head = parse_head(buf)?;
    let start = head.len;

    match body_framing(&head)? {
        BodyFraming::None => Ok((head.into_request(Vec::new()), start)),
        BodyFraming::Length(n) => {
            if buf.len() - start < n {
                return Err(ParseError::Incomplete);
            }
            let body = buf[start..start + n].to_vec();
            Ok((head.into_request(body), start + n))
        }
        BodyFraming::Chunked => {
            let (body, used) = decode_chunked(&buf[start..])?;
            Ok((head.into_request(body), start + used))
        }
    }
}
