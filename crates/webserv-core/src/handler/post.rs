use super::exchange::Exchange;
use super::{HandlerCtx, Progress};
use crate::http::RequestData;
use crate::multipart::{self, Multipart};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::warn;

static UPLOAD_SEQ: AtomicU64 = AtomicU64::new(0);

/// One file extracted from a request body.
#[derive(Debug, PartialEq, Eq)]
struct Upload {
    name: String,
    bytes: Vec<u8>,
}

pub struct PostHandler {
    pub(super) exchange: Exchange,
}

impl PostHandler {
    pub fn new(request: RequestData) -> Self {
        Self {
            exchange: Exchange::new(request),
        }
    }

    /// Store the body (or each multipart file) under the upload directory.
    pub fn generate_response(&mut self, ctx: &mut HandlerCtx<'_>) -> Progress {
        self.exchange.begin();
        if let Err(progress) = self.exchange.route(ctx) {
            return progress;
        }

        let uploads = match extract_uploads(&self.exchange.request) {
            Ok(uploads) => uploads,
            Err(status) => return self.exchange.fail(status, ctx),
        };

        let dir = ctx.location.upload_dir();
        if let Err(e) = std::fs::create_dir_all(&dir) {
            warn!(dir = %dir.display(), "cannot create upload directory: {}", e);
            return self.exchange.fail(500, ctx);
        }

        let store = ctx.location.upload_store.trim_matches('/');
        let mut taken = HashSet::new();
        let planned = uploads
            .into_iter()
            .map(|upload| {
                let name = unique_name(upload.name, &mut taken);
                let uri = if store.is_empty() {
                    format!("/{name}")
                } else {
                    format!("/{store}/{name}")
                };
                (dir.join(&name), uri, upload.bytes)
            })
            .collect::<Vec<(PathBuf, String, Vec<u8>)>>();
        self.exchange.store_uploads(planned, ctx)
    }
}

fn media_type(content_type: Option<&str>) -> Option<String> {
    content_type.map(|ct| {
        ct.split(';')
            .next()
            .unwrap_or("")
            .trim()
            .to_ascii_lowercase()
    })
}

/// Split the request body into files to store. `Err` is the status to
/// answer with.
fn extract_uploads(request: &RequestData) -> Result<Vec<Upload>, u16> {
    let content_type = request.header("content-type");
    match media_type(content_type).as_deref() {
        None | Some("") | Some("text/plain") => Ok(vec![Upload {
            name: generated_name("txt"),
            bytes: request.body.clone(),
        }]),
        Some("application/octet-stream") => Ok(vec![Upload {
            name: generated_name("bin"),
            bytes: request.body.clone(),
        }]),
        Some("application/x-www-form-urlencoded") => {
            let pairs: Vec<(String, String)> =
                serde_urlencoded::from_bytes(&request.body).map_err(|_| 400u16)?;
            let mut text = String::new();
            for (key, value) in pairs {
                text.push_str(&key);
                text.push('=');
                text.push_str(&value);
                text.push('\n');
            }
            Ok(vec![Upload {
                name: generated_name("txt"),
                bytes: text.into_bytes(),
            }])
        }
        Some("multipart/form-data") => {
            let boundary = content_type.and_then(multipart::boundary).ok_or(400u16)?;
            let mut uploads = Vec::new();
            for part in Multipart::new(&request.body, boundary) {
                let part = part.map_err(|_| 400u16)?;
                let Some(filename) = part.filename else {
                    continue;
                };
                let name = sanitize_filename(filename).unwrap_or_else(|| generated_name("bin"));
                uploads.push(Upload {
                    name,
                    bytes: part.body.to_vec(),
                });
            }
            if uploads.is_empty() {
                return Err(400);
            }
            Ok(uploads)
        }
        Some(_) => Err(415),
    }
}

/// Final path component of a client-supplied name, if it is a usable one.
fn sanitize_filename(name: &str) -> Option<String> {
    let base = name.rsplit(['/', '\\']).next()?.trim();
    if base.is_empty() || base == "." || base == ".." {
        return None;
    }
    Some(base.to_string())
}

/// `name`, or `stem_N.ext` when an earlier part of the same request already
/// claimed it.
fn unique_name(name: String, taken: &mut HashSet<String>) -> String {
    if taken.insert(name.clone()) {
        return name;
    }
    let (stem, ext) = match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => (stem, Some(ext)),
        _ => (name.as_str(), None),
    };
    let mut n = 1u32;
    loop {
        let candidate = match ext {
            Some(ext) => format!("{stem}_{n}.{ext}"),
            None => format!("{stem}_{n}"),
        };
        if taken.insert(candidate.clone()) {
            return candidate;
        }
        n += 1;
    }
}

fn generated_name(ext: &str) -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    let seq = UPLOAD_SEQ.fetch_add(1, Ordering::Relaxed);
    format!("upload_{millis}_{seq}.{ext}")
}
