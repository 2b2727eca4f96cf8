// src/listing.rs
use percent_encoding::{AsciiSet, CONTROLS, utf8_percent_encode};
use std::fmt::Write;
use std::io;
use std::path::Path;

// Characters escaped inside a single href path segment.
const SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`')
    .add(b'{')
    .add(b'}')
    .add(b'/');

fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}

/// Render an HTML index of `dir`, linked relative to `request_path`.
/// Directories sort first and carry a trailing slash.
pub fn render(dir: &Path, request_path: &str) -> io::Result<String> {
    let mut entries = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
        entries.push((is_dir, name));
    }
    entries.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));

    let base = if request_path.ends_with('/') {
        request_path.to_string()
    } else {
        format!("{request_path}/")
    };
    let title = escape_html(&base);

    let mut html = String::with_capacity(256 + entries.len() * 64);
    let _ = write!(
        html,
        "<!DOCTYPE html>\n<html>\n<head><title>Index of {title}</title></head>\n<body>\n<h1>Index of {title}</h1>\n<hr>\n<ul>\n"
    );
    if base != "/" {
        html.push_str("<li><a href=\"../\">../</a></li>\n");
    }
    for (is_dir, name) in &entries {
        let slash = if *is_dir { "/" } else { "" };
        let href = utf8_percent_encode(name, SEGMENT);
        let _ = writeln!(
            html,
            "<li><a href=\"{base_href}{href}{slash}\">{label}{slash}</a></li>",
            base_href = utf8_percent_encode(&base, CONTROLS),
            label = escape_html(name),
        );
    }
    html.push_str("</ul>\n<hr>\n</body>\n</html>\n");
    Ok(html)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lists_directories_first() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b file.txt"), "x").unwrap();
        std::fs::write(dir.path().join("a.txt"), "x").unwrap();
        std::fs::create_dir(dir.path().join("zdir")).unwrap();

        let html = render(dir.path(), "/files").unwrap();
        assert!(html.contains("Index of /files/"));
        assert!(html.contains("<a href=\"../\">"));
        assert!(html.contains("<a href=\"/files/b%20file.txt\">b file.txt</a>"));

        let zdir = html.find("zdir/").unwrap();
        let a = html.find("a.txt").unwrap();
        assert!(zdir < a);
    }

    #[test]
    fn escapes_markup_in_names() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("<x>.html"), "").unwrap();
        let html = render(dir.path(), "/").unwrap();
        assert!(html.contains("&lt;x&gt;.html"));
        assert!(!html.contains("href=\"../\""));
    }

    #[test]
    fn missing_directory_is_an_error() {
        assert!(render(Path::new("/definitely/not/here"), "/").is_err());
    }
}
