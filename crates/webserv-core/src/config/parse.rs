use super::{Config, ConfigError, Location, Redirect, ServerConfig};
use crate::http::Method;
use std::collections::HashSet;
use std::net::{SocketAddr, ToSocketAddrs};
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Tok {
    Word(String),
    Semi,
    Open,
    Close,
}

#[derive(Debug)]
struct Token {
    tok: Tok,
    line: usize,
}

fn tokenize(src: &str) -> Result<Vec<Token>, ConfigError> {
    let mut tokens = Vec::new();
    let mut chars = src.chars().peekable();
    let mut line = 1;

    while let Some(c) = chars.next() {
        match c {
            '\n' => line += 1,
            c if c.is_whitespace() => {}
            '#' => {
                for c in chars.by_ref() {
                    if c == '\n' {
                        line += 1;
                        break;
                    }
                }
            }
            ';' => tokens.push(Token { tok: Tok::Semi, line }),
            '{' => tokens.push(Token { tok: Tok::Open, line }),
            '}' => tokens.push(Token { tok: Tok::Close, line }),
            '"' | '\'' => {
                let start_line = line;
                let mut word = String::new();
                let mut closed = false;
                for n in chars.by_ref() {
                    if n == c {
                        closed = true;
                        break;
                    }
                    if n == '\n' {
                        line += 1;
                    }
                    word.push(n);
                }
                if !closed {
                    return Err(ConfigError::syntax(start_line, "unterminated quoted string"));
                }
                tokens.push(Token {
                    tok: Tok::Word(word),
                    line: start_line,
                });
            }
            _ => {
                let mut word = String::from(c);
                while let Some(&n) = chars.peek() {
                    if n.is_whitespace() || matches!(n, ';' | '{' | '}' | '#' | '"' | '\'') {
                        break;
                    }
                    word.push(n);
                    chars.next();
                }
                tokens.push(Token {
                    tok: Tok::Word(word),
                    line,
                });
            }
        }
    }
    Ok(tokens)
}

/// One `name args... ;` or `name args... { ... }` statement.
#[derive(Debug)]
struct Directive {
    name: String,
    args: Vec<String>,
    block: Option<Vec<Directive>>,
    line: usize,
}

struct TreeParser {
    tokens: Vec<Token>,
    pos: usize,
}

impl TreeParser {
    fn parse_block(&mut self, nested: bool, open_line: usize) -> Result<Vec<Directive>, ConfigError> {
        let mut directives = Vec::new();
        loop {
            let Some(token) = self.tokens.get(self.pos) else {
                if nested {
                    return Err(ConfigError::syntax(open_line, "unclosed '{'"));
                }
                return Ok(directives);
            };
            let line = token.line;
            let name = match &token.tok {
                Tok::Word(w) => w.clone(),
                Tok::Close if nested => {
                    self.pos += 1;
                    return Ok(directives);
                }
                Tok::Close => return Err(ConfigError::syntax(line, "unexpected '}'")),
                Tok::Semi => return Err(ConfigError::syntax(line, "unexpected ';'")),
                Tok::Open => return Err(ConfigError::syntax(line, "unexpected '{'")),
            };
            self.pos += 1;

            let mut args = Vec::new();
            loop {
                let Some(token) = self.tokens.get(self.pos) else {
                    return Err(ConfigError::syntax(line, format!("'{name}' directive is not terminated")));
                };
                let (tok, tok_line) = (token.tok.clone(), token.line);
                self.pos += 1;
                match tok {
                    Tok::Word(w) => args.push(w),
                    Tok::Semi => {
                        directives.push(Directive { name, args, block: None, line });
                        break;
                    }
                    Tok::Open => {
                        let block = self.parse_block(true, tok_line)?;
                        directives.push(Directive {
                            name,
                            args,
                            block: Some(block),
                            line,
                        });
                        break;
                    }
                    Tok::Close => {
                        return Err(ConfigError::syntax(line, format!("'{name}' directive is not terminated")));
                    }
                }
            }
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Context {
    Global,
    Server,
    Location,
}

impl Context {
    fn name(self) -> &'static str {
        match self {
            Context::Global => "global",
            Context::Server => "server",
            Context::Location => "location",
        }
    }

    fn allows(self, directive: &str) -> bool {
        const COMMON: &[&str] = &["root", "index", "client_max_body_size", "autoindex", "error_page"];
        if COMMON.contains(&directive) {
            return true;
        }
        match self {
            Context::Global => directive == "server",
            Context::Server => matches!(directive, "listen" | "server_name" | "cgi_handler" | "location"),
            Context::Location => matches!(
                directive,
                "cgi_handler" | "limit_except" | "upload_store" | "return"
            ),
        }
    }
}

/// Per-context bookkeeping for duplicate detection and list replacement.
#[derive(Default)]
struct Seen {
    singles: HashSet<&'static str>,
    index: bool,
    cgi_exts: HashSet<String>,
}

impl Seen {
    fn once(&mut self, d: &Directive, name: &'static str) -> Result<(), ConfigError> {
        if !self.singles.insert(name) {
            return Err(ConfigError::syntax(d.line, format!("'{name}' directive is duplicate")));
        }
        Ok(())
    }
}

fn expect_args(d: &Directive, range: std::ops::RangeInclusive<usize>) -> Result<(), ConfigError> {
    if !range.contains(&d.args.len()) {
        return Err(ConfigError::syntax(
            d.line,
            format!("'{}' directive has an invalid number of arguments", d.name),
        ));
    }
    Ok(())
}

/// Apply a settings directive to `loc`. Context checks happen in the caller.
fn apply_scoped(d: &Directive, loc: &mut Location, seen: &mut Seen) -> Result<(), ConfigError> {
    match d.name.as_str() {
        "root" => {
            seen.once(d, "root")?;
            expect_args(d, 1..=1)?;
            loc.root = PathBuf::from(&d.args[0]);
        }
        "index" => {
            expect_args(d, 1..=usize::MAX)?;
            if !seen.index {
                loc.index.clear();
                seen.index = true;
            }
            loc.index.extend(d.args.iter().cloned());
        }
        "client_max_body_size" => {
            seen.once(d, "client_max_body_size")?;
            expect_args(d, 1..=1)?;
            loc.client_max_body_size = parse_size(&d.args[0])
                .ok_or_else(|| ConfigError::syntax(d.line, format!("invalid size '{}'", d.args[0])))?;
        }
        "autoindex" => {
            seen.once(d, "autoindex")?;
            expect_args(d, 1..=1)?;
            loc.autoindex = match d.args[0].as_str() {
                "on" => true,
                "off" => false,
                other => return Err(ConfigError::syntax(d.line, format!("invalid autoindex value '{other}'"))),
            };
        }
        "error_page" => {
            expect_args(d, 2..=usize::MAX)?;
            let Some((uri, codes)) = d.args.split_last() else {
                return Ok(());
            };
            for code in codes {
                let status = code
                    .parse::<u16>()
                    .ok()
                    .filter(|s| (300..=599).contains(s))
                    .ok_or_else(|| ConfigError::syntax(d.line, format!("invalid error_page code '{code}'")))?;
                loc.error_pages.insert(status, uri.clone());
            }
        }
        "cgi_handler" => {
            expect_args(d, 2..=2)?;
            let ext = if d.args[0].starts_with('.') {
                d.args[0].clone()
            } else {
                format!(".{}", d.args[0])
            };
            if ext.len() < 2 {
                return Err(ConfigError::syntax(d.line, "cgi_handler extension is empty"));
            }
            if !seen.cgi_exts.insert(ext.clone()) {
                return Err(ConfigError::syntax(d.line, format!("cgi_handler for '{ext}' is duplicate")));
            }
            let interpreter = PathBuf::from(&d.args[1]);
            let executable = std::fs::metadata(&interpreter)
                .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
                .unwrap_or(false);
            if !executable {
                return Err(ConfigError::syntax(
                    d.line,
                    format!("cgi_handler interpreter '{}' does not exist or is not executable", d.args[1]),
                ));
            }
            loc.cgi_handlers.insert(ext, interpreter);
        }
        "limit_except" => {
            seen.once(d, "limit_except")?;
            expect_args(d, 1..=usize::MAX)?;
            let mut methods = Vec::new();
            for arg in &d.args {
                let method = Method::from_bytes(arg.to_ascii_uppercase().as_bytes());
                if method == Method::Unknown {
                    return Err(ConfigError::syntax(d.line, format!("limit_except: invalid method '{arg}'")));
                }
                if !methods.contains(&method) {
                    methods.push(method);
                }
            }
            loc.limit_except = methods;
        }
        "upload_store" => {
            seen.once(d, "upload_store")?;
            expect_args(d, 1..=1)?;
            loc.upload_store = d.args[0].clone();
        }
        "return" => {
            seen.once(d, "return")?;
            expect_args(d, 1..=2)?;
            let status = d.args[0]
                .parse::<u16>()
                .ok()
                .filter(|s| *s <= 999)
                .ok_or_else(|| ConfigError::syntax(d.line, format!("invalid return code '{}'", d.args[0])))?;
            loc.redirect = Some(Redirect {
                status,
                target: d.args.get(1).cloned(),
            });
        }
        other => return Err(ConfigError::syntax(d.line, format!("unknown directive '{other}'"))),
    }
    Ok(())
}

/// `10`, `10k`, `10m`, `10g` (decimal multipliers).
fn parse_size(value: &str) -> Option<u64> {
    let (digits, multiplier) = match value.chars().last()? {
        'k' | 'K' => (&value[..value.len() - 1], 1_000),
        'm' | 'M' => (&value[..value.len() - 1], 1_000_000),
        'g' | 'G' => (&value[..value.len() - 1], 1_000_000_000),
        _ => (value, 1),
    };
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse::<u64>().ok()?.checked_mul(multiplier)
}

/// `port`, `host`, `host:port` or `[v6]:port`.
fn parse_listen(d: &Directive, value: &str) -> Result<SocketAddr, ConfigError> {
    let invalid = || ConfigError::syntax(d.line, format!("invalid listen value '{value}'"));

    let (host, port) = if let Some(rest) = value.strip_prefix('[') {
        let (host, tail) = rest.split_once(']').ok_or_else(invalid)?;
        match tail {
            "" => (host, "80"),
            t => (host, t.strip_prefix(':').ok_or_else(invalid)?),
        }
    } else if let Some((host, port)) = value.rsplit_once(':') {
        (host, port)
    } else if value.bytes().all(|b| b.is_ascii_digit()) {
        ("0.0.0.0", value)
    } else {
        (value, "80")
    };

    let host = if host == "*" || host.is_empty() { "0.0.0.0" } else { host };
    let port: u16 = port.parse().map_err(|_| invalid())?;

    (host, port)
        .to_socket_addrs()
        .map_err(|e| ConfigError::syntax(d.line, format!("cannot resolve listen address '{value}': {e}")))?
        .next()
        .ok_or_else(invalid)
}

fn build_location(d: &Directive, parent: &Location, body: &[Directive]) -> Result<Location, ConfigError> {
    let mut loc = parent.clone();
    loc.prefix = d.args[0].clone();
    let mut seen = Seen::default();
    for child in body {
        if !Context::Location.allows(&child.name) {
            return Err(ConfigError::syntax(
                child.line,
                format!("'{}' directive is not allowed in location context", child.name),
            ));
        }
        apply_scoped(child, &mut loc, &mut seen)?;
    }
    Ok(loc)
}

fn build_server(global: &Location, body: &[Directive]) -> Result<ServerConfig, ConfigError> {
    let mut defaults = global.clone();
    let mut seen = Seen::default();
    let mut listen: Vec<SocketAddr> = Vec::new();
    let mut server_names = Vec::new();
    let mut location_blocks = Vec::new();

    for d in body {
        if !Context::Server.allows(&d.name) {
            return Err(ConfigError::syntax(
                d.line,
                format!("'{}' directive is not allowed in server context", d.name),
            ));
        }
        match d.name.as_str() {
            "listen" => {
                expect_args(d, 1..=1)?;
                let addr = parse_listen(d, &d.args[0])?;
                if listen.contains(&addr) {
                    return Err(ConfigError::syntax(d.line, format!("listen '{}' is duplicate", d.args[0])));
                }
                listen.push(addr);
            }
            "server_name" => {
                expect_args(d, 1..=usize::MAX)?;
                server_names.extend(d.args.iter().cloned());
            }
            "location" => {
                expect_args(d, 1..=1)?;
                let Some(block) = &d.block else {
                    return Err(ConfigError::syntax(d.line, "'location' requires a block"));
                };
                location_blocks.push((d, block));
            }
            _ => {
                apply_scoped(d, &mut defaults, &mut seen)?;
            }
        }
        if d.block.is_some() && d.name != "location" {
            return Err(ConfigError::syntax(d.line, format!("'{}' does not take a block", d.name)));
        }
    }

    if listen.is_empty() {
        listen.push(SocketAddr::from(([0, 0, 0, 0], 80)));
    }

    // Locations see every server-level value regardless of declaration order.
    let mut locations: Vec<Location> = Vec::new();
    for (d, block) in location_blocks {
        if locations.iter().any(|l| l.prefix == d.args[0]) {
            return Err(ConfigError::syntax(d.line, format!("location '{}' is duplicate", d.args[0])));
        }
        locations.push(build_location(d, &defaults, block)?);
    }

    Ok(ServerConfig {
        listen,
        server_names,
        defaults,
        locations,
    })
}

pub(super) fn parse_config(src: &str) -> Result<Config, ConfigError> {
    let mut parser = TreeParser {
        tokens: tokenize(src)?,
        pos: 0,
    };
    let tree = parser.parse_block(false, 0)?;

    let mut global = Location::default();
    let mut seen = Seen::default();
    let mut server_blocks = Vec::new();

    for d in &tree {
        if !Context::Global.allows(&d.name) {
            return Err(ConfigError::syntax(
                d.line,
                format!("'{}' directive is not allowed in {} context", d.name, Context::Global.name()),
            ));
        }
        if d.name == "server" {
            expect_args(d, 0..=0)?;
            let Some(block) = &d.block else {
                return Err(ConfigError::syntax(d.line, "'server' requires a block"));
            };
            server_blocks.push(block);
            continue;
        }
        if d.block.is_some() {
            return Err(ConfigError::syntax(d.line, format!("'{}' does not take a block", d.name)));
        }
        apply_scoped(d, &mut global, &mut seen)?;
    }

    let servers = server_blocks
        .into_iter()
        .map(|block| build_server(&global, block))
        .collect::<Result<Vec<_>, _>>()?;
    if servers.is_empty() {
        return Err(ConfigError::NoServers);
    }
    Ok(Config { servers })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn syntax_line(src: &str) -> usize {
        match parse_config(src) {
            Err(ConfigError::Syntax { line, .. }) => line,
            other => panic!("expected syntax error, got {other:?}"),
        }
    }

    #[test]
    fn tokenizer_handles_quotes_and_comments() {
        let tokens = tokenize("root 'a b'; # trailing\nindex \"x;y\";").unwrap();
        let kinds: Vec<_> = tokens.into_iter().map(|t| (t.tok, t.line)).collect();
        assert_eq!(
            kinds,
            vec![
                (Tok::Word("root".into()), 1),
                (Tok::Word("a b".into()), 1),
                (Tok::Semi, 1),
                (Tok::Word("index".into()), 2),
                (Tok::Word("x;y".into()), 2),
                (Tok::Semi, 2),
            ]
        );
        assert!(tokenize("root 'open").is_err());
    }

    #[test]
    fn size_suffixes() {
        assert_eq!(parse_size("100"), Some(100));
        assert_eq!(parse_size("8k"), Some(8_000));
        assert_eq!(parse_size("3M"), Some(3_000_000));
        assert_eq!(parse_size("1g"), Some(1_000_000_000));
        assert_eq!(parse_size("k"), None);
        assert_eq!(parse_size("1.5m"), None);
    }

    #[test]
    fn listen_forms() {
        let config = parse_config(
            "server { listen 8080; listen 127.0.0.1:9090; listen localhost; listen [::1]:7070; }",
        )
        .unwrap();
        let listen = &config.servers[0].listen;
        assert_eq!(listen[0], "0.0.0.0:8080".parse().unwrap());
        assert_eq!(listen[1], "127.0.0.1:9090".parse().unwrap());
        assert_eq!(listen[2].port(), 80);
        assert_eq!(listen[3], "[::1]:7070".parse().unwrap());

        let config = parse_config("server { }").unwrap();
        assert_eq!(config.servers[0].listen, vec!["0.0.0.0:80".parse().unwrap()]);
    }

    #[test]
    fn rejects_bad_input() {
        assert_eq!(syntax_line("server {\n root a;\n root b;\n}"), 3);
        assert_eq!(syntax_line("server {\n listen 80;\n listen 80;\n}"), 3);
        assert_eq!(syntax_line("server {\n upload_store /x;\n}"), 2);
        assert_eq!(syntax_line("server {\n location /a { listen 80; }\n}"), 2);
        assert_eq!(syntax_line("server {\n location /a {}\n location /a {}\n}"), 3);
        assert_eq!(syntax_line("server {\n error_page 200 /x.html;\n}"), 2);
        assert_eq!(syntax_line("server {\n location / { limit_except FETCH; }\n}"), 2);
        assert_eq!(syntax_line("server {\n location / { return 1000; }\n}"), 2);
        assert_eq!(syntax_line("server {\n cgi_handler .py /nonexistent/python;\n}"), 2);
        assert_eq!(syntax_line("server {\n autoindex maybe;\n}"), 2);
        assert_eq!(syntax_line("server {\n root a\n}"), 2);
        assert_eq!(syntax_line("server {"), 1);
        assert_eq!(syntax_line("}"), 1);
        assert!(matches!(parse_config("root /x;"), Err(ConfigError::NoServers)));
    }

    #[test]
    fn cgi_handler_gets_leading_dot() {
        let config = parse_config("server { cgi_handler sh /bin/sh; }").unwrap();
        assert_eq!(
            config.servers[0].defaults.cgi_handlers.get(".sh"),
            Some(&PathBuf::from("/bin/sh"))
        );
    }

    #[test]
    fn index_replaces_inherited_list_once() {
        let config = parse_config(
            "index a.html;\nserver { index b.html; index c.html; location /x { } }",
        )
        .unwrap();
        let server = &config.servers[0];
        assert_eq!(server.defaults.index, vec!["b.html", "c.html"]);
        assert_eq!(server.locations[0].index, vec!["b.html", "c.html"]);
    }
}
