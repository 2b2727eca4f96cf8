use proptest::prelude::*;
use std::path::Path;
use webserv_core::handler::confine;
use webserv_core::parser::{ParseError, encode_chunked, parse_request};

fn with_length(body: &[u8]) -> Vec<u8> {
    let mut raw = format!(
        "POST /upload HTTP/1.1\r\nHost: x\r\nContent-Length: {}\r\n\r\n",
        body.len()
    )
    .into_bytes();
    raw.extend_from_slice(body);
    raw
}

proptest! {
    #[test]
    fn content_length_request_completes_exactly(
        body in proptest::collection::vec(any::<u8>(), 0..512),
        cut in 0usize..1024,
    ) {
        let raw = with_length(&body);
        let (request, consumed) = parse_request(&raw).unwrap();
        prop_assert_eq!(consumed, raw.len());
        prop_assert_eq!(request.body, body);

        let cut = cut % raw.len();
        prop_assert_eq!(parse_request(&raw[..cut]), Err(ParseError::Incomplete));
    }

    #[test]
    fn chunked_body_round_trips(
        body in proptest::collection::vec(any::<u8>(), 0..2048),
        chunk in 1usize..300,
    ) {
        let mut raw = b"POST /up HTTP/1.1\r\nHost: x\r\nTransfer-Encoding: chunked\r\n\r\n".to_vec();
        raw.extend_from_slice(&encode_chunked(&body, chunk));
        raw.extend_from_slice(b"GET / HTTP/1.1\r\n\r\n");

        let (request, consumed) = parse_request(&raw).unwrap();
        prop_assert_eq!(request.body, body);
        prop_assert!(raw[consumed..].starts_with(b"GET / "));
    }

    #[test]
    fn confine_never_leaves_root(
        segments in proptest::collection::vec(
            prop_oneof![Just(".."), Just("."), Just("a"), Just("b"), Just("")],
            0..12,
        ),
    ) {
        let root = Path::new("/srv/www");
        let request_path = format!("/{}", segments.join("/"));
        if let Some(path) = confine(root, &request_path) {
            prop_assert!(path.starts_with(root));
            prop_assert!(!path.components().any(|c| c.as_os_str() == ".."));
        }
    }
}
