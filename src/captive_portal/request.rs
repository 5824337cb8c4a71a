//! HTTP 请求解析
//!
//! 只看请求行、查询串和 Host 头，不支持请求体。

use std::collections::BTreeMap;
use std::fmt;

/// 解码后的查询参数，键唯一
pub type Params = BTreeMap<String, String>;

pub const TERMINATOR: &[u8] = b"\r\n\r\n";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedRequest {
    pub method: String,
    pub path: String,
    pub params: Params,
    pub host: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    EmptyRequest,
    BadRequestLine(String),
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::EmptyRequest => write!(f, "empty request"),
            ParseError::BadRequestLine(line) => write!(f, "bad request line: {:?}", line),
        }
    }
}

impl std::error::Error for ParseError {}

/// 以空行结尾才算收完整
pub fn is_complete(buf: &[u8]) -> bool {
    buf.ends_with(TERMINATOR)
}

pub fn parse_request(raw: &[u8]) -> Result<ParsedRequest, ParseError> {
    let text = String::from_utf8_lossy(raw);
    let mut lines = text.split("\r\n");

    let request_line = lines
        .next()
        .filter(|line| !line.is_empty())
        .ok_or(ParseError::EmptyRequest)?;

    let mut parts = request_line.split(' ');
    let (method, target) = match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(method), Some(target), Some(version), None)
            if !method.is_empty() && target.starts_with('/') && version.starts_with("HTTP/") =>
        {
            (method, target)
        }
        _ => return Err(ParseError::BadRequestLine(request_line.to_string())),
    };

    let (path, params) = match target.split_once('?') {
        Some((path, query)) => (path, parse_query(query)),
        None => (target, Params::new()),
    };

    let host = lines
        .take_while(|line| !line.is_empty())
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            name.trim()
                .eq_ignore_ascii_case("host")
                .then(|| value.trim().to_string())
        });

    Ok(ParsedRequest {
        method: method.to_string(),
        path: path.to_string(),
        params,
        host,
    })
}

/// `a=1&b=2`；任何一段不是恰好一个 `=` 时整个参数表作废
pub fn parse_query(query: &str) -> Params {
    let mut params = Params::new();
    for pair in query.split('&') {
        let mut tokens = pair.split('=');
        match (tokens.next(), tokens.next(), tokens.next()) {
            (Some(key), Some(value), None) => {
                params.insert(key.to_string(), unescape(value));
            }
            _ => return Params::new(),
        }
    }
    params
}

fn hex_value(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

/// 解码 `%XX`。其它写法原样保留。
///
/// 解码结果不是合法 UTF-8 时按 Latin-1 逐字节转成字符。
pub fn unescape(value: &str) -> String {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hi = bytes.get(i + 1).copied().and_then(hex_value);
            let lo = bytes.get(i + 2).copied().and_then(hex_value);
            if let (Some(hi), Some(lo)) = (hi, lo) {
                out.push(hi << 4 | lo);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }

    match String::from_utf8(out) {
        Ok(s) => s,
        Err(e) => e.into_bytes().into_iter().map(char::from).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_get_info_request() {
        let req =
            parse_request(b"GET /get_info?x=1 HTTP/1.1\r\nHost: 192.168.4.1\r\n\r\n").unwrap();
        assert_eq!(req.method, "GET");
        assert_eq!(req.path, "/get_info");
        assert_eq!(req.params.get("x").map(String::as_str), Some("1"));
        assert_eq!(req.host.as_deref(), Some("192.168.4.1"));
    }

    #[test]
    fn host_header_is_case_insensitive() {
        let req = parse_request(
            b"GET / HTTP/1.1\r\nUser-Agent: test\r\nhost:  captive.apple.com \r\n\r\n",
        )
        .unwrap();
        assert_eq!(req.host.as_deref(), Some("captive.apple.com"));
    }

    #[test]
    fn missing_host() {
        let req = parse_request(b"GET / HTTP/1.0\r\n\r\n").unwrap();
        assert_eq!(req.host, None);
        assert!(req.params.is_empty());
    }

    #[test]
    fn bad_request_lines() {
        assert_eq!(parse_request(b"\r\n\r\n"), Err(ParseError::EmptyRequest));
        assert!(matches!(
            parse_request(b"GET /\r\n\r\n"),
            Err(ParseError::BadRequestLine(_))
        ));
        assert!(matches!(
            parse_request(b"GET / HTTP/1.1 extra\r\n\r\n"),
            Err(ParseError::BadRequestLine(_))
        ));
        assert!(matches!(
            parse_request(b"\x16\x03\x01 garbage\r\n\r\n"),
            Err(ParseError::BadRequestLine(_))
        ));
    }

    #[test]
    fn login_query() {
        let params = parse_query("ssid=My%20Home&password=p%40ss%3Dword");
        assert_eq!(params["ssid"], "My Home");
        assert_eq!(params["password"], "p@ss=word");
    }

    #[test]
    fn malformed_pairs_empty_the_set() {
        assert!(parse_query("ssid=Home&password").is_empty());
        assert!(parse_query("a=1=2").is_empty());
        assert!(parse_query("a=1&").is_empty());
        assert!(parse_query("").is_empty());
    }

    #[test]
    fn duplicate_keys_keep_last() {
        let params = parse_query("a=1&a=2");
        assert_eq!(params.len(), 1);
        assert_eq!(params["a"], "2");
    }

    #[test]
    fn every_byte_escape_decodes() {
        for b in 0u8..=255 {
            let expected = char::from(b).to_string();
            assert_eq!(unescape(&format!("%{:02X}", b)), expected, "upper {:02X}", b);
            assert_eq!(unescape(&format!("%{:02x}", b)), expected, "lower {:02x}", b);
        }
    }

    #[test]
    fn utf8_sequences_decode() {
        assert_eq!(unescape("Z%C3%BCrich"), "Zürich");
    }

    #[test]
    fn malformed_escapes_pass_through() {
        for raw in ["%", "%4", "%G1", "%1G", "100%", "%%41", "a+b"] {
            let expected = raw.replace("%41", "A");
            assert_eq!(unescape(raw), expected, "{raw}");
        }
    }
}
