use bytes::Bytes;

use crate::error::ParseError;
use crate::{DEFAULT_PORT, MAX_HEADERS, MAX_HOST_LEN, MAX_TARGET_LEN};

/// `raw` is forwarded upstream untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub method: String,
    pub target: String,
    pub host: String,
    pub port: u16,
    pub raw: Bytes,
}

impl Request {
    pub fn is_get(&self) -> bool {
        self.method == "GET"
    }

    pub fn is_connect(&self) -> bool {
        self.method == "CONNECT"
    }
}

pub fn parse(data: &[u8]) -> Result<Request, ParseError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);

    match req.parse(data) {
        Ok(httparse::Status::Complete(_)) => {}
        Ok(httparse::Status::Partial) => return Err(ParseError::Incomplete),
        Err(e) => return Err(ParseError::Malformed(e.to_string())),
    }

    let method = req
        .method
        .ok_or_else(|| ParseError::Malformed("missing method".into()))?;
    let target = req
        .path
        .filter(|p| !p.is_empty())
        .ok_or_else(|| ParseError::Malformed("missing request target".into()))?;
    if target.len() > MAX_TARGET_LEN {
        return Err(ParseError::Oversized {
            field: "target",
            limit: MAX_TARGET_LEN,
        });
    }

    let authority = if method == "CONNECT" {
        target
    } else {
        host_header(req.headers)?
    };

    let (host, port) = split_authority(authority)?;
    if host.is_empty() {
        return Err(if method == "CONNECT" {
            ParseError::Malformed("CONNECT target has no host".into())
        } else {
            ParseError::MissingHost
        });
    }
    if host.len() > MAX_HOST_LEN {
        return Err(ParseError::Oversized {
            field: "host",
            limit: MAX_HOST_LEN,
        });
    }

    Ok(Request {
        method: method.to_string(),
        target: target.to_string(),
        host: host.to_string(),
        port,
        raw: Bytes::copy_from_slice(data),
    })
}

pub fn has_complete_head(buf: &[u8]) -> bool {
    buf.windows(4).any(|w| w == b"\r\n\r\n")
}

fn host_header<'a>(headers: &[httparse::Header<'a>]) -> Result<&'a str, ParseError> {
    let header = headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case("host"))
        .ok_or(ParseError::MissingHost)?;
    std::str::from_utf8(header.value)
        .map(str::trim)
        .map_err(|_| ParseError::Malformed("Host header is not UTF-8".into()))
}

// host[:port] or [v6]:port
fn split_authority(authority: &str) -> Result<(&str, u16), ParseError> {
    let (host, port) = if let Some(rest) = authority.strip_prefix('[') {
        let (host, tail) = rest
            .split_once(']')
            .ok_or_else(|| ParseError::Malformed(format!("unterminated IPv6 literal {authority:?}")))?;
        match tail {
            "" => (host, None),
            _ => match tail.strip_prefix(':') {
                Some(port) => (host, Some(port)),
                None => return Err(ParseError::InvalidPort(authority.to_string())),
            },
        }
    } else {
        match authority.split_once(':') {
            Some((_, rest)) if rest.contains(':') => {
                return Err(ParseError::Malformed(format!(
                    "IPv6 literal {authority:?} must be bracketed"
                )))
            }
            Some((host, port)) => (host, Some(port)),
            None => (authority, None),
        }
    };

    let port = match port {
        None => DEFAULT_PORT,
        Some(port) => port
            .parse::<u16>()
            .ok()
            .filter(|p| *p != 0)
            .ok_or_else(|| ParseError::InvalidPort(authority.to_string()))?,
    };
    Ok((host, port))
}
