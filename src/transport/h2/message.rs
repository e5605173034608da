//! Mapping between `http` messages and HTTP/2 header fields.

use bytes::Bytes;
use http::header::{HeaderName, HeaderValue};
use http::{HeaderMap, Method, Request, Response, StatusCode, Uri};

use crate::error::{Error, Result};
use crate::transport::h2::hpack::HeaderField;

/// Connection-specific headers forbidden in HTTP/2 (RFC 9113 Section 8.2.2).
const CONNECTION_HEADERS: [&str; 5] = [
    "connection",
    "keep-alive",
    "proxy-connection",
    "transfer-encoding",
    "upgrade",
];

/// Headers whose values never enter the compression table.
const SENSITIVE_HEADERS: [&str; 3] = ["authorization", "proxy-authorization", "cookie"];

fn is_connection_header(name: &str) -> bool {
    CONNECTION_HEADERS.contains(&name)
}

fn regular_fields(headers: &HeaderMap, out: &mut Vec<HeaderField>) {
    for (name, value) in headers {
        let name_str = name.as_str();
        if is_connection_header(name_str) {
            continue;
        }
        // TE is allowed only with the value "trailers"
        if name_str == "te" && !value.as_bytes().eq_ignore_ascii_case(b"trailers") {
            continue;
        }
        let sensitive = value.is_sensitive() || SENSITIVE_HEADERS.contains(&name_str);
        out.push(
            HeaderField::new(
                Bytes::copy_from_slice(name_str.as_bytes()),
                Bytes::copy_from_slice(value.as_bytes()),
            )
            .sensitive(sensitive),
        );
    }
}

/// Header fields for a request head.
///
/// The URI's scheme and authority win; otherwise the session's values are used.
pub fn request_fields<B>(
    request: &Request<B>,
    default_scheme: &str,
    default_authority: &str,
) -> Result<Vec<HeaderField>> {
    let uri = request.uri();
    let method = request.method().as_str();
    let scheme = uri.scheme_str().unwrap_or(default_scheme);
    let authority = uri
        .authority()
        .map(|a| a.as_str())
        .or_else(|| request.headers().get(http::header::HOST).and_then(|h| h.to_str().ok()))
        .unwrap_or(default_authority);
    let path = uri.path_and_query().map(|p| p.as_str()).unwrap_or("/");

    // RFC 9113 Section 8.3.1: pseudo-header values cannot be empty
    if scheme.is_empty() {
        return Err(Error::http_protocol(":scheme pseudo-header cannot be empty"));
    }
    if authority.is_empty() {
        return Err(Error::http_protocol(
            ":authority pseudo-header cannot be empty",
        ));
    }

    let mut fields = Vec::with_capacity(4 + request.headers().len());
    fields.push(HeaderField::new(":method", Bytes::copy_from_slice(method.as_bytes())));
    fields.push(HeaderField::new(":scheme", Bytes::copy_from_slice(scheme.as_bytes())));
    fields.push(HeaderField::new(
        ":authority",
        Bytes::copy_from_slice(authority.as_bytes()),
    ));
    fields.push(HeaderField::new(":path", Bytes::copy_from_slice(path.as_bytes())));

    let mut headers = request.headers().clone();
    headers.remove(http::header::HOST);
    regular_fields(&headers, &mut fields);
    Ok(fields)
}

/// Header fields for a response head, optionally announcing trailer names.
pub fn response_fields<B>(
    response: &Response<B>,
    trailer_names: Option<&[HeaderName]>,
) -> Vec<HeaderField> {
    let mut fields = Vec::with_capacity(2 + response.headers().len());
    fields.push(HeaderField::new(
        ":status",
        Bytes::copy_from_slice(response.status().as_str().as_bytes()),
    ));
    regular_fields(response.headers(), &mut fields);

    if let Some(names) = trailer_names.filter(|n| !n.is_empty()) {
        if !response.headers().contains_key(http::header::TRAILER) {
            let joined = names
                .iter()
                .map(|n| n.as_str())
                .collect::<Vec<_>>()
                .join(", ");
            fields.push(HeaderField::new("trailer", Bytes::from(joined)));
        }
    }
    fields
}

/// Header fields for a trailer block. Pseudo-headers are never allowed here.
pub fn trailer_fields(trailers: &HeaderMap) -> Vec<HeaderField> {
    let mut fields = Vec::with_capacity(trailers.len());
    regular_fields(trailers, &mut fields);
    fields
}

fn field_name(field: &HeaderField) -> Result<&str> {
    std::str::from_utf8(&field.name)
        .map_err(|_| Error::http_protocol("header name is not valid UTF-8"))
}

fn push_regular(headers: &mut HeaderMap, field: &HeaderField, name: &str) -> Result<()> {
    if name.bytes().any(|b| b.is_ascii_uppercase()) {
        return Err(Error::http_protocol(format!(
            "uppercase header name: {}",
            name
        )));
    }
    if is_connection_header(name) {
        return Err(Error::http_protocol(format!(
            "connection-specific header forbidden: {}",
            name
        )));
    }
    let header_name = HeaderName::from_bytes(name.as_bytes())
        .map_err(|_| Error::http_protocol(format!("invalid header name: {}", name)))?;
    let value = HeaderValue::from_bytes(&field.value)
        .map_err(|_| Error::http_protocol(format!("invalid value for header {}", name)))?;
    headers.append(header_name, value);
    Ok(())
}

/// Decoded response head.
#[derive(Debug)]
pub struct ResponseHead {
    pub status: StatusCode,
    pub headers: HeaderMap,
}

/// Validate and convert a decoded response header block.
pub fn parse_response_head(fields: &[HeaderField]) -> Result<ResponseHead> {
    let mut status = None;
    let mut headers = HeaderMap::new();
    let mut regular_seen = false;

    for field in fields {
        let name = field_name(field)?;
        if field.is_pseudo() {
            if regular_seen {
                return Err(Error::http_protocol(format!(
                    "pseudo-header {} after regular header",
                    name
                )));
            }
            match name {
                ":status" => {
                    if status.is_some() {
                        return Err(Error::http_protocol("duplicate :status pseudo-header"));
                    }
                    if field.value.len() != 3 || !field.value.iter().all(u8::is_ascii_digit) {
                        return Err(Error::http_protocol(format!(
                            "invalid :status value: {}",
                            String::from_utf8_lossy(&field.value)
                        )));
                    }
                    let code = StatusCode::from_bytes(&field.value)
                        .map_err(|_| Error::http_protocol("invalid :status value"))?;
                    status = Some(code);
                }
                ":method" | ":scheme" | ":authority" | ":path" => {
                    return Err(Error::http_protocol(format!(
                        "request pseudo-header {} in response",
                        name
                    )));
                }
                _ => {
                    return Err(Error::http_protocol(format!(
                        "unknown pseudo-header: {}",
                        name
                    )));
                }
            }
        } else {
            regular_seen = true;
            push_regular(&mut headers, field, name)?;
        }
    }

    let status =
        status.ok_or_else(|| Error::http_protocol("missing required :status pseudo-header"))?;
    Ok(ResponseHead { status, headers })
}

/// Validate and convert a decoded request header block into a request head.
pub fn parse_request_head(fields: &[HeaderField]) -> Result<Request<()>> {
    let mut method = None;
    let mut scheme = None;
    let mut authority = None;
    let mut path = None;
    let mut headers = HeaderMap::new();
    let mut regular_seen = false;

    for field in fields {
        let name = field_name(field)?;
        if field.is_pseudo() {
            if regular_seen {
                return Err(Error::http_protocol(format!(
                    "pseudo-header {} after regular header",
                    name
                )));
            }
            let slot = match name {
                ":method" => &mut method,
                ":scheme" => &mut scheme,
                ":authority" => &mut authority,
                ":path" => &mut path,
                _ => {
                    return Err(Error::http_protocol(format!(
                        "unknown pseudo-header: {}",
                        name
                    )))
                }
            };
            if slot.is_some() {
                return Err(Error::http_protocol(format!(
                    "duplicate pseudo-header: {}",
                    name
                )));
            }
            *slot = Some(field.value.clone());
        } else {
            regular_seen = true;
            if name == "te" && !field.value.eq_ignore_ascii_case(b"trailers") {
                return Err(Error::http_protocol("TE header other than \"trailers\""));
            }
            push_regular(&mut headers, field, name)?;
        }
    }

    let method = method.ok_or_else(|| Error::http_protocol("missing :method"))?;
    let method = Method::from_bytes(&method)
        .map_err(|_| Error::http_protocol("invalid :method value"))?;

    let uri = if method == Method::CONNECT {
        let authority =
            authority.ok_or_else(|| Error::http_protocol("CONNECT without :authority"))?;
        Uri::builder()
            .authority(&authority[..])
            .build()
            .map_err(|e| Error::http_protocol(format!("invalid :authority: {}", e)))?
    } else {
        let scheme = scheme.ok_or_else(|| Error::http_protocol("missing :scheme"))?;
        let path = path
            .filter(|p| !p.is_empty())
            .ok_or_else(|| Error::http_protocol("missing :path"))?;
        let mut builder = Uri::builder()
            .scheme(&scheme[..])
            .path_and_query(&path[..]);
        if let Some(authority) = authority.as_ref() {
            builder = builder.authority(&authority[..]);
        }
        builder
            .build()
            .map_err(|e| Error::http_protocol(format!("invalid request target: {}", e)))?
    };

    let mut request = Request::builder().method(method).uri(uri).body(())?;
    *request.headers_mut() = headers;
    Ok(request)
}

/// Names announced by a `trailer` header, lowercased.
pub fn declared_trailers(headers: &HeaderMap) -> Option<Vec<HeaderName>> {
    let mut names = Vec::new();
    for value in headers.get_all(http::header::TRAILER) {
        let Ok(value) = value.to_str() else { continue };
        for name in value.split(',') {
            let name = name.trim();
            if name.is_empty() {
                continue;
            }
            if let Ok(name) = HeaderName::from_bytes(name.to_ascii_lowercase().as_bytes()) {
                names.push(name);
            }
        }
    }
    if names.is_empty() {
        None
    } else {
        Some(names)
    }
}

/// Validate and convert a trailer block.
///
/// When the head announced trailer names, every trailer must be among them.
pub fn parse_trailers(fields: &[HeaderField], declared: Option<&[HeaderName]>) -> Result<HeaderMap> {
    let mut trailers = HeaderMap::new();
    for field in fields {
        let name = field_name(field)?;
        if field.is_pseudo() {
            return Err(Error::http_protocol(format!(
                "pseudo-header {} in trailers",
                name
            )));
        }
        if let Some(declared) = declared {
            if !declared.iter().any(|d| d.as_str() == name) {
                return Err(Error::http_protocol(format!(
                    "undeclared trailer: {}",
                    name
                )));
            }
        }
        push_regular(&mut trailers, field, name)?;
    }
    Ok(trailers)
}
