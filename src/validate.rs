use crate::error::ProxyError;
use percent_encoding::percent_decode_str;
use url::Url;

/// Schemes the proxy will fetch on behalf of a client.
pub const ALLOWED_SCHEMES: [&str; 3] = ["ftp", "http", "https"];

/// A client-supplied remote URL that passed validation.
///
/// `raw` is the decoded path text exactly as the client sent it and is what
/// the cache key is derived from. `url` is the parsed form used for host
/// lookup and for building the fetch target.
#[derive(Debug, Clone)]
pub struct RemoteUrl {
    pub raw: String,
    pub url: Url,
}

impl RemoteUrl {
    pub fn host(&self) -> Option<&str> {
        self.url.host_str()
    }

    pub fn as_str(&self) -> &str {
        self.url.as_str()
    }
}

/// Turns an inbound request path (`/http://host/file`) into a `RemoteUrl`.
pub fn validate_request_path(path: &str) -> Result<RemoteUrl, ProxyError> {
    let stripped = path.strip_prefix('/').unwrap_or(path);
    let raw = percent_decode_str(stripped)
        .decode_utf8()
        .map_err(|e| ProxyError::InvalidUri(format!("{}: {}", stripped, e)))?
        .into_owned();

    if raw.is_empty() {
        return Err(ProxyError::InvalidUri("empty path".to_string()));
    }

    let url = Url::parse(&raw).map_err(|e| ProxyError::InvalidUri(format!("{}: {}", raw, e)))?;

    if !ALLOWED_SCHEMES.contains(&url.scheme()) {
        return Err(ProxyError::InvalidUri(format!("scheme not allowed: {}", raw)));
    }

    Ok(RemoteUrl { raw, url })
}
