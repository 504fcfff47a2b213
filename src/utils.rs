use url::Url;

use crate::error::Result;

/// Trims the input and assumes `http://` when no scheme is given.
pub fn normalize_url(input: &str) -> String {
    let trimmed = input.trim().trim_end_matches('/');
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed.to_string()
    } else {
        format!("http://{}", trimmed)
    }
}

/// Socket endpoint on the same host as the HTTP API: `ws(s)://host[:port]/socket`.
pub fn socket_url_for(api_base_url: &str) -> Result<Url> {
    let mut url = Url::parse(&normalize_url(api_base_url))?;
    let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
    // http(s) -> ws(s) never fails
    let _ = url.set_scheme(scheme);
    url.set_path("/socket");
    url.set_query(None);
    url.set_fragment(None);
    Ok(url)
}
