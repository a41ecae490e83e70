//! Where a LiveView lives: the page URL and its socket URL.

use url::Url;

use crate::error::EndpointError;

/// Protocol version query value sent on the socket URL.
pub const PROTOCOL_VSN: &str = "2.0.0";

const COOKIE: &str = "cookie";

/// Immutable description of a LiveView page and its socket.
///
/// Built once with the consuming `with_*` methods and then shared (usually
/// behind an `Arc`) by every session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Endpoint {
    url: Url,
    socket_url: Url,
    params: Vec<(String, String)>,
    headers: Vec<(String, String)>,
}

impl Endpoint {
    /// `url` must be `http(s)`, `socket_url` must be `ws(s)`.
    pub fn new(url: &str, socket_url: &str) -> Result<Self, EndpointError> {
        Ok(Self {
            url: parse("url", url, &["http", "https"], "http or https")?,
            socket_url: parse("socket_url", socket_url, &["ws", "wss"], "ws or wss")?,
            params: Vec::new(),
            headers: Vec::new(),
        })
    }

    /// Add a query parameter to the page request.
    #[must_use]
    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.push((name.into(), value.into()));
        self
    }

    /// Set a header sent with both the page request and the socket upgrade.
    /// Replaces an earlier header of the same name.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        let name = name.into();
        let value = value.into();
        match self
            .headers
            .iter_mut()
            .find(|(existing, _)| existing.eq_ignore_ascii_case(&name))
        {
            Some(slot) => slot.1 = value,
            None => self.headers.push((name, value)),
        }
        self
    }

    /// Add `name=value` to the `Cookie` header.
    #[must_use]
    pub fn with_cookie(self, name: &str, value: &str) -> Self {
        let merged = merge_cookies(self.cookie_header(), &[(name.to_owned(), value.to_owned())]);
        self.with_header(COOKIE, merged)
    }

    /// The page URL, without query parameters.
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// The socket URL as configured.
    pub fn socket_url(&self) -> &Url {
        &self.socket_url
    }

    /// Page query parameters.
    pub fn params(&self) -> &[(String, String)] {
        &self.params
    }

    /// Extra request headers.
    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    /// Current `Cookie` header value, if any.
    pub fn cookie_header(&self) -> Option<&str> {
        self.headers
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(COOKIE))
            .map(|(_, value)| value.as_str())
    }

    /// The page URL with the query parameters applied.
    pub fn page_url(&self) -> Url {
        let mut url = self.url.clone();
        if !self.params.is_empty() {
            let _ = url.query_pairs_mut().extend_pairs(&self.params);
        }
        url
    }

    /// The socket URL for a session: `vsn` and `_csrf_token` set to the
    /// protocol version and `csrf_token`, replacing any existing values.
    pub fn socket_url_for(&self, csrf_token: &str) -> Url {
        let kept: Vec<(String, String)> = self
            .socket_url
            .query_pairs()
            .filter(|(name, _)| name != "vsn" && name != "_csrf_token")
            .map(|(name, value)| (name.into_owned(), value.into_owned()))
            .collect();

        let mut url = self.socket_url.clone();
        let _ = url
            .query_pairs_mut()
            .clear()
            .extend_pairs(&kept)
            .append_pair("vsn", PROTOCOL_VSN)
            .append_pair("_csrf_token", csrf_token);
        url
    }

    /// Headers for the socket upgrade: the endpoint's own plus `cookies`
    /// merged into its `Cookie` header.
    pub fn socket_headers(&self, cookies: &[(String, String)]) -> Vec<(String, String)> {
        let mut headers: Vec<(String, String)> = self
            .headers
            .iter()
            .filter(|(name, _)| !name.eq_ignore_ascii_case(COOKIE))
            .cloned()
            .collect();
        if self.cookie_header().is_some() || !cookies.is_empty() {
            headers.push((COOKIE.to_owned(), merge_cookies(self.cookie_header(), cookies)));
        }
        headers
    }
}

fn parse(
    field: &'static str,
    value: &str,
    schemes: &[&str],
    expected: &'static str,
) -> Result<Url, EndpointError> {
    let url = Url::parse(value).map_err(|e| EndpointError::InvalidUrl {
        field,
        value: value.to_owned(),
        reason: e.to_string(),
    })?;
    if !schemes.contains(&url.scheme()) {
        return Err(EndpointError::Scheme {
            field,
            expected,
            scheme: url.scheme().to_owned(),
        });
    }
    Ok(url)
}

/// Merge `cookies` into a `Cookie` header value. A cookie already present
/// under the same name is replaced in place.
pub fn merge_cookies(existing: Option<&str>, cookies: &[(String, String)]) -> String {
    let mut pairs: Vec<(String, String)> = existing
        .unwrap_or_default()
        .split(';')
        .filter_map(|pair| {
            let (name, value) = pair.trim().split_once('=')?;
            Some((name.trim().to_owned(), value.trim().to_owned()))
        })
        .collect();

    for (name, value) in cookies {
        match pairs.iter_mut().find(|(existing, _)| existing == name) {
            Some(slot) => slot.1.clone_from(value),
            None => pairs.push((name.clone(), value.clone())),
        }
    }

    pairs
        .iter()
        .map(|(name, value)| format!("{name}={value}"))
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn endpoint() -> Endpoint {
        Endpoint::new(
            "http://localhost:4000/events/1/purchase",
            "ws://localhost:4000/live/websocket?vsn=2.0.0",
        )
        .unwrap()
    }

    #[test]
    fn rejects_wrong_schemes() {
        assert_matches!(
            Endpoint::new("ws://localhost/", "ws://localhost/live"),
            Err(EndpointError::Scheme { field: "url", .. })
        );
        assert_matches!(
            Endpoint::new("http://localhost/", "http://localhost/live"),
            Err(EndpointError::Scheme { field: "socket_url", .. })
        );
        assert_matches!(
            Endpoint::new("not a url", "ws://localhost/live"),
            Err(EndpointError::InvalidUrl { field: "url", .. })
        );
    }

    #[test]
    fn socket_url_replaces_version_and_token() {
        let url = endpoint().socket_url_for("tok+en/=");
        let pairs: Vec<(String, String)> = url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        assert_eq!(
            pairs,
            vec![
                ("vsn".to_string(), "2.0.0".to_string()),
                ("_csrf_token".to_string(), "tok+en/=".to_string()),
            ]
        );
    }

    #[test]
    fn socket_url_keeps_unrelated_params() {
        let endpoint = Endpoint::new(
            "https://example.com/",
            "wss://example.com/live/websocket?_csrf_token=old&locale=de",
        )
        .unwrap();
        let url = endpoint.socket_url_for("new");
        assert_eq!(url.query(), Some("locale=de&vsn=2.0.0&_csrf_token=new"));
        assert_eq!(url.scheme(), "wss");
    }

    #[test]
    fn page_url_applies_params() {
        let endpoint = endpoint().with_param("ref", "k6");
        assert_eq!(
            endpoint.page_url().as_str(),
            "http://localhost:4000/events/1/purchase?ref=k6"
        );
        assert_eq!(endpoint.url().query(), None);
    }

    #[test]
    fn with_header_replaces_case_insensitively() {
        let endpoint = endpoint()
            .with_header("X-Test", "a")
            .with_header("x-test", "b");
        assert_eq!(endpoint.headers(), &[("X-Test".to_string(), "b".to_string())]);
    }

    #[test]
    fn cookies_accumulate_in_one_header() {
        let endpoint = endpoint()
            .with_cookie("_tiki_key", "abc")
            .with_cookie("theme", "dark")
            .with_cookie("_tiki_key", "xyz");
        assert_eq!(endpoint.cookie_header(), Some("_tiki_key=xyz; theme=dark"));
        assert_eq!(endpoint.headers().len(), 1);
    }

    #[test]
    fn socket_headers_merge_bootstrap_cookies() {
        let endpoint = endpoint()
            .with_header("user-agent", "tiki")
            .with_cookie("_tiki_key", "abc");
        let headers = endpoint.socket_headers(&[
            ("_tiki_key".into(), "rotated".into()),
            ("_csrf".into(), "1".into()),
        ]);
        assert_eq!(
            headers,
            vec![
                ("user-agent".to_string(), "tiki".to_string()),
                ("cookie".to_string(), "_tiki_key=rotated; _csrf=1".to_string()),
            ]
        );
    }

    #[test]
    fn socket_headers_without_cookies_add_none() {
        assert!(endpoint().socket_headers(&[]).is_empty());
    }

    #[test]
    fn merge_ignores_malformed_pairs() {
        assert_eq!(merge_cookies(Some("a=1; junk; b=2"), &[]), "a=1; b=2");
    }
}
