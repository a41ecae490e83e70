//! Session bootstrap: fetch the page and lift the session tokens out of it.

use std::time::Duration;

use reqwest::header::SET_COOKIE;
use scraper::{Html, Selector};
use serde_json::{Value, json};
use tracing::debug;

use crate::endpoint::Endpoint;
use crate::error::BootstrapError;

const CSRF_SELECTOR: &str = r#"meta[name="csrf-token"]"#;
const MAIN_SELECTOR: &str = "[data-phx-main]";

/// Tokens a LiveView needs to join, scraped from one page render.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionTokens {
    /// `content` of the `csrf-token` meta tag.
    pub csrf_token: String,
    /// `id` of the main LiveView element.
    pub phx_id: String,
    /// Signed session blob (`data-phx-session`).
    pub phx_session: String,
    /// Signed static blob (`data-phx-static`).
    pub phx_static: String,
    /// `name=value` pairs from the response's `Set-Cookie` headers.
    pub cookies: Vec<(String, String)>,
}

impl SessionTokens {
    /// The LiveView topic, `lv:<phx_id>`.
    pub fn topic(&self) -> String {
        format!("lv:{}", self.phx_id)
    }

    /// Payload of the join request for the page at `url`.
    pub fn join_payload(&self, url: &str) -> Value {
        json!({
            "url": url,
            "session": self.phx_session,
            "static": self.phx_static,
            "params": {
                "_csrf_token": self.csrf_token,
                "_mounts": 0,
            },
        })
    }
}

/// Turns a page body into [`SessionTokens`]. Cookies are filled in by the
/// caller.
pub type BodyParser = fn(&str) -> Result<SessionTokens, BootstrapError>;

/// Fetches pages and extracts [`SessionTokens`].
#[derive(Clone, Debug)]
pub struct Bootstrap {
    client: reqwest::Client,
    parser: BodyParser,
}

impl Bootstrap {
    /// A bootstrapper whose requests give up after `timeout`.
    pub fn new(timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("tiki-loadtest/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_default();
        Self::with_client(client)
    }

    /// Use a preconfigured client.
    pub fn with_client(client: reqwest::Client) -> Self {
        Self {
            client,
            parser: parse_tokens,
        }
    }

    /// Extract tokens with `parser` instead of [`parse_tokens`], for pages
    /// that carry them somewhere other than the standard LiveView markup.
    #[must_use]
    pub fn with_parser(mut self, parser: BodyParser) -> Self {
        self.parser = parser;
        self
    }

    /// GET the endpoint's page and parse its session tokens.
    pub async fn fetch(&self, endpoint: &Endpoint) -> Result<SessionTokens, BootstrapError> {
        let url = endpoint.page_url();
        let request_err = |source| BootstrapError::Request {
            url: url.to_string(),
            source,
        };

        let mut request = self.client.get(url.clone());
        for (name, value) in endpoint.headers() {
            request = request.header(name.as_str(), value.as_str());
        }
        let response = request.send().await.map_err(request_err)?;

        let status = response.status();
        if !status.is_success() {
            return Err(BootstrapError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let cookies: Vec<(String, String)> = response
            .headers()
            .get_all(SET_COOKIE)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .filter_map(parse_set_cookie)
            .collect();
        let body = response.text().await.map_err(request_err)?;

        let mut tokens = (self.parser)(&body)?;
        tokens.cookies = cookies;
        debug!(%url, phx_id = %tokens.phx_id, cookies = tokens.cookies.len(), "bootstrap complete");
        Ok(tokens)
    }
}

/// Extract session tokens from a server-rendered LiveView page.
///
/// Nothing is defaulted: every token must be present.
pub fn parse_tokens(html: &str) -> Result<SessionTokens, BootstrapError> {
    let document = Html::parse_document(html);

    let csrf = select_first(&document, CSRF_SELECTOR)?;
    let main = select_first(&document, MAIN_SELECTOR)?;

    Ok(SessionTokens {
        csrf_token: attribute(csrf, CSRF_SELECTOR, "content")?,
        phx_id: attribute(main, MAIN_SELECTOR, "id")?,
        phx_session: attribute(main, MAIN_SELECTOR, "data-phx-session")?,
        phx_static: attribute(main, MAIN_SELECTOR, "data-phx-static")?,
        cookies: Vec::new(),
    })
}

fn select_first<'a>(
    document: &'a Html,
    selector: &'static str,
) -> Result<scraper::ElementRef<'a>, BootstrapError> {
    let missing = || BootstrapError::MissingElement { selector };
    let parsed = Selector::parse(selector).map_err(|_| missing())?;
    document.select(&parsed).next().ok_or_else(missing)
}

fn attribute(
    element: scraper::ElementRef<'_>,
    selector: &'static str,
    name: &'static str,
) -> Result<String, BootstrapError> {
    element
        .value()
        .attr(name)
        .map(str::to_owned)
        .ok_or(BootstrapError::MissingAttribute {
            selector,
            attribute: name,
        })
}

/// `name=value` of a `Set-Cookie` header, without its attributes.
fn parse_set_cookie(header: &str) -> Option<(String, String)> {
    let pair = header.split(';').next()?;
    let (name, value) = pair.split_once('=')?;
    let name = name.trim();
    if name.is_empty() {
        return None;
    }
    Some((name.to_owned(), value.trim().to_owned()))
}
