//! # tiki-liveview
//!
//! Drives a Phoenix LiveView the way a browser tab would:
//!
//! 1. GET the page and scrape the CSRF token and the signed session blobs
//!    ([`bootstrap`])
//! 2. open the channel socket with `vsn` and `_csrf_token` on its query
//! 3. join `lv:<id>` and exchange events ([`session`])
//!
//! DOM patches in replies are returned as JSON and never applied.

#![deny(unsafe_code)]

pub mod bootstrap;
pub mod endpoint;
pub mod error;
pub mod session;

pub use bootstrap::{Bootstrap, BodyParser, SessionTokens, parse_tokens};
pub use endpoint::{Endpoint, PROTOCOL_VSN};
pub use error::{BootstrapError, EndpointError, SessionError};
pub use session::{LiveSession, SessionConfig, SessionState};
