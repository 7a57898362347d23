//! Link URL shown to the wallet (usually as a QR code).
//!
//! ```text
//! {server}/#/link?id={id}&secret={secret}&server={server}&v=1[&chainId={n}]
//! ```
//!
//! A child session links through its parent and names it with `parent-id`
//! instead of `id`.

// Rust guideline compliant 2026-02

use url::form_urlencoded;

/// Link protocol version carried in `v`.
pub const LINK_VERSION: &str = "1";

/// Build the URL a wallet opens to join session `id`.
///
/// `server` is the relay base URL; a trailing slash is ignored.
pub fn link_url(id: &str, secret: &str, server: &str, parent: bool, chain_id: Option<u64>) -> String {
    let server = server.trim_end_matches('/');
    let mut query = form_urlencoded::Serializer::new(String::new());
    query
        .append_pair(if parent { "parent-id" } else { "id" }, id)
        .append_pair("secret", secret)
        .append_pair("server", server)
        .append_pair("v", LINK_VERSION);
    if let Some(chain_id) = chain_id {
        query.append_pair("chainId", &chain_id.to_string());
    }
    format!("{server}/#/link?{}", query.finish())
}
