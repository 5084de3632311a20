//! Authorization URL construction and callback parsing.

use crate::config::OAuthConfig;
use crate::credentials::Credentials;
use crate::error::AuthError;

/// Build the provider authorization URL the user must visit.
pub fn authorization_url(credentials: &Credentials, oauth: &OAuthConfig) -> String {
    format!(
        "{}?response_type=code&client_id={}&redirect_uri={}&scope={}",
        oauth.authorize_url,
        urlencoding::encode(&credentials.client_id),
        urlencoding::encode(&credentials.redirect_uri),
        urlencoding::encode(&oauth.scope)
    )
}

/// Extract the authorization code from the URL the browser was redirected to.
///
/// The user pastes the full returned URL (e.g. `https://127.0.0.1/?code=...&session=...`).
pub fn extract_authorization_code(returned_url: &str) -> Result<String, AuthError> {
    let query = returned_url
        .trim()
        .split_once('?')
        .map(|(_, query)| query)
        .ok_or(AuthError::MissingCode)?;
    let query = query.split('#').next().unwrap_or_default();

    let params: Vec<(String, String)> =
        serde_urlencoded::from_str(query).map_err(|_| AuthError::MissingCode)?;

    params
        .into_iter()
        .find(|(key, value)| key == "code" && !value.is_empty())
        .map(|(_, value)| value)
        .ok_or(AuthError::MissingCode)
}
