//! OAuth 2.0 grants against the brokerage authorization server.
//!
//! The interactive part of the authorization-code flow (browser consent) is
//! handled by the caller:
//! 1. Send the user to [`authorization_url`]
//! 2. User authorizes on the provider's site and lands on the redirect URI
//! 3. [`extract_authorization_code`] pulls the code out of that URL
//! 4. [`OAuthExchanger::exchange_code`] trades it for a token set and stores it
//!
//! After that, [`OAuthExchanger::refresh`] is driven by the token manager.

mod exchange;
mod provider;

pub use exchange::OAuthExchanger;
pub use provider::{authorization_url, extract_authorization_code};
