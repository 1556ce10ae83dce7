//! Application credentials and hosted OAuth helpers

use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::env;
use std::fmt;

use crate::client::NylasClient;
use crate::error::{NylasError, Result};

/// Application client id and secret.
///
/// The secret also keys webhook signatures and authenticates the tunnel relay.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppCredentials {
    pub client_id: String,
    pub client_secret: String,
}

impl AppCredentials {
    pub fn new(client_id: impl Into<String>, client_secret: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: client_secret.into(),
        }
    }
}

impl fmt::Debug for AppCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppCredentials")
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .finish()
    }
}

/// Load application credentials from environment variables
///
/// # Environment Variables
/// - `NYLAS_CLIENT_ID`: application client ID
/// - `NYLAS_CLIENT_SECRET`: application client secret
pub fn load_credentials_from_env() -> Result<AppCredentials> {
    let client_id = env::var("NYLAS_CLIENT_ID")
        .map_err(|_| NylasError::ConfigError("NYLAS_CLIENT_ID not set".to_string()))?;
    let client_secret = env::var("NYLAS_CLIENT_SECRET")
        .map_err(|_| NylasError::ConfigError("NYLAS_CLIENT_SECRET not set".to_string()))?;

    Ok(AppCredentials::new(client_id, client_secret))
}

/// Parameters of the hosted authorization redirect
#[derive(Debug, Clone)]
pub struct AuthorizationRequest {
    pub redirect_uri: String,
    pub scopes: Vec<String>,
    pub login_hint: Option<String>,
    pub state: Option<String>,
}

impl AuthorizationRequest {
    pub fn new(redirect_uri: impl Into<String>) -> Self {
        Self {
            redirect_uri: redirect_uri.into(),
            scopes: vec!["email".to_string(), "calendar".to_string(), "contacts".to_string()],
            login_hint: None,
            state: None,
        }
    }

    pub fn scopes<I, S>(mut self, scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.scopes = scopes.into_iter().map(Into::into).collect();
        self
    }

    pub fn login_hint(mut self, email: impl Into<String>) -> Self {
        self.login_hint = Some(email.into());
        self
    }

    pub fn state(mut self, state: impl Into<String>) -> Self {
        self.state = Some(state.into());
        self
    }

    /// Build the URL the user's browser is sent to
    pub fn url(&self, api_server: &str, credentials: &AppCredentials) -> Result<url::Url> {
        let base = format!("{}/oauth/authorize", api_server.trim_end_matches('/'));
        let mut url = url::Url::parse(&base)
            .map_err(|e| NylasError::ConfigError(format!("Invalid API server URL: {}", e)))?;

        {
            let mut pairs = url.query_pairs_mut();
            pairs
                .append_pair("client_id", &credentials.client_id)
                .append_pair("redirect_uri", &self.redirect_uri)
                .append_pair("response_type", "code")
                .append_pair("scopes", &self.scopes.join(","));
            if let Some(hint) = &self.login_hint {
                pairs.append_pair("login_hint", hint);
            }
            if let Some(state) = &self.state {
                pairs.append_pair("state", state);
            }
        }

        Ok(url)
    }
}

/// Account token returned by the code exchange
#[derive(Clone, Serialize, Deserialize)]
pub struct AccessToken {
    pub access_token: String,
    #[serde(default)]
    pub account_id: Option<String>,
    #[serde(default)]
    pub email_address: Option<String>,
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub token_type: Option<String>,
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessToken")
            .field("access_token", &"<redacted>")
            .field("account_id", &self.account_id)
            .field("email_address", &self.email_address)
            .field("provider", &self.provider)
            .field("token_type", &self.token_type)
            .finish()
    }
}

/// Exchange an authorization code for an account access token
pub async fn exchange_code_for_token(
    client: &dyn NylasClient,
    code: &str,
) -> Result<AccessToken> {
    let credentials = client.credentials();
    let body = json!({
        "client_id": credentials.client_id,
        "client_secret": credentials.client_secret,
        "grant_type": "authorization_code",
        "code": code,
    });

    let response = client
        .request_json(Method::POST, "/oauth/token", &[], Some(body))
        .await?;

    if response.get("access_token").and_then(|t| t.as_str()).is_none() {
        return Err(NylasError::ProtocolError(
            "Token response is missing 'access_token'".to_string(),
        ));
    }

    let token: AccessToken = serde_json::from_value(response)
        .map_err(|e| NylasError::ProtocolError(format!("Unexpected token response: {}", e)))?;
    tracing::info!(
        "Exchanged authorization code for account {}",
        token.account_id.as_deref().unwrap_or("<unknown>")
    );
    Ok(token)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_debug_redacts_secret() {
        let credentials = AppCredentials::new("client-id", "super-secret");
        let debug = format!("{:?}", credentials);
        assert!(debug.contains("client-id"));
        assert!(!debug.contains("super-secret"));
    }

    #[test]
    #[serial]
    fn test_load_credentials_from_env() {
        env::set_var("NYLAS_CLIENT_ID", "test-id");
        env::set_var("NYLAS_CLIENT_SECRET", "test-secret");

        let credentials = load_credentials_from_env().unwrap();
        assert_eq!(credentials.client_id, "test-id");
        assert_eq!(credentials.client_secret, "test-secret");

        env::remove_var("NYLAS_CLIENT_ID");
        env::remove_var("NYLAS_CLIENT_SECRET");
    }

    #[test]
    #[serial]
    fn test_load_credentials_from_env_missing_secret() {
        env::set_var("NYLAS_CLIENT_ID", "test-id");
        env::remove_var("NYLAS_CLIENT_SECRET");

        let err = load_credentials_from_env().unwrap_err();
        assert!(err.to_string().contains("NYLAS_CLIENT_SECRET"));

        env::remove_var("NYLAS_CLIENT_ID");
    }

    #[test]
    fn test_authorization_url() {
        let credentials = AppCredentials::new("app id", "secret");
        let url = AuthorizationRequest::new("https://example.com/callback")
            .scopes(["email.read_only", "calendar"])
            .login_hint("ada@example.com")
            .state("xyz")
            .url("https://api.nylas.com/", &credentials)
            .unwrap();

        assert_eq!(url.path(), "/oauth/authorize");
        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert_eq!(
            pairs,
            vec![
                ("client_id".to_string(), "app id".to_string()),
                ("redirect_uri".to_string(), "https://example.com/callback".to_string()),
                ("response_type".to_string(), "code".to_string()),
                ("scopes".to_string(), "email.read_only,calendar".to_string()),
                ("login_hint".to_string(), "ada@example.com".to_string()),
                ("state".to_string(), "xyz".to_string()),
            ]
        );
    }

    #[test]
    fn test_authorization_url_omits_optional_params() {
        let url = AuthorizationRequest::new("http://localhost/cb")
            .url("https://api.nylas.com", &AppCredentials::new("id", "s"))
            .unwrap();
        let query = url.query().unwrap();
        assert!(!query.contains("login_hint"));
        assert!(!query.contains("state"));
        assert!(query.contains("scopes=email%2Ccalendar%2Ccontacts"));
    }

    #[test]
    fn test_access_token_debug_redacts() {
        let token = AccessToken {
            access_token: "tok".to_string(),
            account_id: Some("acc".to_string()),
            email_address: None,
            provider: None,
            token_type: Some("bearer".to_string()),
        };
        assert!(!format!("{:?}", token).contains("tok\""));
    }
}
