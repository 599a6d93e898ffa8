//! OAuth credential lifecycle against the identity provider.
//!
//! The expiry decision ([`is_expired`]) is a pure function of the credential
//! and the current time. Everything that talks to the provider goes through the
//! [`CredentialManager`] trait so the orchestrator can be driven by stubs.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use serde::Deserialize;
use tracing::{debug, info, instrument, warn};
use url::Url;

use crate::error::CredentialError;
use crate::redact;
use crate::secret::SecretString;
use crate::types::OAuthCredential;

/// Credentials this close to expiry are refreshed before use.
pub const EXPIRY_BUFFER_SECS: i64 = 5 * 60;

pub const DEFAULT_SCOPES: [&str; 2] = [
    "https://www.googleapis.com/auth/bigquery",
    "https://www.googleapis.com/auth/cloud-platform",
];

/// `true` when `expires_at` is absent or `now >= expires_at - 5 minutes`.
/// An expiry too close to the start of the calendar to subtract the buffer
/// from is treated as expired.
pub fn is_expired(credential: &OAuthCredential, now: DateTime<Utc>) -> bool {
    credential
        .expires_at
        .and_then(|expires_at| {
            expires_at.checked_sub_signed(TimeDelta::seconds(EXPIRY_BUFFER_SECS))
        })
        .is_none_or(|deadline| now >= deadline)
}

#[async_trait]
pub trait CredentialManager: Send + Sync {
    /// Exchanges an authorization code. A response without a refresh token is
    /// an error: the user has to re-authorize with forced consent.
    async fn exchange_code(&self, code: &str) -> Result<OAuthCredential, CredentialError>;

    /// Returns the credential unchanged when it is still fresh, otherwise
    /// performs exactly one refresh.
    async fn ensure_valid(
        &self,
        credential: &OAuthCredential,
    ) -> Result<OAuthCredential, CredentialError>;

    /// Invalidates a token at the provider. Already-invalid tokens are not an error.
    async fn revoke(&self, token: &SecretString) -> Result<(), CredentialError>;

    /// Secret document handed to the infrastructure engine so it can act as the user.
    fn engine_credentials(&self, credential: &OAuthCredential) -> SecretString;
}

#[derive(Debug, Clone)]
pub struct OAuthClientConfig {
    pub(crate) client_id: String,
    pub(crate) client_secret: SecretString,
    pub(crate) redirect_uri: Url,
    pub(crate) auth_url: Url,
    pub(crate) token_url: Url,
    pub(crate) revoke_url: Url,
    pub(crate) scopes: Vec<String>,
}

impl OAuthClientConfig {
    pub fn new(
        client_id: impl Into<String>,
        client_secret: impl Into<SecretString>,
        redirect_uri: Url,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            redirect_uri,
            auth_url: "https://accounts.google.com/o/oauth2/v2/auth"
                .parse()
                .expect("valid default URL"),
            token_url: "https://oauth2.googleapis.com/token"
                .parse()
                .expect("valid default URL"),
            revoke_url: "https://oauth2.googleapis.com/revoke"
                .parse()
                .expect("valid default URL"),
            scopes: DEFAULT_SCOPES.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[must_use]
    pub fn with_auth_url(mut self, url: Url) -> Self {
        self.auth_url = url;
        self
    }

    #[must_use]
    pub fn with_token_url(mut self, url: Url) -> Self {
        self.token_url = url;
        self
    }

    #[must_use]
    pub fn with_revoke_url(mut self, url: Url) -> Self {
        self.revoke_url = url;
        self
    }

    #[must_use]
    pub fn with_scopes(mut self, scopes: Vec<String>) -> Self {
        self.scopes = scopes;
        self
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn client_secret(&self) -> &SecretString {
        &self.client_secret
    }

    pub fn redirect_uri(&self) -> &Url {
        &self.redirect_uri
    }

    pub fn scopes(&self) -> &[String] {
        &self.scopes
    }

    /// The `authorized_user` credential document the infrastructure engine's
    /// Google provider accepts. Contains the client secret and refresh token.
    pub fn authorized_user_bundle(&self, credential: &OAuthCredential) -> SecretString {
        let bundle = serde_json::json!({
            "type": "authorized_user",
            "client_id": self.client_id,
            "client_secret": self.client_secret.expose(),
            "refresh_token": credential.refresh_token.expose(),
        });
        SecretString::new(bundle.to_string())
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: SecretString,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    refresh_token: Option<SecretString>,
}

#[derive(Debug, Default, Deserialize)]
struct ProviderErrorBody {
    #[serde(default)]
    error: String,
}

pub struct GoogleCredentialManager {
    config: OAuthClientConfig,
    http: reqwest::Client,
    now: fn() -> DateTime<Utc>,
}

impl GoogleCredentialManager {
    pub fn new(config: OAuthClientConfig) -> Result<Self, CredentialError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            config,
            http,
            now: Utc::now,
        })
    }

    #[must_use]
    pub fn with_http_client(mut self, client: reqwest::Client) -> Self {
        self.http = client;
        self
    }

    #[must_use]
    pub fn with_clock(mut self, now: fn() -> DateTime<Utc>) -> Self {
        self.now = now;
        self
    }

    pub fn config(&self) -> &OAuthClientConfig {
        &self.config
    }

    /// Consent URL requesting offline access with forced consent, so the
    /// provider always issues a refresh token.
    pub fn authorization_url(&self, scopes: Option<&[String]>) -> Url {
        let scope = scopes.unwrap_or(self.config.scopes.as_slice()).join(" ");
        let mut url = self.config.auth_url.clone();
        url.query_pairs_mut()
            .append_pair("response_type", "code")
            .append_pair("client_id", &self.config.client_id)
            .append_pair("redirect_uri", self.config.redirect_uri.as_str())
            .append_pair("scope", &scope)
            .append_pair("access_type", "offline")
            .append_pair("prompt", "consent");
        url
    }

    #[instrument(skip(self, credential))]
    pub async fn refresh_access_token(
        &self,
        credential: &OAuthCredential,
    ) -> Result<OAuthCredential, CredentialError> {
        let params = [
            ("grant_type", "refresh_token"),
            ("refresh_token", credential.refresh_token.expose()),
            ("client_id", self.config.client_id.as_str()),
            ("client_secret", self.config.client_secret.expose()),
        ];
        let response = self
            .http
            .post(self.config.token_url.clone())
            .form(&params)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            warn!(status = status.as_u16(), "access token refresh rejected");
            return Err(CredentialError::Refresh {
                status: Some(status.as_u16()),
                detail: body,
            });
        }

        let tokens = parse_token_response(&body)?;
        let expires_at = self.expiry_from(tokens.expires_in)?;
        info!(
            has_access_token = !tokens.access_token.is_empty(),
            expires_at = ?expires_at,
            "refreshed access token"
        );
        Ok(credential.refreshed(tokens.access_token, expires_at))
    }

    fn expiry_from(
        &self,
        expires_in: Option<i64>,
    ) -> Result<Option<DateTime<Utc>>, CredentialError> {
        let Some(secs) = expires_in else {
            return Ok(None);
        };
        TimeDelta::try_seconds(secs)
            .and_then(|lifetime| (self.now)().checked_add_signed(lifetime))
            .map(Some)
            .ok_or_else(|| {
                CredentialError::InvalidResponse(format!("expires_in out of range: {secs}"))
            })
    }
}

#[async_trait]
impl CredentialManager for GoogleCredentialManager {
    #[instrument(skip(self, code))]
    async fn exchange_code(&self, code: &str) -> Result<OAuthCredential, CredentialError> {
        let params = [
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", self.config.redirect_uri.as_str()),
            ("client_id", self.config.client_id.as_str()),
            ("client_secret", self.config.client_secret.expose()),
        ];
        let response = self
            .http
            .post(self.config.token_url.clone())
            .form(&params)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            warn!(status = status.as_u16(), "authorization code exchange rejected");
            return Err(CredentialError::Exchange {
                status: Some(status.as_u16()),
                detail: body,
            });
        }

        let tokens = parse_token_response(&body)?;
        let expires_at = self.expiry_from(tokens.expires_in)?;
        info!(
            has_access_token = !tokens.access_token.is_empty(),
            has_refresh_token = tokens.refresh_token.is_some(),
            expires_at = ?expires_at,
            "exchanged authorization code"
        );

        let refresh_token = tokens
            .refresh_token
            .filter(|token| !token.is_empty())
            .ok_or(CredentialError::MissingRefreshToken)?;
        Ok(OAuthCredential {
            refresh_token,
            access_token: Some(tokens.access_token),
            expires_at,
        })
    }

    async fn ensure_valid(
        &self,
        credential: &OAuthCredential,
    ) -> Result<OAuthCredential, CredentialError> {
        if !is_expired(credential, (self.now)()) {
            debug!("using existing access token");
            return Ok(credential.clone());
        }
        info!("access token expired or absent, refreshing");
        self.refresh_access_token(credential).await
    }

    #[instrument(skip(self, token))]
    async fn revoke(&self, token: &SecretString) -> Result<(), CredentialError> {
        let response = self
            .http
            .post(self.config.revoke_url.clone())
            .form(&[("token", token.expose())])
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            info!(token = %redact::preview_secret(token), "token revoked");
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        let provider_error: ProviderErrorBody = serde_json::from_str(&body).unwrap_or_default();
        if status.as_u16() == 400 && provider_error.error == "invalid_token" {
            info!(
                token = %redact::preview_secret(token),
                "token already invalid at provider"
            );
            return Ok(());
        }

        warn!(status = status.as_u16(), "token revocation rejected");
        Err(CredentialError::Revocation {
            status: Some(status.as_u16()),
            detail: body,
        })
    }

    fn engine_credentials(&self, credential: &OAuthCredential) -> SecretString {
        self.config.authorized_user_bundle(credential)
    }
}

fn parse_token_response(body: &str) -> Result<TokenResponse, CredentialError> {
    serde_json::from_str(body).map_err(|err| CredentialError::InvalidResponse(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn credential_expiring_at(expires_at: Option<DateTime<Utc>>) -> OAuthCredential {
        OAuthCredential {
            refresh_token: SecretString::new("refresh"),
            access_token: Some(SecretString::new("access")),
            expires_at,
        }
    }

    #[test]
    fn missing_expiry_counts_as_expired() {
        assert!(is_expired(&credential_expiring_at(None), Utc::now()));
    }

    #[test]
    fn inside_buffer_counts_as_expired() {
        let now = Utc::now();
        let credential = credential_expiring_at(Some(now + TimeDelta::minutes(4)));
        assert!(is_expired(&credential, now));
    }

    #[test]
    fn outside_buffer_is_fresh() {
        let now = Utc::now();
        let credential = credential_expiring_at(Some(now + TimeDelta::minutes(10)));
        assert!(!is_expired(&credential, now));
    }

    #[test]
    fn buffer_boundary_is_expired() {
        let now = Utc::now();
        let credential = credential_expiring_at(Some(now + TimeDelta::minutes(5)));
        assert!(is_expired(&credential, now));
    }

    #[test]
    fn earliest_representable_expiry_is_expired() {
        let credential = credential_expiring_at(Some(DateTime::<Utc>::MIN_UTC));
        assert!(is_expired(&credential, Utc::now()));

        let far_past = DateTime::from_timestamp_millis(-8_334_601_228_800_000);
        assert!(far_past.is_some());
        assert!(is_expired(&credential_expiring_at(far_past), Utc::now()));
    }

    #[test]
    fn expiry_outside_calendar_is_invalid_response() {
        let manager = GoogleCredentialManager::new(test_config()).unwrap();
        assert!(matches!(
            manager.expiry_from(Some(i64::MAX)),
            Err(CredentialError::InvalidResponse(_))
        ));
        assert_eq!(manager.expiry_from(None).unwrap(), None);
        assert!(manager.expiry_from(Some(3600)).unwrap().is_some());
    }

    fn test_config() -> OAuthClientConfig {
        OAuthClientConfig::new(
            "client-123",
            "shh",
            "http://localhost:3000/oauth2callback".parse().unwrap(),
        )
    }

    #[test]
    fn authorization_url_forces_offline_consent() {
        let manager = GoogleCredentialManager::new(test_config()).unwrap();
        let url = manager.authorization_url(None);
        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();

        assert!(pairs.contains(&("access_type".into(), "offline".into())));
        assert!(pairs.contains(&("prompt".into(), "consent".into())));
        assert!(pairs.contains(&("client_id".into(), "client-123".into())));
        let scope = pairs
            .iter()
            .find(|(key, _)| key == "scope")
            .map(|(_, value)| value.clone())
            .unwrap();
        assert!(scope.contains("auth/bigquery"));
    }

    #[test]
    fn authorized_user_bundle_carries_refresh_token() {
        let config = test_config();
        let credential = OAuthCredential::from_refresh_token("1//refresh");
        let bundle = config.authorized_user_bundle(&credential);
        let value: serde_json::Value = serde_json::from_str(bundle.expose()).unwrap();
        assert_eq!(value["type"], "authorized_user");
        assert_eq!(value["client_id"], "client-123");
        assert_eq!(value["client_secret"], "shh");
        assert_eq!(value["refresh_token"], "1//refresh");
        assert_eq!(format!("{bundle}"), crate::secret::REDACTED);
    }
}
