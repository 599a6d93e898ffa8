use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::secret::SecretString;

pub type StackOutputs = BTreeMap<String, Value>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OAuthCredential {
    pub refresh_token: SecretString,
    pub access_token: Option<SecretString>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl OAuthCredential {
    pub fn from_refresh_token(refresh_token: impl Into<SecretString>) -> Self {
        Self {
            refresh_token: refresh_token.into(),
            access_token: None,
            expires_at: None,
        }
    }

    pub fn with_access_token(
        mut self,
        access_token: impl Into<SecretString>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        self.access_token = Some(access_token.into());
        self.expires_at = Some(expires_at);
        self
    }

    /// Applies the mutable half of a refresh; the refresh token itself never changes here.
    pub fn refreshed(
        &self,
        access_token: SecretString,
        expires_at: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            refresh_token: self.refresh_token.clone(),
            access_token: Some(access_token),
            expires_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisioningRequest {
    pub credential: OAuthCredential,
    pub account_id: String,
    pub resource_id: String,
}

impl ProvisioningRequest {
    pub fn new(
        credential: OAuthCredential,
        account_id: impl Into<String>,
        resource_id: impl Into<String>,
    ) -> Self {
        Self {
            credential,
            account_id: account_id.into(),
            resource_id: resource_id.into(),
        }
    }
}

/// Wire shape of a grant request as delivered by the front controller.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct GrantRequestBody {
    #[serde(default)]
    pub refresh_token: Option<SecretString>,
    #[serde(default)]
    pub project_id: String,
    #[serde(default)]
    pub dataset_id: String,
    #[serde(default)]
    pub access_token: Option<SecretString>,
    /// Milliseconds since the Unix epoch.
    #[serde(default)]
    pub expiry_date: Option<i64>,
}

impl From<GrantRequestBody> for ProvisioningRequest {
    fn from(body: GrantRequestBody) -> Self {
        let expires_at = body.expiry_date.and_then(DateTime::<Utc>::from_timestamp_millis);
        let credential = OAuthCredential {
            refresh_token: body.refresh_token.unwrap_or_else(|| SecretString::new("")),
            access_token: body.access_token,
            expires_at,
        };
        ProvisioningRequest::new(credential, body.project_id, body.dataset_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StackHandle {
    pub name: String,
    pub locked: bool,
}

impl StackHandle {
    pub fn unlocked(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            locked: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProvisioningResult {
    pub stack_name: String,
    pub outputs: StackOutputs,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProvisionPhase {
    Validating,
    Authenticating,
    Locking,
    Configuring,
    Applying,
    Done,
    Failed,
}

impl ProvisionPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProvisionPhase::Validating => "validating",
            ProvisionPhase::Authenticating => "authenticating",
            ProvisionPhase::Locking => "locking",
            ProvisionPhase::Configuring => "configuring",
            ProvisionPhase::Applying => "applying",
            ProvisionPhase::Done => "done",
            ProvisionPhase::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ApplyMode {
    DryRun,
    #[default]
    Apply,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GrantResponse {
    pub message: String,
    pub stack_name: String,
    pub outputs: StackOutputs,
}

impl From<ProvisioningResult> for GrantResponse {
    fn from(result: ProvisioningResult) -> Self {
        Self {
            message: "Access granted successfully".to_string(),
            stack_name: result.stack_name,
            outputs: result.outputs,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorBody {
    pub error: String,
    pub message: String,
}

impl ErrorBody {
    pub fn new(error: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            message: message.into(),
        }
    }
}
