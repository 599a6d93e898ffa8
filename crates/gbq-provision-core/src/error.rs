use crate::types::ErrorBody;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("{field} is required")]
    Missing { field: &'static str },
    #[error("{field} is malformed: {reason}")]
    Malformed { field: &'static str, reason: String },
    #[error("stack name for {account_id}/{resource_id} would be {length} characters (max {max})")]
    NameTooLong {
        account_id: String,
        resource_id: String,
        length: usize,
        max: usize,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("no refresh token was returned; revoke access and re-authorize with forced consent")]
    MissingRefreshToken,
    #[error("authorization code exchange failed ({status:?}): {detail}")]
    Exchange { status: Option<u16>, detail: String },
    #[error("access token refresh failed ({status:?}): {detail}")]
    Refresh { status: Option<u16>, detail: String },
    #[error("token revocation failed ({status:?}): {detail}")]
    Revocation { status: Option<u16>, detail: String },
    #[error("identity provider returned an invalid response: {0}")]
    InvalidResponse(String),
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl CredentialError {
    pub fn to_body(&self) -> ErrorBody {
        match self {
            CredentialError::MissingRefreshToken => ErrorBody::new(
                "Missing Refresh Token",
                "No refresh token was received. Please revoke access and try again.",
            ),
            CredentialError::Revocation { .. } => {
                ErrorBody::new("Revocation Error", "Failed to revoke token")
            }
            _ => ErrorBody::new(
                "Authentication Error",
                "The credential could not be validated. Please re-authorize.",
            ),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StackError {
    #[error("failed to create or select stack {stack}: {message}")]
    Select { stack: String, message: String },
    #[error("failed to set config {key}: {message}")]
    Config { key: String, message: String },
    #[error("apply failed: {diagnostic}")]
    Apply { diagnostic: String },
    #[error("failed to read stack outputs: {0}")]
    Outputs(String),
    #[error("failed to run infrastructure engine: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("engine command timed out after {0} seconds")]
    TimedOut(u64),
}

/// Failure of one orchestration call. Request-scoped variants carry the
/// tenant identifiers as submitted, plus the stack name once it is known.
#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    #[error("invalid request for {account_id}/{resource_id}: {source}")]
    Validation {
        account_id: String,
        resource_id: String,
        #[source]
        source: ValidationError,
    },
    #[error("authentication failed for stack {stack_name}: {source}")]
    Authentication {
        stack_name: String,
        account_id: String,
        resource_id: String,
        #[source]
        source: CredentialError,
    },
    #[error("configuring stack {stack_name} for {account_id}/{resource_id} failed: {source}")]
    Configuration {
        stack_name: String,
        account_id: String,
        resource_id: String,
        #[source]
        source: StackError,
    },
    #[error("deploying stack {stack_name} for {account_id}/{resource_id} failed: {source}")]
    Deployment {
        stack_name: String,
        account_id: String,
        resource_id: String,
        #[source]
        source: StackError,
    },
    #[error("revocation failed: {0}")]
    Revocation(#[source] CredentialError),
}

impl ProvisionError {
    pub fn validation(
        account_id: impl Into<String>,
        resource_id: impl Into<String>,
        source: ValidationError,
    ) -> Self {
        ProvisionError::Validation {
            account_id: account_id.into(),
            resource_id: resource_id.into(),
            source,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ProvisionError::Validation { .. } => "ValidationError",
            ProvisionError::Authentication { .. } => "AuthenticationError",
            ProvisionError::Configuration { .. } => "ConfigurationError",
            ProvisionError::Deployment { .. } => "DeploymentError",
            ProvisionError::Revocation(_) => "RevocationError",
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            ProvisionError::Validation { .. } | ProvisionError::Authentication { .. } => 400,
            _ => 500,
        }
    }

    pub fn stack_name(&self) -> Option<&str> {
        match self {
            ProvisionError::Authentication { stack_name, .. }
            | ProvisionError::Configuration { stack_name, .. }
            | ProvisionError::Deployment { stack_name, .. } => Some(stack_name),
            _ => None,
        }
    }

    /// Caller-facing body. Server-side failures get a fixed message; the
    /// diagnostic only goes to the operator log.
    pub fn to_body(&self) -> ErrorBody {
        match self {
            ProvisionError::Validation { source, .. } => {
                ErrorBody::new("Validation Error", source.to_string())
            }
            ProvisionError::Authentication { source, .. } => source.to_body(),
            ProvisionError::Configuration { .. } => ErrorBody::new(
                "Configuration Error",
                "Failed to configure the provisioning stack",
            ),
            ProvisionError::Deployment { .. } => ErrorBody::new(
                "Deployment Error",
                "Failed to grant access to BigQuery dataset",
            ),
            ProvisionError::Revocation(_) => {
                ErrorBody::new("Revocation Error", "Failed to revoke token")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_errors_map_to_400() {
        let err = ProvisionError::validation(
            "proj-1",
            "",
            ValidationError::Missing {
                field: "resource_id",
            },
        );
        assert_eq!(err.status_code(), 400);
        assert_eq!(err.kind(), "ValidationError");
        assert_eq!(err.stack_name(), None);
        assert_eq!(err.to_body().message, "resource_id is required");
        assert!(err.to_string().contains("proj-1/"));
    }

    #[test]
    fn deployment_body_hides_diagnostic() {
        let err = ProvisionError::Deployment {
            stack_name: "tenant-p.d".to_string(),
            account_id: "p".to_string(),
            resource_id: "d".to_string(),
            source: StackError::Apply {
                diagnostic: "quota exceeded for project p".to_string(),
            },
        };
        assert_eq!(err.status_code(), 500);
        assert_eq!(err.stack_name(), Some("tenant-p.d"));
        let body = err.to_body();
        assert!(!body.message.contains("quota"));
        assert!(err.to_string().contains("quota exceeded"));
    }

    #[test]
    fn missing_refresh_token_asks_for_reconsent() {
        let err = ProvisionError::Authentication {
            stack_name: "tenant-p.d".to_string(),
            account_id: "p".to_string(),
            resource_id: "d".to_string(),
            source: CredentialError::MissingRefreshToken,
        };
        assert_eq!(err.to_body().error, "Missing Refresh Token");
        assert_eq!(err.stack_name(), Some("tenant-p.d"));
    }
}
