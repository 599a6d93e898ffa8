use std::sync::Arc;

use tracing::{Instrument, error, info, info_span, instrument, warn};

use crate::credential::CredentialManager;
use crate::error::{ProvisionError, StackError, ValidationError};
use crate::lock::StackLocks;
use crate::naming;
use crate::redact;
use crate::secret::SecretString;
use crate::stack::{
    CREDENTIALS_KEY, DATASET_KEY, MEMBER_KEY, PROJECT_KEY, ROLE_KEY, StackExecutor,
    progress_channel,
};
use crate::types::{
    ApplyMode, OAuthCredential, ProvisionPhase, ProvisioningRequest, ProvisioningResult,
    StackHandle, StackOutputs,
};

pub const DEFAULT_ROLE: &str = "roles/bigquery.dataViewer";

/// Who gets access to the dataset, written to every stack next to the credentials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrantSettings {
    pub member: Option<String>,
    pub role: String,
}

impl Default for GrantSettings {
    fn default() -> Self {
        Self {
            member: None,
            role: DEFAULT_ROLE.to_string(),
        }
    }
}

/// Runs one grant end to end. Calls for the same stack name are serialized on
/// the shared [`StackLocks`]; calls for different names run independently.
pub struct ProvisioningOrchestrator<C: CredentialManager, E: StackExecutor> {
    credentials: C,
    executor: E,
    locks: Arc<StackLocks>,
    grant: GrantSettings,
}

impl<C: CredentialManager, E: StackExecutor> ProvisioningOrchestrator<C, E> {
    pub fn new(credentials: C, executor: E, locks: Arc<StackLocks>) -> Self {
        Self {
            credentials,
            executor,
            locks,
            grant: GrantSettings::default(),
        }
    }

    #[must_use]
    pub fn with_grant(mut self, grant: GrantSettings) -> Self {
        self.grant = grant;
        self
    }

    pub fn locks(&self) -> &Arc<StackLocks> {
        &self.locks
    }

    pub fn credentials(&self) -> &C {
        &self.credentials
    }

    pub fn executor(&self) -> &E {
        &self.executor
    }

    #[instrument(
        skip(self, request),
        fields(account_id = %request.account_id, resource_id = %request.resource_id)
    )]
    pub async fn provision(
        &self,
        request: &ProvisioningRequest,
        mode: ApplyMode,
    ) -> Result<ProvisioningResult, ProvisionError> {
        let result = self.run(request, mode).await;
        match &result {
            Ok(outcome) => info!(
                phase = ProvisionPhase::Done.as_str(),
                stack = %outcome.stack_name,
                "provisioning finished"
            ),
            Err(err) => error!(
                phase = ProvisionPhase::Failed.as_str(),
                kind = err.kind(),
                stack = err.stack_name().unwrap_or_default(),
                error = %redact::scrub(&err.to_string(), &secrets_of(&request.credential)),
                "provisioning failed"
            ),
        }
        result
    }

    /// Revokes a token at the identity provider. Tokens the provider already
    /// considers invalid count as revoked.
    pub async fn revoke(&self, token: &SecretString) -> Result<(), ProvisionError> {
        self.credentials
            .revoke(token)
            .await
            .map_err(ProvisionError::Revocation)
    }

    async fn run(
        &self,
        request: &ProvisioningRequest,
        mode: ApplyMode,
    ) -> Result<ProvisioningResult, ProvisionError> {
        let account_id = request.account_id.as_str();
        let resource_id = request.resource_id.as_str();

        info!(phase = ProvisionPhase::Validating.as_str(), "validating request");
        let stack_name = validate_request(request)?;

        info!(
            phase = ProvisionPhase::Authenticating.as_str(),
            has_access_token = request.credential.access_token.is_some(),
            "checking credential"
        );
        let credential = self
            .credentials
            .ensure_valid(&request.credential)
            .await
            .map_err(|source| ProvisionError::Authentication {
                stack_name: stack_name.clone(),
                account_id: account_id.to_string(),
                resource_id: resource_id.to_string(),
                source,
            })?;

        info!(
            phase = ProvisionPhase::Locking.as_str(),
            stack = %stack_name,
            waiting = self.locks.is_locked(&stack_name),
            "acquiring stack lock"
        );
        let guard = self.locks.acquire(&stack_name).await;
        let stack = guard.handle();

        info!(phase = ProvisionPhase::Configuring.as_str(), stack = %stack.name, "configuring stack");
        self.configure(stack, &credential, account_id, resource_id)
            .await
            .map_err(|source| ProvisionError::Configuration {
                stack_name: stack.name.clone(),
                account_id: account_id.to_string(),
                resource_id: resource_id.to_string(),
                source,
            })?;

        info!(
            phase = ProvisionPhase::Applying.as_str(),
            stack = %stack.name,
            mode = ?mode,
            "applying stack"
        );
        let outputs = self
            .apply(stack, mode, &credential)
            .await
            .map_err(|source| ProvisionError::Deployment {
                stack_name: stack.name.clone(),
                account_id: account_id.to_string(),
                resource_id: resource_id.to_string(),
                source,
            })?;

        drop(guard);
        Ok(ProvisioningResult {
            stack_name,
            outputs,
        })
    }

    async fn configure(
        &self,
        stack: &StackHandle,
        credential: &OAuthCredential,
        account_id: &str,
        resource_id: &str,
    ) -> Result<(), StackError> {
        self.executor.select_stack(stack).await?;
        let bundle = self.credentials.engine_credentials(credential);
        self.executor
            .configure_secret(stack, CREDENTIALS_KEY, &bundle)
            .await?;
        self.executor
            .configure_value(stack, PROJECT_KEY, account_id)
            .await?;
        self.executor
            .configure_value(stack, DATASET_KEY, resource_id)
            .await?;
        match &self.grant.member {
            Some(member) => {
                self.executor
                    .configure_value(stack, MEMBER_KEY, member)
                    .await?
            }
            None => warn!(stack = %stack.name, "no grant member configured"),
        }
        self.executor
            .configure_value(stack, ROLE_KEY, &self.grant.role)
            .await
    }

    /// Runs the apply while draining its progress lines into the log. The
    /// diagnostic of a failed apply is scrubbed of the caller's tokens.
    async fn apply(
        &self,
        stack: &StackHandle,
        mode: ApplyMode,
        credential: &OAuthCredential,
    ) -> Result<StackOutputs, StackError> {
        let (tx, mut rx) = progress_channel();
        let forward = async {
            while let Some(line) = rx.recv().await {
                info!(stack = %stack.name, "{line}");
            }
        }
        .instrument(info_span!("progress"));

        let (result, ()) = tokio::join!(self.executor.apply(stack, mode, tx), forward);
        result.map_err(|err| match err {
            StackError::Apply { diagnostic } => StackError::Apply {
                diagnostic: redact::scrub(&diagnostic, &secrets_of(credential)),
            },
            other => other,
        })
    }
}

/// Checks a request without touching the provider or the engine and returns
/// the stack name it maps to. [`ProvisioningOrchestrator::provision`] runs the
/// same check first.
pub fn validate_request(request: &ProvisioningRequest) -> Result<String, ProvisionError> {
    check_request(request).map_err(|source| {
        ProvisionError::validation(&request.account_id, &request.resource_id, source)
    })
}

fn check_request(request: &ProvisioningRequest) -> Result<String, ValidationError> {
    if request.credential.refresh_token.is_empty() {
        return Err(ValidationError::Missing {
            field: "refresh_token",
        });
    }
    naming::compute_stack_name(&request.account_id, &request.resource_id)
}

fn secrets_of(credential: &OAuthCredential) -> Vec<&SecretString> {
    std::iter::once(&credential.refresh_token)
        .chain(credential.access_token.as_ref())
        .collect()
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;

    fn request(refresh: &str, account: &str, resource: &str) -> ProvisioningRequest {
        ProvisioningRequest::new(OAuthCredential::from_refresh_token(refresh), account, resource)
    }

    #[test]
    fn validate_checks_token_before_identifiers() {
        assert_eq!(
            check_request(&request("", "proj-1", "ds-1")),
            Err(ValidationError::Missing {
                field: "refresh_token"
            })
        );
        assert_eq!(
            check_request(&request("   ", "", "")),
            Err(ValidationError::Missing {
                field: "refresh_token"
            })
        );
        assert!(matches!(
            check_request(&request("tok", "proj-1", "")),
            Err(ValidationError::Missing { .. })
        ));
        assert_eq!(
            check_request(&request("tok", "proj-1", "ds-1")).unwrap(),
            "tenant-proj-1.ds-1"
        );
    }

    #[test]
    fn validation_errors_name_the_tenant() {
        let err = validate_request(&request("tok", "proj-1", "")).unwrap_err();
        match err {
            ProvisionError::Validation {
                account_id,
                resource_id,
                source,
            } => {
                assert_eq!(account_id, "proj-1");
                assert_eq!(resource_id, "");
                assert!(matches!(source, ValidationError::Missing { .. }));
            }
            other => panic!("expected validation error, got {other:?}"),
        }
        assert_eq!(
            validate_request(&request("tok", "proj-1", "ds-1")).unwrap(),
            "tenant-proj-1.ds-1"
        );
    }

    #[test]
    fn secrets_include_access_token_when_present() {
        let credential = OAuthCredential::from_refresh_token("refresh")
            .with_access_token("access", Utc::now());
        let secrets = secrets_of(&credential);
        assert_eq!(secrets.len(), 2);
        assert_eq!(secrets_of(&OAuthCredential::from_refresh_token("r")).len(), 1);
    }
}
