pub mod config;
pub mod credential;
pub mod error;
pub mod lock;
pub mod naming;
pub mod orchestrator;
pub mod redact;
pub mod secret;
pub mod stack;
pub mod types;

pub use config::{ConfigError, LogFormat, ProvisionConfig};
pub use credential::{
    CredentialManager, GoogleCredentialManager, OAuthClientConfig, is_expired,
};
pub use error::{CredentialError, ProvisionError, StackError, ValidationError};
pub use lock::{StackGuard, StackLocks};
pub use naming::{compute_stack_name, parse_stack_name};
pub use orchestrator::{GrantSettings, ProvisioningOrchestrator, validate_request};
pub use secret::SecretString;
pub use stack::{
    ExecutionLimits, InMemoryStackExecutor, ProgressSender, PulumiCliExecutor, StackExecutor,
};
pub use types::{
    ApplyMode, ErrorBody, GrantRequestBody, GrantResponse, OAuthCredential, ProvisionPhase,
    ProvisioningRequest, ProvisioningResult, StackHandle, StackOutputs,
};
