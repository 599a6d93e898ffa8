//! Boundary to the infrastructure engine.

mod memory;
mod pulumi;

pub use memory::InMemoryStackExecutor;
pub use pulumi::{ExecutionLimits, PulumiCliExecutor};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::StackError;
use crate::secret::SecretString;
use crate::types::{ApplyMode, StackHandle, StackOutputs};

pub const CREDENTIALS_KEY: &str = "gcp:credentials";
pub const PROJECT_KEY: &str = "gcp:project";
pub const DATASET_KEY: &str = "datasetId";
pub const MEMBER_KEY: &str = "member";
pub const ROLE_KEY: &str = "role";

/// Receives engine progress lines while an apply runs. The apply owns the
/// sender; dropping it ends the sequence.
pub type ProgressSender = mpsc::Sender<String>;
pub type ProgressReceiver = mpsc::Receiver<String>;

pub fn progress_channel() -> (ProgressSender, ProgressReceiver) {
    mpsc::channel(64)
}

#[async_trait]
pub trait StackExecutor: Send + Sync {
    /// Creates the stack if it does not exist yet, otherwise selects it.
    async fn select_stack(&self, stack: &StackHandle) -> Result<(), StackError>;

    /// Stores `value` encrypted; the engine redacts it in its own output.
    async fn configure_secret(
        &self,
        stack: &StackHandle,
        key: &str,
        value: &SecretString,
    ) -> Result<(), StackError>;

    async fn configure_value(
        &self,
        stack: &StackHandle,
        key: &str,
        value: &str,
    ) -> Result<(), StackError>;

    /// Runs a full plan-and-apply (or a preview for [`ApplyMode::DryRun`]) and
    /// returns the stack outputs. No rollback is attempted on failure.
    async fn apply(
        &self,
        stack: &StackHandle,
        mode: ApplyMode,
        progress: ProgressSender,
    ) -> Result<StackOutputs, StackError>;
}
