use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde_json::Value;

use crate::error::StackError;
use crate::secret::SecretString;
use crate::stack::{PROJECT_KEY, ProgressSender, StackExecutor};
use crate::types::{ApplyMode, StackHandle, StackOutputs};

#[derive(Debug, Default)]
struct StackState {
    config: BTreeMap<String, String>,
    secrets: BTreeMap<String, SecretString>,
    applies: usize,
}

/// Offline executor keeping every stack in process memory. Outputs mirror the
/// non-secret config, the way the infrastructure program exports it.
#[derive(Debug, Default)]
pub struct InMemoryStackExecutor {
    stacks: Mutex<BTreeMap<String, StackState>>,
}

impl InMemoryStackExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(&self, stack: &str) -> BTreeMap<String, String> {
        self.stacks()
            .get(stack)
            .map(|state| state.config.clone())
            .unwrap_or_default()
    }

    pub fn secret_keys(&self, stack: &str) -> Vec<String> {
        self.stacks()
            .get(stack)
            .map(|state| state.secrets.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn applies(&self, stack: &str) -> usize {
        self.stacks()
            .get(stack)
            .map(|state| state.applies)
            .unwrap_or_default()
    }

    pub fn stack_names(&self) -> Vec<String> {
        self.stacks().keys().cloned().collect()
    }

    fn stacks(&self) -> MutexGuard<'_, BTreeMap<String, StackState>> {
        self.stacks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn with_stack<T>(
        &self,
        stack: &StackHandle,
        key: &str,
        f: impl FnOnce(&mut StackState) -> T,
    ) -> Result<T, StackError> {
        let mut stacks = self.stacks();
        let state = stacks.get_mut(&stack.name).ok_or_else(|| StackError::Config {
            key: key.to_string(),
            message: format!("stack {} has not been selected", stack.name),
        })?;
        Ok(f(state))
    }
}

#[async_trait]
impl StackExecutor for InMemoryStackExecutor {
    async fn select_stack(&self, stack: &StackHandle) -> Result<(), StackError> {
        self.stacks().entry(stack.name.clone()).or_default();
        Ok(())
    }

    async fn configure_secret(
        &self,
        stack: &StackHandle,
        key: &str,
        value: &SecretString,
    ) -> Result<(), StackError> {
        self.with_stack(stack, key, |state| {
            state.secrets.insert(key.to_string(), value.clone());
        })
    }

    async fn configure_value(
        &self,
        stack: &StackHandle,
        key: &str,
        value: &str,
    ) -> Result<(), StackError> {
        self.with_stack(stack, key, |state| {
            state.config.insert(key.to_string(), value.to_string());
        })
    }

    async fn apply(
        &self,
        stack: &StackHandle,
        mode: ApplyMode,
        progress: ProgressSender,
    ) -> Result<StackOutputs, StackError> {
        let (lines, outputs) = {
            let mut stacks = self.stacks();
            let state = stacks.get_mut(&stack.name).ok_or_else(|| StackError::Apply {
                diagnostic: format!("stack {} does not exist", stack.name),
            })?;

            let verb = match mode {
                ApplyMode::DryRun => "Previewing update",
                ApplyMode::Apply => "Updating",
            };
            let mut lines = vec![format!("{verb} ({})", stack.name)];
            lines.extend(state.config.keys().map(|key| format!("    config {key}")));
            lines.extend(
                state
                    .secrets
                    .keys()
                    .map(|key| format!("    config {key} [secret]")),
            );

            let outputs = match mode {
                ApplyMode::DryRun => StackOutputs::new(),
                ApplyMode::Apply => {
                    state.applies += 1;
                    lines.push(format!("Resources: {} applied", state.applies));
                    state
                        .config
                        .iter()
                        .map(|(key, value)| {
                            let name = if key == PROJECT_KEY { "projectId" } else { key.as_str() };
                            (name.to_string(), Value::String(value.clone()))
                        })
                        .collect()
                }
            };
            (lines, outputs)
        };

        for line in lines {
            // A dropped receiver only means nobody is listening.
            let _ = progress.send(line).await;
        }
        Ok(outputs)
    }
}
