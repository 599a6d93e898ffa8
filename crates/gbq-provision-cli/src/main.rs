use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use async_trait::async_trait;
use clap::{Parser, Subcommand};
use gbq_provision_core::config::LogSettings;
use gbq_provision_core::{
    ApplyMode, ConfigError, CredentialError, CredentialManager, ErrorBody,
    GoogleCredentialManager, GrantRequestBody, GrantResponse, InMemoryStackExecutor, LogFormat,
    ProgressSender, ProvisionConfig, ProvisionError, ProvisioningOrchestrator,
    ProvisioningRequest, PulumiCliExecutor, SecretString, StackError, StackExecutor, StackHandle,
    StackLocks, StackOutputs, ValidationError, compute_stack_name, validate_request,
};
use serde_json::{Value, json};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "gbq-provision")]
#[command(about = "Grants tenant access to BigQuery datasets through per-tenant Pulumi stacks", long_about = None)]
struct Cli {
    /// TOML settings file; environment variables override its values.
    #[arg(long, global = true, env = "GBQ_PROVISION_CONFIG")]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    Auth {
        #[command(subcommand)]
        command: AuthCommands,
    },
    Grant(GrantArgs),
    StackName {
        #[arg(long)]
        project_id: String,
        #[arg(long)]
        dataset_id: String,
    },
}

#[derive(Debug, Subcommand)]
enum AuthCommands {
    /// Prints the consent URL (offline access, forced consent).
    Url {
        #[arg(long = "scope")]
        scopes: Vec<String>,
    },
    Exchange {
        #[arg(long)]
        code: String,
    },
    Revoke {
        #[arg(long, env = "GBQ_REVOKE_TOKEN", hide_env_values = true)]
        token: String,
    },
}

#[derive(Debug, clap::Args)]
struct GrantArgs {
    /// JSON grant request (`refreshToken`, `projectId`, `datasetId`, ...); `-` reads stdin.
    #[arg(long)]
    request: Option<PathBuf>,
    #[arg(long)]
    project_id: Option<String>,
    #[arg(long)]
    dataset_id: Option<String>,
    #[arg(long, env = "GBQ_REFRESH_TOKEN", hide_env_values = true)]
    refresh_token: Option<String>,
    #[arg(long, env = "GBQ_ACCESS_TOKEN", hide_env_values = true)]
    access_token: Option<String>,
    /// Access token expiry in milliseconds since the Unix epoch.
    #[arg(long)]
    expiry_date: Option<i64>,
    #[arg(long, default_value = "pulumi")]
    executor: ExecutorKind,
    /// Preview the change instead of applying it.
    #[arg(long)]
    dry_run: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum ExecutorKind {
    Memory,
    Pulumi,
}

enum CliExecutor {
    Memory(InMemoryStackExecutor),
    Pulumi(PulumiCliExecutor),
}

#[async_trait]
impl StackExecutor for CliExecutor {
    async fn select_stack(&self, stack: &StackHandle) -> Result<(), StackError> {
        match self {
            CliExecutor::Memory(exec) => exec.select_stack(stack).await,
            CliExecutor::Pulumi(exec) => exec.select_stack(stack).await,
        }
    }

    async fn configure_secret(
        &self,
        stack: &StackHandle,
        key: &str,
        value: &SecretString,
    ) -> Result<(), StackError> {
        match self {
            CliExecutor::Memory(exec) => exec.configure_secret(stack, key, value).await,
            CliExecutor::Pulumi(exec) => exec.configure_secret(stack, key, value).await,
        }
    }

    async fn configure_value(
        &self,
        stack: &StackHandle,
        key: &str,
        value: &str,
    ) -> Result<(), StackError> {
        match self {
            CliExecutor::Memory(exec) => exec.configure_value(stack, key, value).await,
            CliExecutor::Pulumi(exec) => exec.configure_value(stack, key, value).await,
        }
    }

    async fn apply(
        &self,
        stack: &StackHandle,
        mode: ApplyMode,
        progress: ProgressSender,
    ) -> Result<StackOutputs, StackError> {
        match self {
            CliExecutor::Memory(exec) => exec.apply(stack, mode, progress).await,
            CliExecutor::Pulumi(exec) => exec.apply(stack, mode, progress).await,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match ProvisionConfig::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(err) => return report(CliError::from(err)),
    };
    init_tracing(&config.log);

    match run(cli.command, &config).await {
        Ok(body) => {
            println!("{body}");
            ExitCode::SUCCESS
        }
        Err(err) => report(err),
    }
}

async fn run(command: Commands, config: &ProvisionConfig) -> Result<Value, CliError> {
    match command {
        Commands::Auth { command } => {
            let manager = GoogleCredentialManager::new(config.oauth_client()?)?;
            match command {
                AuthCommands::Url { scopes } => {
                    let scopes = (!scopes.is_empty()).then_some(scopes.as_slice());
                    let url = manager.authorization_url(scopes);
                    Ok(json!({ "authorizationUrl": url.as_str() }))
                }
                AuthCommands::Exchange { code } => {
                    let credential = manager.exchange_code(&code).await?;
                    // The operator asked for this token; it goes to stdout only.
                    Ok(json!({
                        "message": "Authorization successful",
                        "refreshToken": credential.refresh_token.expose(),
                        "expiryDate": credential.expires_at.map(|at| at.timestamp_millis()),
                    }))
                }
                AuthCommands::Revoke { token } => {
                    manager
                        .revoke(&SecretString::new(token))
                        .await
                        .map_err(ProvisionError::Revocation)?;
                    Ok(json!({ "message": "Token revoked successfully" }))
                }
            }
        }
        Commands::Grant(args) => grant(args, config).await,
        Commands::StackName {
            project_id,
            dataset_id,
        } => {
            let stack_name = compute_stack_name(&project_id, &dataset_id)?;
            Ok(json!({ "stackName": stack_name }))
        }
    }
}

async fn grant(args: GrantArgs, config: &ProvisionConfig) -> Result<Value, CliError> {
    let mut body = match &args.request {
        Some(path) => load_request(path)?,
        None => GrantRequestBody::default(),
    };
    if let Some(project_id) = args.project_id {
        body.project_id = project_id;
    }
    if let Some(dataset_id) = args.dataset_id {
        body.dataset_id = dataset_id;
    }
    if let Some(token) = args.refresh_token {
        body.refresh_token = Some(SecretString::new(token));
    }
    if let Some(token) = args.access_token {
        body.access_token = Some(SecretString::new(token));
    }
    if args.expiry_date.is_some() {
        body.expiry_date = args.expiry_date;
    }
    let request = ProvisioningRequest::from(body);
    // A bad request is the caller's to fix, whatever the local settings.
    let stack_name = validate_request(&request)?;

    let mode = if args.dry_run {
        ApplyMode::DryRun
    } else {
        ApplyMode::Apply
    };
    let executor = match args.executor {
        ExecutorKind::Memory => CliExecutor::Memory(InMemoryStackExecutor::new()),
        ExecutorKind::Pulumi => {
            if mode == ApplyMode::Apply {
                config.require_member()?;
            }
            CliExecutor::Pulumi(config.pulumi_executor()?)
        }
    };
    let credentials = GoogleCredentialManager::new(config.oauth_client()?)?;
    let orchestrator =
        ProvisioningOrchestrator::new(credentials, executor, Arc::new(StackLocks::new()))
            .with_grant(config.grant.clone());

    info!(executor = ?args.executor, mode = ?mode, stack = %stack_name, "starting grant");
    let result = orchestrator.provision(&request, mode).await?;
    Ok(serde_json::to_value(GrantResponse::from(result))?)
}

fn load_request(path: &Path) -> Result<GrantRequestBody, CliError> {
    let raw = if path == Path::new("-") {
        std::io::read_to_string(std::io::stdin())?
    } else {
        std::fs::read_to_string(path)?
    };
    Ok(serde_json::from_str(&raw)?)
}

fn init_tracing(log: &LogSettings) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match log.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Pretty => builder.init(),
    }
}

fn report(err: CliError) -> ExitCode {
    let body = err.body();
    match serde_json::to_string_pretty(&body) {
        Ok(json) => println!("{json}"),
        Err(_) => println!("{{\"error\":\"{}\"}}", body.error),
    }
    eprintln!("error: {err}");
    ExitCode::from(err.exit_code())
}

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Credential(#[from] CredentialError),
    #[error(transparent)]
    Provision(#[from] ProvisionError),
    #[error("failed to read request: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse JSON: {0}")]
    Json(#[from] serde_json::Error),
}

impl CliError {
    fn body(&self) -> ErrorBody {
        match self {
            CliError::Config(err) => ErrorBody::new("Configuration Error", err.to_string()),
            CliError::Validation(err) => ErrorBody::new("Validation Error", err.to_string()),
            CliError::Credential(err) => err.to_body(),
            CliError::Provision(err) => err.to_body(),
            CliError::Io(_) | CliError::Json(_) => {
                ErrorBody::new("Invalid Request", "The grant request could not be read")
            }
        }
    }

    /// 2 for errors the caller can fix by resubmitting, 1 for everything else.
    fn exit_code(&self) -> u8 {
        match self {
            CliError::Validation(_) | CliError::Io(_) | CliError::Json(_) => 2,
            CliError::Credential(CredentialError::Http(_)) => 1,
            CliError::Credential(_) => 2,
            CliError::Provision(err) if err.status_code() < 500 => 2,
            CliError::Provision(_) | CliError::Config(_) => 1,
        }
    }
}
