//! Binary entry point for the hrobot CLI.

use std::io::{self, Write};
use std::net::Ipv4Addr;
use std::process;

use camino::Utf8Path;
use cap_std::{ambient_authority, fs_utf8::Dir};
use clap::Parser;
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use hrobot::logging::init_logging;
use hrobot::pipeline::{PipelineConfig, PipelineStage};
use hrobot::resource::{
    FileStateStore, LifecycleError, ManagedServer, ManagedServerState, ServerLifecycle,
    StateStoreError, seed_allocator,
};
use hrobot::robot::{RobotClient, RobotError, ServerInventory};
use hrobot::session::{ProcessCommandRunner, SessionConfig};
use hrobot::transactions::{
    OrderKind, OrderLifecycle, OrderRequest, TransactionCache, TransactionError,
};
use hrobot::vswitch::{VSwitchError, VSwitchLifecycle, VSwitchSpec};
use hrobot::{PrivateIpAllocator, RobotConfig};

mod cli;

use cli::{Cli, TransactionArgs, VSwitchArgs, VSwitchCommand};

#[derive(Debug, Error)]
enum CliError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("cannot read {path}: {message}")]
    Declaration { path: String, message: String },
    #[error("{0} not found")]
    NotFound(String),
    #[error(transparent)]
    Robot(#[from] RobotError),
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
    #[error(transparent)]
    Store(#[from] StateStoreError),
    #[error(transparent)]
    Transaction(#[from] TransactionError),
    #[error(transparent)]
    VSwitch(#[from] VSwitchError),
    #[error("cannot write output: {0}")]
    Output(String),
}

/// What `apply` and `refresh` print. The declaration carries secrets and is
/// left out.
#[derive(Debug, Serialize)]
struct StateSummary<'a> {
    name: &'a str,
    id: Option<&'a str>,
    server_number: u32,
    server_name: &'a str,
    local_ip: Option<Ipv4Addr>,
    version: u32,
    provisioned: bool,
    last_completed_stage: Option<PipelineStage>,
}

impl<'a> From<&'a ManagedServerState> for StateSummary<'a> {
    fn from(state: &'a ManagedServerState) -> Self {
        Self {
            name: state.name(),
            id: state.id.as_deref(),
            server_number: state.declared.server_number,
            server_name: &state.server_name,
            local_ip: state.local_ip,
            version: state.declared.version,
            provisioned: state.provisioned,
            last_completed_stage: state.last_completed_stage,
        }
    }
}

/// Long-lived collaborators of the managed server commands.
struct Host {
    client: RobotClient,
    store: FileStateStore,
    allocator: PrivateIpAllocator,
    inventory: ServerInventory,
    session: SessionConfig,
    pipeline: PipelineConfig,
}

impl Host {
    fn open(config: &RobotConfig, client: RobotClient) -> Result<Self, CliError> {
        let session = SessionConfig::load_without_cli_args()
            .map_err(|err| CliError::Config(err.to_string()))?;
        session
            .validate()
            .map_err(|err| CliError::Config(err.to_string()))?;
        let pipeline = PipelineConfig::load_without_cli_args()
            .map_err(|err| CliError::Config(err.to_string()))?;
        pipeline
            .validate()
            .map_err(|err| CliError::Config(err.to_string()))?;

        let store = FileStateStore::new(config.state_dir.as_str());
        let allocator = PrivateIpAllocator::new();
        seed_allocator(&store, &allocator)?;
        Ok(Self {
            client,
            store,
            allocator,
            inventory: ServerInventory::new(),
            session,
            pipeline,
        })
    }

    fn lifecycle(
        &self,
        cancel: CancellationToken,
    ) -> ServerLifecycle<'_, RobotClient, ProcessCommandRunner, FileStateStore> {
        ServerLifecycle::new(
            &self.client,
            ProcessCommandRunner,
            &self.allocator,
            &self.store,
            &self.inventory,
        )
        .with_session_config(self.session.clone())
        .with_pipeline_config(self.pipeline.clone())
        .with_cancellation(cancel)
    }
}

#[tokio::main]
async fn main() {
    init_logging();
    let cli = Cli::parse();
    let exit_code = match dispatch(cli).await {
        Ok(code) => code,
        Err(err) => {
            report_error(&err);
            1
        }
    };

    process::exit(exit_code);
}

async fn dispatch(cli: Cli) -> Result<i32, CliError> {
    let config = RobotConfig::load_without_cli_args()
        .map_err(|err| CliError::Config(err.to_string()))?;
    let client = RobotClient::new(&config)?;
    match cli {
        Cli::Apply(args) => {
            let declared: ManagedServer = read_json(&args.file)?;
            let host = Host::open(&config, client)?;
            let state = host.lifecycle(cancel_on_interrupt()).apply(declared).await?;
            print_json(&StateSummary::from(&state))?;
            Ok(0)
        }
        Cli::Destroy(args) => {
            let host = Host::open(&config, client)?;
            let removed = host
                .lifecycle(CancellationToken::new())
                .delete(&args.name)
                .await?;
            let outcome = if removed { "destroyed" } else { "not managed" };
            write_line(&format!("{}: {outcome}", args.name))?;
            Ok(0)
        }
        Cli::Refresh(args) => {
            let host = Host::open(&config, client)?;
            let Some(state) = host
                .lifecycle(CancellationToken::new())
                .read(&args.name)
                .await?
            else {
                return Err(CliError::NotFound(format!("managed server {}", args.name)));
            };
            print_json(&StateSummary::from(&state))?;
            Ok(0)
        }
        Cli::Order(args) => {
            let request: OrderRequest = read_json(&args.file)?;
            let (standard, market) = open_caches(&config);
            let placed = OrderLifecycle::new(&client, &standard, &market)
                .create(&request)
                .await?;
            print_json(&placed)?;
            Ok(0)
        }
        Cli::Transaction(args) => show_transaction(&config, &client, &args).await,
        Cli::Servers => {
            for server in ServerInventory::new().all(&client).await? {
                write_line(&format!(
                    "{}\t{}\t{}\t{}\t{}",
                    server.server_number,
                    server.server_name,
                    server.server_ip.as_deref().unwrap_or("-"),
                    server.product,
                    server.status
                ))?;
            }
            Ok(0)
        }
        Cli::Vswitch(command) => vswitch(&client, command).await,
    }
}

async fn show_transaction(
    config: &RobotConfig,
    client: &RobotClient,
    args: &TransactionArgs,
) -> Result<i32, CliError> {
    let kind = if args.market {
        OrderKind::Market
    } else {
        OrderKind::Standard
    };
    let (standard, market) = open_caches(config);
    let found = OrderLifecycle::new(client, &standard, &market)
        .read(kind, &args.id)
        .await?;
    let Some(current) = found else {
        return Err(CliError::NotFound(format!("transaction {}", args.id)));
    };
    print_json(&current)?;
    Ok(0)
}

async fn vswitch(client: &RobotClient, command: VSwitchCommand) -> Result<i32, CliError> {
    let switches = VSwitchLifecycle::new(client);
    match command {
        VSwitchCommand::Create(args) => print_json(&switches.create(&spec(args)).await?)?,
        VSwitchCommand::Get(args) => {
            let Some(found) = switches.read(args.id).await? else {
                return Err(CliError::NotFound(format!("vswitch {}", args.id)));
            };
            print_json(&found)?;
        }
        VSwitchCommand::Update { id, settings } => {
            print_json(&switches.update(id, &spec(settings)).await?)?;
        }
        VSwitchCommand::Delete(args) => {
            switches.delete(args.id).await?;
            write_line(&format!("vswitch {} deleted", args.id))?;
        }
    }
    Ok(0)
}

fn spec(args: VSwitchArgs) -> VSwitchSpec {
    VSwitchSpec {
        vlan: args.vlan,
        name: args.name,
    }
}

fn open_caches(config: &RobotConfig) -> (TransactionCache, TransactionCache) {
    let open = |kind: OrderKind| {
        kind.cache_path(config.cache_dir.as_deref()).map_or_else(
            || TransactionCache::in_memory(kind),
            |path| TransactionCache::open(kind, path),
        )
    };
    (open(OrderKind::Standard), open(OrderKind::Market))
}

/// Cancels the returned token on Ctrl-C so a running pipeline stops at the
/// next stage boundary.
fn cancel_on_interrupt() -> CancellationToken {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, stopping after the current stage");
            trigger.cancel();
        }
    });
    cancel
}

fn read_json<T: DeserializeOwned>(file: &str) -> Result<T, CliError> {
    let declaration = |message: String| CliError::Declaration {
        path: file.to_owned(),
        message,
    };
    let path = Utf8Path::new(file);
    let parent = path
        .parent()
        .filter(|dir| !dir.as_str().is_empty())
        .unwrap_or_else(|| Utf8Path::new("."));
    let name = path
        .file_name()
        .ok_or_else(|| declaration(String::from("not a file")))?;
    let contents = Dir::open_ambient_dir(parent, ambient_authority())
        .and_then(|dir| dir.read_to_string(name))
        .map_err(|err| declaration(err.to_string()))?;
    serde_json::from_str(&contents).map_err(|err| declaration(err.to_string()))
}

fn print_json<T: Serialize>(value: &T) -> Result<(), CliError> {
    let rendered =
        serde_json::to_string_pretty(value).map_err(|err| CliError::Output(err.to_string()))?;
    write_line(&rendered)
}

fn write_line(line: &str) -> Result<(), CliError> {
    writeln!(io::stdout(), "{line}").map_err(|err| CliError::Output(err.to_string()))
}

fn report_error(err: &CliError) {
    write_error(io::stderr(), err);
}

fn write_error(mut target: impl Write, err: &CliError) {
    writeln!(target, "{err}").ok();
}
