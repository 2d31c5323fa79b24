//! fleetdeck CLI — thin command-line front over the control-plane library.
//!
//! Usage:
//!   fleetdeck login --username ops --password secret [--remember]
//!   fleetdeck containers | hosts
//!   fleetdeck watch [--sse]
//!   fleetdeck bulk-update [--host h1] [--name web] [--dry-run]

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use url::Url;

use fleetdeck::{
    bulk_update, ApiClient, BulkUpdateFilter, ClientConfig, ContainerAction, FileStore,
    LiveSync, LoginCredentials, LoginOutcome, MemoryStore, SessionManager, TransportKind,
};

#[derive(Parser, Debug)]
#[command(name = "fleetdeck")]
#[command(about = "Control plane client for a multi-host container fleet")]
struct Args {
    /// Aggregator base URL
    #[arg(long, default_value = "http://localhost:3001/api")]
    base_url: String,

    /// Directory for the reload-surviving session state
    #[arg(long)]
    state_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Authenticate and persist the session
    Login {
        #[arg(long)]
        username: String,
        #[arg(long)]
        password: String,
        /// Second-factor code, when the account requires one
        #[arg(long)]
        totp: Option<String>,
        /// Persist the session across restarts
        #[arg(long)]
        remember: bool,
    },
    /// Clear the session (best-effort server notification)
    Logout,
    /// List all containers
    Containers,
    /// List all hosts
    Hosts,
    /// Start, stop or restart one container
    Action {
        host_id: String,
        container_id: String,
        /// start | stop | restart
        action: String,
    },
    /// Follow the live fleet event stream
    Watch {
        /// Use the SSE transport instead of WebSocket
        #[arg(long)]
        sse: bool,
    },
    /// Trigger image updates across a filtered subset of containers
    BulkUpdate {
        /// Only containers on this host id
        #[arg(long)]
        host: Option<String>,
        /// Only containers whose name contains this substring
        #[arg(long)]
        name: Option<String>,
        /// Report the matched set without updating anything
        #[arg(long)]
        dry_run: bool,
    },
}

fn state_path(args: &Args) -> PathBuf {
    args.state_dir
        .clone()
        .unwrap_or_else(|| PathBuf::from(".fleetdeck"))
        .join("state.json")
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    let base_url = match Url::parse(&args.base_url) {
        Ok(url) => url,
        Err(e) => {
            eprintln!("Error: invalid base url: {e}");
            std::process::exit(1);
        }
    };

    let transport = match args.command {
        Commands::Watch { sse: true } => TransportKind::Sse,
        _ => TransportKind::WebSocket,
    };
    let config = Arc::new(ClientConfig::new(base_url).with_transport(transport));
    let durable = Arc::new(FileStore::open(state_path(&args)));
    let session =
        SessionManager::new(config.clone(), durable.clone(), Arc::new(MemoryStore::new()));
    let api = ApiClient::new(config.clone(), durable.clone());

    let exit_code = match args.command {
        Commands::Login {
            username,
            password,
            totp,
            remember,
        } => {
            let mut credentials = LoginCredentials::new(username, password);
            credentials.totp_code = totp;
            credentials.remember_me = remember;
            match session.login(&credentials).await {
                LoginOutcome::Success => {
                    println!("Logged in as {}", credentials.username);
                    0
                }
                LoginOutcome::SecondFactorRequired { .. } => {
                    eprintln!("Second factor required; retry with --totp <code>");
                    1
                }
                LoginOutcome::Failed { message } => {
                    eprintln!("Login failed: {message}");
                    1
                }
            }
        }
        Commands::Logout => {
            session.logout().await;
            println!("Logged out");
            0
        }
        Commands::Containers => match api.fetch_containers().await {
            Ok(containers) => {
                for c in containers {
                    println!("{}  {:<12} {:<30} {}", c.id, c.state, c.name, c.host_name);
                }
                0
            }
            Err(e) => {
                eprintln!("Error: {e}");
                1
            }
        },
        Commands::Hosts => match api.fetch_hosts().await {
            Ok(hosts) => {
                for h in hosts {
                    let status = if h.online { "online" } else { "offline" };
                    println!(
                        "{}  {:<20} {:<8} {}/{} running",
                        h.id, h.name, status, h.running_count, h.container_count
                    );
                }
                0
            }
            Err(e) => {
                eprintln!("Error: {e}");
                1
            }
        },
        Commands::Action {
            host_id,
            container_id,
            action,
        } => {
            let action = match action.as_str() {
                "start" => ContainerAction::Start,
                "stop" => ContainerAction::Stop,
                "restart" => ContainerAction::Restart,
                other => {
                    eprintln!("Error: unknown action '{other}' (start|stop|restart)");
                    std::process::exit(1);
                }
            };
            match api.container_action(&host_id, &container_id, action).await {
                Ok(()) => {
                    println!("{} {}", action.as_str(), container_id);
                    0
                }
                Err(e) => {
                    eprintln!("Error: {e}");
                    1
                }
            }
        }
        Commands::Watch { .. } => {
            let live = LiveSync::new(config, durable);
            let mut events = live.subscribe();
            let handle = live.connect();
            println!("Watching fleet events (ctrl-c to stop)");
            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => break,
                    event = events.recv() => match event {
                        Ok(envelope) => println!("{} envelope", envelope.kind()),
                        Err(_) => continue,
                    },
                }
            }
            handle.shutdown();
            0
        }
        Commands::BulkUpdate { host, name, dry_run } => {
            let filter = BulkUpdateFilter {
                host_id: host,
                name,
            };
            match bulk_update(&api, &filter, dry_run).await {
                Ok(report) => {
                    println!(
                        "matched: {}  updated: {}  failed: {}",
                        report.matched, report.updated, report.failed
                    );
                    for item in &report.results {
                        match &item.error {
                            None => println!("  ok    {} ({})", item.container_name, item.host_id),
                            Some(err) => {
                                println!(
                                    "  fail  {} ({}): {err}",
                                    item.container_name, item.host_id
                                )
                            }
                        }
                    }
                    i32::from(report.failed > 0)
                }
                Err(e) => {
                    eprintln!("Error: {e}");
                    1
                }
            }
        }
    };

    std::process::exit(exit_code);
}
