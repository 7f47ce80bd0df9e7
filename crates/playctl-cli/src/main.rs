use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use playctl_cli::{ConfigManager, PlayctlConfig};
use playctl_client::{
    resolve_machine, ClientConfig, ControlPlane, ForwardOrchestrator, ForwardingSpec,
    HttpControlPlane, PlayConn, PlayOutcome, TunnelAuthenticator,
};
use playctl_ssh::{SshBridge, SshIdentity, Terminal};
use playctl_transport::Forwarder;
use playctl_transport_websocket::{WebSocketConfig, WebSocketForwarder};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Playground connectivity client
#[derive(Parser, Debug)]
#[command(name = "playctl")]
#[command(about = "Reach services and shells inside playground machines", long_about = None)]
#[command(version = env!("GIT_TAG"))]
#[command(long_version = concat!(env!("GIT_TAG"), "\nCommit: ", env!("GIT_HASH"), "\nBuilt: ", env!("BUILD_TIME")))]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    /// Control-plane base URL
    #[arg(long, env = "PLAYCTL_BASE_URL", global = true)]
    base_url: Option<String>,

    /// Access token (overrides the stored one)
    #[arg(long, env = "PLAYCTL_TOKEN", global = true, hide_env_values = true)]
    token: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Forward local ports to a playground machine
    PortForward {
        /// Play ID
        play: String,

        /// Target machine (defaults to the play's first machine)
        #[arg(short, long)]
        machine: Option<String>,

        /// Forwarding spec: [[LOCAL_HOST:]LOCAL_PORT:][REMOTE_HOST:]REMOTE_PORT
        #[arg(short = 'L', long = "local", value_name = "SPEC", required_unless_present = "restore")]
        local: Vec<String>,

        /// Restore the forwards saved for this play
        #[arg(long, conflicts_with_all = ["local", "machine"])]
        restore: bool,
    },

    /// Open a shell, or run a command, on a playground machine
    Ssh {
        /// Play ID
        play: String,

        /// Target machine (defaults to the play's first machine)
        #[arg(short, long)]
        machine: Option<String>,

        /// Login user (defaults to the machine's default user)
        #[arg(short, long)]
        user: Option<String>,

        /// Command to run instead of an interactive shell
        #[arg(last = true)]
        command: Vec<String>,
    },

    /// Wait for a play's init tasks, or for all of its tasks
    Wait {
        /// Play ID
        play: String,

        /// Give up after this many seconds
        #[arg(long, default_value = "300")]
        timeout: u64,

        /// Wait until every task is done or one has failed
        #[arg(long)]
        done: bool,
    },

    /// Manage the stored configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigCommands {
    /// Print the stored configuration
    Show,
    /// Store the default access token
    SetToken {
        /// Access token
        token: String,
    },
    /// Store the control-plane base URL
    SetBaseUrl {
        /// Base URL, e.g. https://api.playctl.dev
        url: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = init_logging(&cli.log_level) {
        eprintln!("Error: {:#}", e);
        return ExitCode::FAILURE;
    }

    if rustls::crypto::CryptoProvider::install_default(rustls::crypto::ring::default_provider())
        .is_err()
    {
        debug!("rustls crypto provider already installed");
    }

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let config = ConfigManager::load()?;

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Received Ctrl+C, shutting down...");
                cancel.cancel();
            }
        }
    });

    let client_config = config.client_config(cli.base_url.as_deref(), cli.token.as_deref());

    match cli.command {
        Commands::PortForward {
            play,
            machine,
            local,
            restore,
        } => {
            if restore {
                handle_restore(&cancel, client_config, &play).await?;
            } else {
                handle_port_forward(&cancel, client_config, &play, machine.as_deref(), &local)
                    .await?;
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Ssh {
            play,
            machine,
            user,
            command,
        } => {
            let status = handle_ssh(
                &cancel,
                &config,
                client_config,
                &play,
                machine.as_deref(),
                user.as_deref(),
                &command,
            )
            .await?;
            Ok(ExitCode::from(u8::try_from(status).unwrap_or(u8::MAX)))
        }
        Commands::Wait {
            play,
            timeout,
            done,
        } => handle_wait(&cancel, client_config, &play, Duration::from_secs(timeout), done).await,
        Commands::Config { command } => {
            handle_config(command)?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn authenticator(client_config: ClientConfig) -> Result<Arc<TunnelAuthenticator>> {
    let api = HttpControlPlane::new(client_config).context("Failed to create API client")?;
    let forwarder: Arc<dyn Forwarder> =
        Arc::new(WebSocketForwarder::new(WebSocketConfig::client_default()));
    Ok(Arc::new(TunnelAuthenticator::new(Arc::new(api), forwarder)))
}

async fn handle_port_forward(
    cancel: &CancellationToken,
    client_config: ClientConfig,
    play_id: &str,
    machine: Option<&str>,
    locals: &[String],
) -> Result<()> {
    let specs = locals
        .iter()
        .map(|s| ForwardingSpec::parse(s))
        .collect::<Result<Vec<_>, _>>()?;

    let authenticator = authenticator(client_config)?;
    let play = authenticator
        .api()
        .get_play(play_id)
        .await
        .context("Failed to fetch play")?;
    let machine = resolve_machine(&play, machine)?.name.clone();

    for spec in &specs {
        println!("Forwarding {}", spec);
    }

    ForwardOrchestrator::new(authenticator)
        .forward(cancel, play_id, &machine, specs)
        .await
        .context("Port forwarding failed")
}

async fn handle_restore(
    cancel: &CancellationToken,
    client_config: ClientConfig,
    play_id: &str,
) -> Result<()> {
    let orchestrator = ForwardOrchestrator::new(authenticator(client_config)?);
    let result = orchestrator
        .restore_play(cancel, play_id)
        .await
        .context("Failed to restore port forwards")?;

    println!("Restoring saved port forwards for {}", play_id);
    match result.await {
        Ok(result) => result.context("Port forwarding failed"),
        Err(_) => bail!("Restore task ended without a result"),
    }
}

async fn handle_ssh(
    cancel: &CancellationToken,
    config: &PlayctlConfig,
    client_config: ClientConfig,
    play_id: &str,
    machine: Option<&str>,
    user: Option<&str>,
    command: &[String],
) -> Result<u32> {
    let ssh_dir = config.ssh_dir()?;
    let identity = SshIdentity::load_or_generate(&ssh_dir)?;

    let authenticator = authenticator(client_config)?;
    let play = authenticator
        .api()
        .get_play(play_id)
        .await
        .context("Failed to fetch play")?;

    let bridge = SshBridge::new(authenticator, identity);
    let session = bridge.connect(cancel, &play, machine, user).await?;

    let command = (!command.is_empty()).then(|| command.join(" "));
    let terminal = if command.is_some() {
        Terminal::non_interactive()
    } else {
        Terminal::detect()
    };

    let result = session.run(cancel, &terminal, command.as_deref()).await;
    session.close().await;
    Ok(result?)
}

async fn handle_wait(
    cancel: &CancellationToken,
    client_config: ClientConfig,
    play_id: &str,
    timeout: Duration,
    done: bool,
) -> Result<ExitCode> {
    let origin = client_config.base_url.clone();
    let api = HttpControlPlane::new(client_config).context("Failed to create API client")?;
    let play = api.get_play(play_id).await.context("Failed to fetch play")?;

    let mut conn = PlayConn::new(Arc::new(RwLock::new(play)));
    conn.start(cancel, &api, &origin)
        .await
        .context("Failed to open the play's event stream")?;

    let result = if done {
        match tokio::time::timeout(timeout, conn.wait_done()).await {
            Ok(Ok(PlayOutcome::Completed)) => {
                println!("All tasks completed");
                Ok(ExitCode::SUCCESS)
            }
            Ok(Ok(PlayOutcome::Failed)) => {
                println!("A task failed");
                Ok(ExitCode::FAILURE)
            }
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(anyhow::anyhow!("Timed out after {:?}", timeout)),
        }
    } else {
        conn.wait_play_ready_with_progress(timeout, |progress| {
            info!(play_id, progress = %progress, "Waiting for init tasks");
        })
        .await
        .map(|()| {
            println!("Play {} is ready", play_id);
            ExitCode::SUCCESS
        })
        .map_err(Into::into)
    };

    conn.close().await;
    result
}

fn handle_config(command: ConfigCommands) -> Result<()> {
    match command {
        ConfigCommands::Show => {
            let config = ConfigManager::load()?;
            let mut shown = config.clone();
            if shown.access_token.is_some() {
                shown.access_token = Some("********".to_string());
            }
            println!("{}", serde_json::to_string_pretty(&shown)?);
            println!("SSH directory: {}", config.ssh_dir()?.display());
        }
        ConfigCommands::SetToken { token } => {
            ConfigManager::set_token(token)?;
            println!("Access token saved to {}", ConfigManager::config_path()?.display());
        }
        ConfigCommands::SetBaseUrl { url } => {
            ConfigManager::set_base_url(url)?;
            println!("Base URL saved to {}", ConfigManager::config_path()?.display());
        }
    }
    Ok(())
}

fn init_logging(log_level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(log_level))
        .context("Failed to initialize logging filter")?;

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_port_forward_args() {
        let cli = Cli::try_parse_from([
            "playctl", "port-forward", "p1", "-m", "dev", "-L", "8080", "-L", "9000:80",
        ])
        .unwrap();
        match cli.command {
            Commands::PortForward {
                play,
                machine,
                local,
                restore,
            } => {
                assert_eq!(play, "p1");
                assert_eq!(machine.as_deref(), Some("dev"));
                assert_eq!(local, vec!["8080", "9000:80"]);
                assert!(!restore);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_port_forward_requires_spec_or_restore() {
        assert!(Cli::try_parse_from(["playctl", "port-forward", "p1"]).is_err());
        assert!(Cli::try_parse_from(["playctl", "port-forward", "p1", "--restore"]).is_ok());
        assert!(
            Cli::try_parse_from(["playctl", "port-forward", "p1", "--restore", "-L", "80"])
                .is_err()
        );
    }

    #[test]
    fn test_ssh_trailing_command() {
        let cli = Cli::try_parse_from([
            "playctl", "ssh", "p1", "-u", "laborant", "--", "ls", "-la", "/tmp",
        ])
        .unwrap();
        match cli.command {
            Commands::Ssh {
                play,
                machine,
                user,
                command,
            } => {
                assert_eq!(play, "p1");
                assert!(machine.is_none());
                assert_eq!(user.as_deref(), Some("laborant"));
                assert_eq!(command, vec!["ls", "-la", "/tmp"]);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_global_flags() {
        let cli = Cli::try_parse_from([
            "playctl",
            "wait",
            "p1",
            "--done",
            "--base-url",
            "https://play.example",
            "--log-level",
            "debug",
        ])
        .unwrap();
        assert_eq!(cli.base_url.as_deref(), Some("https://play.example"));
        assert_eq!(cli.log_level, "debug");
        assert!(matches!(
            cli.command,
            Commands::Wait {
                timeout: 300,
                done: true,
                ..
            }
        ));
    }
}
