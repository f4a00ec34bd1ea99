use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{Level, error, info, warn};
use tracing_subscriber::filter::{EnvFilter, LevelFilter};
use tracing_subscriber::FmtSubscriber;
use vpn_sso::auth::{self, SsoLauncher};
use vpn_sso::cache::{self, CacheClient, CacheKey, CredentialCache, SystemClock};
use vpn_sso::config::{ConnectionConfig, Settings};
use vpn_sso::service::{Collaborators, ConnectionService, ConnectionState, ServiceEvent};
use vpn_sso::session::{SessionResolver, SystemSessionResolver};
use vpn_sso::tunnel::TunnelLauncher;
use vpn_sso::Protocol;

#[derive(Parser)]
#[command(name = "vpn-sso")]
#[command(about = "SSO-authenticated GlobalProtect and AnyConnect tunnels via OpenConnect")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Config file (defaults to ~/.config/vpn-sso/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

/// Overrides for the `[connection]` section
#[derive(Args)]
struct ConnectionArgs {
    /// VPN portal or server address
    #[arg(short, long)]
    gateway: Option<String>,

    /// gp/globalprotect or ac/anyconnect
    #[arg(short, long)]
    protocol: Option<Protocol>,

    /// Username for the gateway
    #[arg(short, long)]
    user: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect and stay up until Ctrl+C or the gateway disconnects
    Connect {
        #[command(flatten)]
        connection: ConnectionArgs,

        /// End the remote session and forget the cookie on exit
        #[arg(long)]
        logout_on_exit: bool,
    },
    /// Run the SSO login only and cache the cookie
    Login {
        #[command(flatten)]
        connection: ConnectionArgs,
    },
    /// Remove cached credentials
    ClearCache {
        #[arg(short, long, requires = "protocol", conflicts_with = "all")]
        gateway: Option<String>,

        #[arg(short, long, requires = "gateway")]
        protocol: Option<Protocol>,

        /// Remove every cached credential
        #[arg(long)]
        all: bool,
    },
    /// Show the resolved desktop session
    Session,
    /// Generate default config file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

fn load_settings(path: Option<&PathBuf>) -> Result<Settings, Box<dyn std::error::Error>> {
    if let Some(path) = path {
        return Ok(Settings::load(path)?);
    }
    match Settings::default_path() {
        Some(path) if path.exists() => Ok(Settings::load(&path)?),
        _ => Ok(Settings::default()),
    }
}

fn connection_config(settings: &Settings, args: ConnectionArgs) -> Result<ConnectionConfig, Box<dyn std::error::Error>> {
    let mut section = settings.connection.clone();
    if let Some(gateway) = args.gateway {
        section.gateway = gateway;
    }
    if let Some(protocol) = args.protocol {
        section.protocol = protocol.as_str().to_string();
    }
    if let Some(user) = args.user {
        section.username = Some(user);
    }
    Ok(section.to_config()?)
}

fn credential_cache(settings: &Settings) -> CredentialCache {
    CredentialCache::new(
        cache::open_store(settings.service.cache_backend),
        Arc::new(SystemClock),
        settings.service.default_cache_hours,
    )
}

async fn resolve_session(resolver: SystemSessionResolver) -> Result<vpn_sso::session::SessionEnv, tokio::task::JoinError> {
    tokio::task::spawn_blocking(move || resolver.resolve()).await
}

async fn run_connect(
    settings: Settings,
    config: ConnectionConfig,
    logout_on_exit: bool,
) -> Result<bool, Box<dyn std::error::Error>> {
    let service = &settings.service;
    let grace = Duration::from_secs(service.stop_grace_secs);
    let tasks = TaskTracker::new();
    let cache = CacheClient::spawn(Arc::new(credential_cache(&settings)));

    let (handle, mut events) = ConnectionService::spawn(Collaborators {
        sessions: Arc::new(SystemSessionResolver::new(service.uid_threshold)),
        authenticator: Arc::new(SsoLauncher::new(
            service.tool_dir.clone(),
            service.uid_threshold,
            grace,
            tasks.clone(),
        )),
        tunnels: Arc::new(TunnelLauncher::new(service, tasks.clone())),
        cache: cache.clone(),
    });
    handle.connect(config)?;

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut ok = true;
    let mut interrupted = false;

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(ServiceEvent::StateChanged(state)) => {
                    info!("State: {}", state);
                    if state == ConnectionState::Failed {
                        break;
                    }
                }
                Some(ServiceEvent::Ip4Config(ip4)) => {
                    println!("{}", serde_json::to_string_pretty(&ip4.to_map())?);
                }
                Some(ServiceEvent::Failure(reason)) => {
                    error!("Connection failed: {}", reason);
                    ok = false;
                }
                Some(ServiceEvent::Disconnected) => {
                    info!("Gateway closed the connection");
                    break;
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                interrupted = true;
                break;
            }
            _ = sigterm.recv() => {
                interrupted = true;
                break;
            }
        }
    }

    if interrupted {
        if logout_on_exit {
            info!("Logging out...");
            handle.logout()?;
        } else {
            info!("Disconnecting...");
            handle.disconnect()?;
        }
    }
    drop(handle);

    tasks.close();
    if tokio::time::timeout(grace + Duration::from_secs(1), tasks.wait())
        .await
        .is_err()
    {
        warn!("Child processes did not exit in time");
    }
    if cache.flush().await.is_err() {
        warn!("Credential cache worker stopped before finishing");
    }

    Ok(ok)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Logs go to stderr so the IPv4 JSON on stdout stays machine-readable
    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::from_level(level).into())
        .from_env_lossy();
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Connect {
            connection,
            logout_on_exit,
        } => {
            let settings = load_settings(cli.config.as_ref())?;
            let config = connection_config(&settings, connection)?;
            info!("Connecting to {} ({})...", config.gateway, config.protocol);
            if !run_connect(settings, config, logout_on_exit).await? {
                std::process::exit(1);
            }
        }
        Commands::Login { connection } => {
            let settings = load_settings(cli.config.as_ref())?;
            let config = connection_config(&settings, connection)?;
            let service = &settings.service;
            let session = resolve_session(SystemSessionResolver::new(service.uid_threshold)).await?;

            let launcher = SsoLauncher::new(
                service.tool_dir.clone(),
                service.uid_threshold,
                Duration::from_secs(service.stop_grace_secs),
                TaskTracker::new(),
            );
            let cancel = CancellationToken::new();
            let token = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    token.cancel();
                }
            });

            let bundle = auth::authenticate(&launcher, &config, &session, cancel).await?;
            let key = CacheKey::new(config.gateway.clone(), config.protocol);
            let cache = credential_cache(&settings);
            let hours = config.cache_hours;
            let stored_key = key.clone();
            let record =
                tokio::task::spawn_blocking(move || cache.store(&session, &stored_key, &bundle, hours)).await??;
            println!("Cached credential for {} (expires at {})", key, record.expires_at);
        }
        Commands::ClearCache {
            gateway,
            protocol,
            all,
        } => {
            let settings = load_settings(cli.config.as_ref())?;
            let session = resolve_session(SystemSessionResolver::new(settings.service.uid_threshold)).await?;
            if session.identity().is_none() {
                return Err(cache::CacheError::NoIdentity.into());
            }
            let cache = CacheClient::spawn(Arc::new(credential_cache(&settings)));

            let cleared = match (gateway, protocol) {
                _ if all => {
                    cache.clear_all(session);
                    "all cached credentials".to_string()
                }
                (Some(gateway), Some(protocol)) => {
                    let key = CacheKey::new(gateway, protocol);
                    let cleared = format!("cached credential for {}", key);
                    cache.clear(session, key);
                    cleared
                }
                _ => {
                    let config = settings.connection.to_config()?;
                    let key = CacheKey::new(config.gateway, config.protocol);
                    let cleared = format!("cached credential for {}", key);
                    cache.clear(session, key);
                    cleared
                }
            };
            cache.flush().await?;
            println!("Cleared {}", cleared);
        }
        Commands::Session => {
            let settings = load_settings(cli.config.as_ref())?;
            let session = resolve_session(SystemSessionResolver::new(settings.service.uid_threshold)).await?;
            println!("{}", serde_json::to_string_pretty(&session)?);
        }
        Commands::Init { force } => {
            info!("Generating default config...");
            let path = match cli.config.or_else(Settings::default_path) {
                Some(path) => path,
                None => return Err("Could not determine a config directory".into()),
            };
            if path.exists() && !force {
                return Err(format!("{} already exists (use --force to overwrite)", path.display()).into());
            }
            Settings::example().save(&path)?;
            println!("Created default config: {}", path.display());
        }
    }

    Ok(())
}
