use clap::{Parser, Subcommand};
use openvpn_mgmt::client::{Credentials, StaticCredentials};
use openvpn_mgmt::config::{CONFIG_FILE_NAME, ManagementConfig};
use openvpn_mgmt::{AuthMiddleware, Config, Connection, FilterMiddleware, Middleware};
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser)]
#[command(name = "openvpn-mgmt")]
#[command(about = "Management interface middlewares for OpenVPN")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Install a subnet filter for every connecting client (server mode)
    Server {
        /// Config file (defaults to ./openvpn-mgmt.toml or ~/.openvpn-mgmt/config.toml)
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Subnet clients may reach; repeat to allow several. Overrides the config.
        #[arg(long = "subnet")]
        subnets: Vec<String>,
    },
    /// Answer the daemon's username/password challenge (client mode)
    Client {
        /// Config file (defaults to ./openvpn-mgmt.toml or ~/.openvpn-mgmt/config.toml)
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Username for VPN authentication
        #[arg(short, long)]
        user: Option<String>,
    },
    /// Generate default config file
    Init {
        #[arg(default_value = CONFIG_FILE_NAME)]
        path: PathBuf,
    },
}

/// `RUST_LOG` wins when it parses; otherwise `--verbose` picks debug or info.
fn log_filter(verbose: bool, rust_log: Option<String>) -> EnvFilter {
    let default = if verbose { "debug" } else { "info" };
    rust_log
        .and_then(|directives| EnvFilter::try_new(directives).ok())
        .unwrap_or_else(|| EnvFilter::new(default))
}

fn load_config(path: Option<PathBuf>) -> Result<Config, Box<dyn std::error::Error>> {
    Ok(match path {
        Some(path) => Config::load(&path)?,
        None => Config::discover()?,
    })
}

async fn run(
    management: &ManagementConfig,
    middlewares: Vec<Box<dyn Middleware>>,
) -> Result<(), Box<dyn std::error::Error>> {
    let connection = Connection::connect(&management.address, management.options()).await?;

    let shutdown = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Interrupted, shutting down"),
            Err(e) => {
                warn!("Unable to listen for Ctrl-C: {}", e);
                std::future::pending::<()>().await
            }
        }
    };
    connection.run_until(middlewares, shutdown).await?;

    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(log_filter(cli.verbose, std::env::var("RUST_LOG").ok()))
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Server { config, subnets } => {
            let config = load_config(config)?;
            let subnets = if subnets.is_empty() {
                config.filter.subnets.clone()
            } else {
                subnets
            };
            info!("Allowing clients to reach {} subnets", subnets.len());

            let middlewares: Vec<Box<dyn Middleware>> = vec![Box::new(FilterMiddleware::new(subnets))];
            run(&config.management, middlewares).await?;
        }
        Commands::Client { config, user } => {
            let config = load_config(config)?;
            let username = user
                .or_else(|| config.auth.username.clone())
                .ok_or("No username given (use --user or [auth] username)")?;
            let password = match config.auth.password.clone() {
                Some(password) => password,
                None => rpassword::prompt_password(format!("Password for {}: ", username))?,
            };

            let provider = StaticCredentials::new(Credentials::new(username, password));
            let middlewares: Vec<Box<dyn Middleware>> = vec![Box::new(AuthMiddleware::new(provider))];
            run(&config.management, middlewares).await?;
        }
        Commands::Init { path } => {
            info!("Generating default config...");
            Config::default().save(&path)?;
            println!("Created default config: {}", path.display());
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_filter_defaults() {
        assert_eq!(log_filter(false, None).to_string(), "info");
        assert_eq!(log_filter(true, None).to_string(), "debug");
    }

    #[test]
    fn test_log_filter_rust_log_override() {
        let filter = log_filter(false, Some("openvpn_mgmt=trace".to_string()));
        assert_eq!(filter.to_string(), "openvpn_mgmt=trace");
    }
}
