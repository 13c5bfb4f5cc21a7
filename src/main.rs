//! ussync - cross-site session synchronization gateway.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use ussync::config::{Config, ConfigStore};
use ussync::sync::{codec, ClientIdentity};

/// ussync - mirror logins and logouts across trusted peer sites
#[derive(Parser, Debug)]
#[command(name = "ussync")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to config.toml (defaults to $USSYNC_CONFIG, then the user config dir)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the HTTP gateway
    Serve {
        /// Bind address (overrides [gateway] host)
        #[arg(long)]
        host: Option<String>,

        /// Port (overrides [gateway] port)
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Encrypt a value the way a peer would for the given browser identity
    Encrypt(TokenArgs),

    /// Decrypt a token minted for the given browser identity
    Decrypt(TokenArgs),

    /// Load and validate the configuration, then print a summary
    CheckConfig,
}

#[derive(Args, Debug)]
struct TokenArgs {
    /// Key set number
    #[arg(short, long, default_value_t = 1)]
    key: u32,

    /// Browser User-Agent the token is bound to
    #[arg(long, default_value = "")]
    user_agent: String,

    /// Client IP the token is bound to
    #[arg(long)]
    ip: String,

    /// Plaintext (encrypt) or token (decrypt)
    text: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Serve { host, port } => {
            let mut config = config;
            if let Some(host) = host {
                config.gateway.host = host;
            }
            if let Some(port) = port {
                config.gateway.port = port;
            }
            ussync::gateway::run_gateway(config).await
        }
        Commands::Encrypt(args) => {
            let (secret, identity) = token_context(&config, &args)?;
            println!("{}", codec::encrypt(&args.text, &secret, &identity)?);
            Ok(())
        }
        Commands::Decrypt(args) => {
            let (secret, identity) = token_context(&config, &args)?;
            let plain = codec::decrypt(&args.text, &secret, &identity)
                .context("Token does not decrypt for this key set and identity")?;
            println!("{plain}");
            Ok(())
        }
        Commands::CheckConfig => {
            let ring = config.key_ring();
            println!("✅ Config OK");
            println!("  Site:      {}", config.site_url);
            println!("  Database:  {}", config.database_file().display());
            println!("  Matching:  {:?}", ring.domain_match());
            for set in ring.iter() {
                println!(
                    "  Key set {}: {} peer(s), unknown users: {:?}",
                    set.num,
                    set.domains.len(),
                    set.unknown_user
                );
                for domain in &set.domains {
                    println!("    - {domain}");
                }
            }
            Ok(())
        }
    }
}

fn token_context(config: &Config, args: &TokenArgs) -> Result<(String, ClientIdentity)> {
    let ring = config.key_ring();
    let Some(secret) = ring.secret(args.key) else {
        bail!("Key set {} is not configured", args.key);
    };
    Ok((
        secret.to_string(),
        ClientIdentity::new(args.user_agent.clone(), args.ip.clone()),
    ))
}
