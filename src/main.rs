mod analysis;
mod audit;
mod bom;
mod commands;
mod config;
mod engine;
mod extract;
mod fetch;
mod helpers;
mod narrator;
mod network;
mod provider;
mod registry;
mod static_analysis;
mod trust;
mod validate;

use anyhow::Result;
use clap::{Parser, Subcommand};
use colored::*;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use crate::commands::{AnalyzeOptions, ScriptInput};
use crate::config::Config;
use crate::network::NetworkOptions;

// ============================================================================
// CLI
// ============================================================================

#[derive(Parser, Debug)]
#[command(name = "vetscript", version)]
#[command(
    about = "Vet shell install scripts and every remote script they pull in",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// URL of the install script (shorthand for 'vetscript analyze <URL>')
    #[arg(value_name = "URL")]
    url: Option<String>,

    /// Score with the built-in rule set instead of an AI provider
    #[arg(long, global = true)]
    offline: bool,

    /// Print the report as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Maximum recursion depth for nested remote scripts
    #[arg(long, global = true)]
    max_depth: Option<usize>,

    /// Maximum concurrent script downloads
    #[arg(long = "max-fetches", global = true)]
    max_fetches: Option<usize>,

    /// Known-script registry file (overrides config)
    #[arg(long, global = true, value_name = "PATH")]
    registry: Option<PathBuf>,

    /// Show engine diagnostics on stderr
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Override API key from config
    #[arg(long, global = true)]
    api_key: Option<String>,

    /// Override provider from config
    #[arg(short = 'p', long, global = true)]
    provider: Option<String>,

    // Network & Proxy Options
    /// HTTP/HTTPS proxy URL (e.g., http://proxy.example.com:8080)
    #[arg(short = 'x', long, global = true, env = "HTTPS_PROXY")]
    proxy: Option<String>,

    /// Timeout in seconds for network requests
    #[arg(short = 't', long, default_value = "30", global = true)]
    timeout: u64,

    /// Maximum number of redirects to follow
    #[arg(long, default_value = "10", global = true)]
    max_redirects: usize,

    /// Disable SSL certificate verification for script downloads (insecure!)
    #[arg(short = 'k', long = "insecure", global = true)]
    insecure: bool,

    /// Custom User-Agent header
    #[arg(short = 'A', long, global = true)]
    user_agent: Option<String>,

    /// Additional headers (format: 'Key: Value')
    #[arg(short = 'H', long = "header", global = true)]
    headers: Vec<String>,

    /// Number of retries on network failure
    #[arg(long, default_value = "3", global = true)]
    retries: usize,

    /// Use system proxy settings
    #[arg(long, global = true)]
    system_proxy: bool,

    /// Disable proxy even if environment variables are set
    #[arg(long, global = true)]
    no_proxy: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Configure vetscript with your AI provider credentials
    Login,
    /// Analyze a script and its remote references (default command)
    Analyze {
        /// URL of the install script to download and review
        url: Option<String>,

        /// Read the script from a local file ('-' for stdin)
        #[arg(short, long, value_name = "PATH", conflicts_with = "url")]
        file: Option<PathBuf>,
    },
    /// Show current configuration
    Config,
    /// Manage the known-script registry
    Registry {
        #[command(subcommand)]
        action: RegistryAction,
    },
}

#[derive(Subcommand, Debug)]
enum RegistryAction {
    /// List pinned scripts
    List,
    /// Pin a script URL to its SHA-256 digest
    Add {
        url: String,

        /// Expected digest; fetched from the URL when omitted
        #[arg(long)]
        hash: Option<String>,
    },
    /// Remove a pinned script
    Remove { url: String },
}

impl Cli {
    fn network_options(&self) -> NetworkOptions {
        NetworkOptions {
            timeout: self.timeout,
            max_redirects: self.max_redirects,
            insecure: self.insecure,
            no_proxy: self.no_proxy,
            proxy: self.proxy.clone(),
            system_proxy: self.system_proxy,
            user_agent: self.user_agent.clone(),
            headers: self.headers.clone(),
            retries: self.retries,
        }
    }

    fn analyze_options(&self) -> AnalyzeOptions {
        AnalyzeOptions {
            offline: self.offline,
            json: self.json,
            max_depth: self.max_depth,
            max_fetches: self.max_fetches,
            registry: self.registry.clone(),
            provider: self.provider.clone(),
            api_key: self.api_key.clone(),
            network: self.network_options(),
        }
    }
}

/// `RUST_LOG` wins, then `--verbose`, then the config file, then `warn`.
fn init_tracing(verbose: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = if verbose {
            "vetscript=debug".to_string()
        } else {
            Config::load()
                .ok()
                .and_then(|c| c.log_level)
                .unwrap_or_else(|| "warn".to_string())
        };
        EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("warn"))
    });

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

fn print_usage() {
    println!("{}", "vetscript - remote script trust review".bold());
    println!("\nUsage:");
    println!("  {}  Configure your AI provider", "vetscript login".green());
    println!("  {}     Analyze a script", "vetscript <URL>".green());
    println!("  {}  Analyze a local file", "vetscript analyze --file <PATH>".green());
    println!("  {}  Manage known scripts", "vetscript registry list|add|remove".green());
    println!("  {}      Show configuration", "vetscript config".green());
    println!("\nFor more help: {}", "vetscript --help".cyan());
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let registry_flag = cli.registry.as_deref();

    match &cli.command {
        Some(Commands::Login) => commands::login_command(&cli.network_options()).await,
        Some(Commands::Config) => commands::config_command(),
        Some(Commands::Analyze { url, file }) => {
            let input = match (url, file) {
                (_, Some(path)) => ScriptInput::File(path.clone()),
                (Some(url), None) => ScriptInput::Url(url.clone()),
                (None, None) => anyhow::bail!("Provide a URL or --file <PATH>"),
            };
            commands::analyze_command(input, &cli.analyze_options()).await
        }
        Some(Commands::Registry { action }) => match action {
            RegistryAction::List => commands::registry_list(registry_flag, cli.json),
            RegistryAction::Add { url, hash } => {
                commands::registry_add(registry_flag, url, hash.as_deref(), &cli.network_options())
                    .await
            }
            RegistryAction::Remove { url } => commands::registry_remove(registry_flag, url),
        },
        None => match &cli.url {
            Some(url) => {
                commands::analyze_command(ScriptInput::Url(url.clone()), &cli.analyze_options())
                    .await
            }
            None => {
                print_usage();
                Ok(())
            }
        },
    }
}
