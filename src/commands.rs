use anyhow::{Context, Result};
use colored::*;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::analysis::display_report;
use crate::audit::{utc_timestamp, write_audit_log, AuditEntry};
use crate::config::{store_api_key_keyring, Config, API_KEY_ENV, KEYRING_SENTINEL, OLLAMA_NO_KEY};
use crate::engine::{Analyzer, ScriptDocument};
use crate::fetch::{FetchOutcome, FetchedScript, Fetcher};
use crate::helpers::{new_spinner, prompt, read_script_source};
use crate::narrator::StaticNarrator;
use crate::network::{NetworkConfig, NetworkOptions};
use crate::provider::{AiNarrator, Provider};
use crate::registry::{normalize_digest, KnownScript, KnownScriptRegistry};
use crate::static_analysis::{display_static_report, static_analyze};
use crate::trust::classify;
use crate::validate::ValidatedReference;

// ============================================================================
// Commands
// ============================================================================

/// Where the root script comes from.
#[derive(Debug, Clone)]
pub(crate) enum ScriptInput {
    Url(String),
    /// A local path; `-` reads stdin.
    File(PathBuf),
}

/// Settings for one `analyze` run, assembled from flags.
#[derive(Debug, Clone, Default)]
pub(crate) struct AnalyzeOptions {
    pub(crate) offline: bool,
    pub(crate) json: bool,
    pub(crate) max_depth: Option<usize>,
    pub(crate) max_fetches: Option<usize>,
    pub(crate) registry: Option<PathBuf>,
    pub(crate) provider: Option<String>,
    pub(crate) api_key: Option<String>,
    pub(crate) network: NetworkOptions,
}

pub(crate) async fn analyze_command(input: ScriptInput, opts: &AnalyzeOptions) -> Result<()> {
    if !opts.json {
        println!(
            "\n{} {}\n",
            "🔒 vetscript".bright_cyan().bold(),
            "- Remote Script Trust Review".bright_white()
        );
    }

    let config = Config::load()?;
    let net = NetworkConfig::new(&opts.network)?;
    if opts.network.insecure {
        eprintln!(
            "{}",
            "⚠️  SSL verification disabled for script downloads!".bright_yellow()
        );
    }

    let max_depth = opts.max_depth.unwrap_or(config.max_depth);
    let max_fetches = opts.max_fetches.unwrap_or(config.max_concurrent_fetches);
    let fetcher = Fetcher::new(&net, max_fetches);

    let root = load_root(&input, &fetcher, opts.json).await?;
    let source = root.url.clone();
    let fetched = match &root.result {
        Ok(fetched) => fetched.clone(),
        Err(e) => anyhow::bail!("Failed to download {}: {}", source, e),
    };

    let registry_path = resolve_registry_path(opts.registry.as_deref(), &config)?;
    let registry = KnownScriptRegistry::load(&registry_path)?;
    let root_record = classify(&root, &registry);
    let static_report = static_analyze(&fetched.content);

    let document = ScriptDocument::root(source.clone(), fetched.content.clone());
    let registry = Arc::new(registry);

    // Narrator credentials are checked before the spinner starts
    let narrator = if opts.offline {
        None
    } else {
        Some(build_ai_narrator(&config, opts, net.clone())?)
    };

    let spinner = new_spinner("Analyzing script and remote references...", opts.json);
    let result = match narrator {
        None => {
            Analyzer::new(fetcher, registry, StaticNarrator, max_depth)
                .analyze(document)
                .await
        }
        Some(narrator) => {
            tracing::debug!(provider = narrator.provider().name(), "using AI narrator");
            Analyzer::new(fetcher, registry, narrator, max_depth)
                .analyze(document)
                .await
        }
    };
    spinner.finish_and_clear();
    let report = result?;

    if opts.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        display_static_report(&static_report);
        if static_report.has_critical() {
            eprintln!(
                "{} Critical patterns found in the root script itself.",
                "⚠".yellow()
            );
        }
        display_report(&source, &fetched.digest, root_record.status.as_str(), &report);
    }

    write_audit_log(&AuditEntry {
        timestamp: utc_timestamp(),
        source: &source,
        sha256: &fetched.digest,
        size_bytes: fetched.size,
        root_status: root_record.status.as_str(),
        risk_score: report.risk_score.value(),
        static_findings: static_report.findings.len(),
        offline: opts.offline,
        bill_of_materials: &report.bill_of_materials,
    });

    Ok(())
}

/// Read or download the root script. The outcome carries the label used as
/// the document source.
async fn load_root(input: &ScriptInput, fetcher: &Fetcher, quiet: bool) -> Result<FetchOutcome> {
    match input {
        ScriptInput::Url(url) => {
            let reference = ValidatedReference::from_user(url)?;
            let spinner = new_spinner("Downloading script...", quiet);
            let outcome = fetcher.fetch_one(&reference).await;
            spinner.finish_and_clear();
            Ok(outcome)
        }
        ScriptInput::File(path) => {
            let content = read_script_source(path)?;
            let label = if path == Path::new("-") {
                "stdin".to_string()
            } else {
                path.display().to_string()
            };
            Ok(FetchOutcome {
                url: label,
                result: Ok(FetchedScript::from_bytes(content.as_bytes())),
            })
        }
    }
}

fn build_ai_narrator(config: &Config, opts: &AnalyzeOptions, net: NetworkConfig) -> Result<AiNarrator> {
    let provider_name = opts
        .provider
        .clone()
        .or_else(|| config.provider.clone())
        .with_context(|| {
            format!(
                "No AI provider configured. Run {} or pass --offline.",
                "vetscript login".green().bold()
            )
        })?;
    let provider: Provider = provider_name.parse()?;

    let api_key = match &opts.api_key {
        Some(key) => key.clone(),
        None if provider == Provider::Ollama && config.api_key.is_none() => OLLAMA_NO_KEY.to_string(),
        None => config.resolve_api_key(&provider_name)?,
    };

    // A configured model belongs to the configured provider
    let model = if opts.provider.is_some() {
        None
    } else {
        config.model.clone()
    };

    AiNarrator::new(provider, api_key, model, config, net)
}

fn resolve_registry_path(flag: Option<&Path>, config: &Config) -> Result<PathBuf> {
    match flag {
        Some(path) => Ok(path.to_path_buf()),
        None => config.registry_path(),
    }
}

pub(crate) async fn login_command(net_opts: &NetworkOptions) -> Result<()> {
    println!(
        "\n{} {}\n",
        "🔒 vetscript".bright_cyan().bold(),
        "- Initial Setup".bright_white()
    );

    println!("Welcome to vetscript! Let's configure your AI provider.\n");

    println!("{}", "Available providers:".bold());
    println!("  1. {} (Claude Haiku 4.5, Sonnet, Opus)", "Anthropic".cyan());
    println!("  2. {} (Grok 4)", "xAI".cyan());
    println!("  3. {} (GPT-5)", "OpenAI".cyan());
    println!("  4. {} (GPT-5)", "Azure OpenAI".cyan());
    println!("  5. {} (Gemini 2.5)", "Google Gemini".cyan());
    println!("  6. {} (Local models via Ollama)", "Ollama".cyan());

    let choice = prompt("\nSelect provider [1-6]: ")?;

    let provider_name = match choice.as_str() {
        "1" => "anthropic",
        "2" => "xai",
        "3" => "openai",
        "4" => "azure-openai",
        "5" => "gemini",
        "6" => "ollama",
        _ => anyhow::bail!("Invalid choice. Please run 'vetscript login' again."),
    };
    let provider: Provider = provider_name.parse()?;

    println!(
        "\n{} {}",
        "Selected:".green(),
        provider.name().bright_white().bold()
    );

    let (api_key, azure_endpoint, azure_deployment) = match provider {
        Provider::Ollama => {
            println!("\n{}", "Ollama Setup:".bold());
            println!("  → Install Ollama from https://ollama.ai");
            println!("  → Run: ollama pull llama3.2 (or your preferred model)");
            println!("  → Ensure Ollama is running: ollama serve");

            let input = prompt("\nEnter API key (press Enter to skip for Ollama): ")?;
            let key = if input.is_empty() {
                OLLAMA_NO_KEY.to_string()
            } else {
                input
            };
            (key, None, None)
        }
        Provider::AzureOpenAI => {
            println!("\n{}", "Azure OpenAI Setup:".bold());
            println!("  → Get your endpoint (e.g., https://your-resource.openai.azure.com)");
            println!("  → Get your API key from Keys and Endpoint");
            println!("  → Note your deployment name");

            let endpoint = required(prompt("\nEnter your Azure endpoint URL: ")?, "Azure endpoint")?;
            let key = required(prompt("\nEnter your API key: ")?, "API key")?;
            let deployment = required(prompt("\nEnter your deployment name: ")?, "Deployment name")?;
            (key, Some(endpoint), Some(deployment))
        }
        _ => {
            println!("\n{}", "Get your API key:".bold());
            let console = match provider {
                Provider::Anthropic => "https://console.anthropic.com",
                Provider::XAI => "https://console.x.ai",
                Provider::OpenAI => "https://platform.openai.com/api-keys",
                _ => "https://aistudio.google.com/app/apikey",
            };
            println!("  → {}", console);
            let key = required(prompt("\nEnter your API key: ")?, "API key")?;
            (key, None, None)
        }
    };

    println!(
        "\n{} {}",
        "Default model:".bright_black(),
        provider.default_model().bright_black()
    );
    let custom_model = prompt("Custom model (press Enter to use default): ")?;
    let model = if custom_model.is_empty() {
        None
    } else {
        Some(custom_model)
    };

    let existing = Config::load().unwrap_or_default();
    let mut config = Config {
        provider: Some(provider_name.to_string()),
        api_key: None,
        model: model.clone(),
        azure_endpoint,
        azure_deployment,
        ..existing
    };

    let spinner = new_spinner("Testing API connection...", false);
    let net = NetworkConfig::new(net_opts)?;
    let narrator = AiNarrator::new(provider, api_key.clone(), model, &config, net)?;
    match narrator.send_prompt("Reply with the single word OK.").await {
        Ok(_) => {
            spinner.finish_with_message(format!("{} API connection successful!", "✓".green().bold()));
        }
        Err(e) => {
            spinner.finish_with_message(format!("{} API connection failed!", "✗".red().bold()));
            anyhow::bail!("Error: {}", e);
        }
    }

    let key_storage_msg = match store_api_key_keyring(provider_name, &api_key) {
        Ok(()) => {
            config.api_key = Some(KEYRING_SENTINEL.to_string());
            "API key stored securely in OS keyring.".to_string()
        }
        Err(e) => {
            eprintln!(
                "\n{} Could not store API key in OS keyring: {}. Falling back to config file.",
                "⚠".yellow(),
                e
            );
            config.api_key = Some(api_key);
            format!(
                "API key stored in plaintext config file. For maximum security, use {} env var instead.",
                API_KEY_ENV
            )
        }
    };

    config.save()?;

    println!(
        "\n{} Configuration saved to {}",
        "✓".green().bold(),
        Config::config_path()?.display().to_string().bright_black()
    );
    println!("\n{} {}", "ℹ".blue(), key_storage_msg);
    println!("\n{}", "You're all set! Try:".green().bold());
    println!("  {}", "vetscript https://example.com/install.sh".cyan());

    Ok(())
}

fn required(value: String, what: &str) -> Result<String> {
    if value.is_empty() {
        anyhow::bail!("{} cannot be empty", what);
    }
    Ok(value)
}

fn mask_key(key: &str) -> String {
    if key == KEYRING_SENTINEL {
        return "(stored in OS keyring)".to_string();
    }
    let chars: Vec<char> = key.chars().collect();
    if chars.len() > 10 {
        let prefix: String = chars[..6].iter().collect();
        let suffix: String = chars[chars.len() - 4..].iter().collect();
        format!("{}...{}", prefix, suffix)
    } else {
        "***".to_string()
    }
}

pub(crate) fn config_command() -> Result<()> {
    let config = Config::load()?;

    println!("\n{}", "Current Configuration".bold());
    println!("{}", "═".repeat(50).bright_black());

    match config.provider.as_deref() {
        Some(name) => {
            let provider: Provider = name.parse()?;
            println!("{:15} {}", "Provider:".bright_white(), provider.name());
            match &config.model {
                Some(model) => println!("{:15} {}", "Model:".bright_white(), model),
                None => println!(
                    "{:15} {} (default)",
                    "Model:".bright_white(),
                    provider.default_model().bright_black()
                ),
            }
        }
        None => println!(
            "{:15} {}",
            "Provider:".bright_white(),
            "not configured (offline only)".bright_black()
        ),
    }

    let key_display = config
        .api_key
        .as_deref()
        .map(mask_key)
        .unwrap_or_else(|| "not set".to_string());
    println!("{:15} {}", "API Key:".bright_white(), key_display);
    if std::env::var(API_KEY_ENV).is_ok() {
        println!("{:15} {} overrides the stored key", "".bright_white(), API_KEY_ENV.cyan());
    }

    println!("{:15} {}", "Max depth:".bright_white(), config.max_depth);
    println!("{:15} {}", "Max fetches:".bright_white(), config.max_concurrent_fetches);
    println!(
        "{:15} {}",
        "Registry:".bright_white(),
        config.registry_path()?.display().to_string().bright_black()
    );
    println!(
        "{:15} {}",
        "Log level:".bright_white(),
        config.log_level.as_deref().unwrap_or("warn")
    );
    println!(
        "{:15} {}",
        "Config File:".bright_white(),
        Config::config_path()?.display().to_string().bright_black()
    );

    println!("{}", "═".repeat(50).bright_black());
    println!("\nTo reconfigure, run: {}", "vetscript login".green().bold());

    Ok(())
}

// ============================================================================
// Registry Commands
// ============================================================================

fn registry_file(flag: Option<&Path>) -> Result<PathBuf> {
    resolve_registry_path(flag, &Config::load()?)
}

pub(crate) fn registry_list(flag: Option<&Path>, json: bool) -> Result<()> {
    let path = registry_file(flag)?;
    let registry = KnownScriptRegistry::load(&path)?;

    if json {
        println!("{}", serde_json::to_string_pretty(registry.entries())?);
        return Ok(());
    }

    if registry.is_empty() {
        println!("No known scripts in {}", path.display().to_string().bright_black());
        return Ok(());
    }

    println!(
        "\n{} ({} entries, {})",
        "Known scripts".bold(),
        registry.len(),
        path.display().to_string().bright_black()
    );
    for entry in registry.entries() {
        println!("  {}  {}", entry.hash.bright_black(), entry.url);
    }
    Ok(())
}

/// Pin a URL. Without `hash`, the URL is downloaded and its current digest
/// recorded.
pub(crate) async fn registry_add(
    flag: Option<&Path>,
    url: &str,
    hash: Option<&str>,
    net_opts: &NetworkOptions,
) -> Result<()> {
    let path = registry_file(flag)?;
    let reference = ValidatedReference::from_user(url)?;

    let digest = match hash {
        Some(hash) => normalize_digest(hash)
            .with_context(|| format!("Invalid SHA-256 digest: {}", hash))?,
        None => {
            let net = NetworkConfig::new(net_opts)?;
            let fetcher = Fetcher::new(&net, 1);
            let spinner = new_spinner("Downloading script to pin its digest...", false);
            let outcome = fetcher.fetch_one(&reference).await;
            spinner.finish_and_clear();
            match outcome.result {
                Ok(fetched) => fetched.digest,
                Err(e) => anyhow::bail!("Failed to download {}: {}", reference, e),
            }
        }
    };

    let mut registry = KnownScriptRegistry::load(&path)?;
    registry.insert(KnownScript {
        url: reference.to_string(),
        hash: digest.clone(),
    })?;
    registry.save(&path)?;

    println!(
        "{} Pinned {} at {}",
        "✓".green().bold(),
        reference.to_string().cyan(),
        digest.bright_black()
    );
    Ok(())
}

pub(crate) fn registry_remove(flag: Option<&Path>, url: &str) -> Result<()> {
    let path = registry_file(flag)?;
    let mut registry = KnownScriptRegistry::load(&path)?;
    if !registry.remove(url) {
        anyhow::bail!("{} is not in the registry", url);
    }
    registry.save(&path)?;
    println!("{} Removed {}", "✓".green().bold(), url.cyan());
    Ok(())
}
