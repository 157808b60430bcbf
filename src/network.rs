use anyhow::{Context, Result};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT};
use std::time::Duration;

// ============================================================================
// Network Configuration
// ============================================================================

/// Accept header sent with every script fetch.
pub(crate) const SCRIPT_ACCEPT: &str = "text/plain,*/*";

/// Connection options shared by the script fetcher and the AI provider client.
#[derive(Debug, Clone)]
pub(crate) struct NetworkOptions {
    pub(crate) timeout: u64,
    pub(crate) max_redirects: usize,
    pub(crate) insecure: bool,
    pub(crate) no_proxy: bool,
    pub(crate) proxy: Option<String>,
    pub(crate) system_proxy: bool,
    pub(crate) user_agent: Option<String>,
    pub(crate) headers: Vec<String>,
    pub(crate) retries: usize,
}

impl Default for NetworkOptions {
    fn default() -> Self {
        Self {
            timeout: 30,
            max_redirects: 10,
            insecure: false,
            no_proxy: false,
            proxy: None,
            system_proxy: false,
            user_agent: None,
            headers: Vec::new(),
            retries: 3,
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct NetworkConfig {
    pub(crate) timeout: Duration,
    pub(crate) retries: usize,
    pub(crate) script_client: reqwest::Client, // Respects --insecure for script downloads
    pub(crate) api_client: reqwest::Client,    // Always enforces TLS for API calls
}

impl NetworkConfig {
    pub(crate) fn new(opts: &NetworkOptions) -> Result<Self> {
        if opts.timeout == 0 {
            anyhow::bail!("Timeout must be at least 1 second");
        }
        let timeout = Duration::from_secs(opts.timeout);

        // Script client: extra headers, Accept, optional --insecure
        let mut default_headers = parse_headers(&opts.headers)?;
        default_headers.insert(ACCEPT, HeaderValue::from_static(SCRIPT_ACCEPT));

        let mut script_builder = Self::base_builder(timeout, opts.max_redirects)
            .default_headers(default_headers);
        if opts.insecure {
            script_builder = script_builder.danger_accept_invalid_certs(true);
        }
        script_builder =
            Self::apply_proxy(script_builder, opts.no_proxy, &opts.proxy, opts.system_proxy)?;
        script_builder = Self::apply_user_agent(script_builder, &opts.user_agent);
        let script_client = script_builder
            .build()
            .context("Failed to build script HTTP client")?;

        // API client: always verifies TLS
        let mut api_builder = Self::base_builder(timeout, opts.max_redirects);
        api_builder = Self::apply_proxy(api_builder, opts.no_proxy, &opts.proxy, opts.system_proxy)?;
        api_builder = Self::apply_user_agent(api_builder, &opts.user_agent);
        let api_client = api_builder
            .build()
            .context("Failed to build API HTTP client")?;

        Ok(Self {
            timeout,
            retries: opts.retries.max(1),
            script_client,
            api_client,
        })
    }

    fn base_builder(timeout: Duration, max_redirects: usize) -> reqwest::ClientBuilder {
        reqwest::Client::builder()
            .timeout(timeout)
            .redirect(if max_redirects > 0 {
                reqwest::redirect::Policy::limited(max_redirects)
            } else {
                reqwest::redirect::Policy::none()
            })
    }

    fn apply_proxy(
        mut builder: reqwest::ClientBuilder,
        no_proxy: bool,
        proxy: &Option<String>,
        system_proxy: bool,
    ) -> Result<reqwest::ClientBuilder> {
        if no_proxy {
            builder = builder.no_proxy();
        } else if let Some(ref proxy_url) = proxy {
            let parsed = reqwest::Url::parse(proxy_url).context("Invalid proxy URL")?;
            let scheme = parsed.scheme();
            if !matches!(scheme, "http" | "https" | "socks5" | "socks5h") {
                anyhow::bail!(
                    "Invalid proxy scheme: {}. Only http, https, socks5, and socks5h are supported.",
                    scheme
                );
            }
            let p = reqwest::Proxy::all(proxy_url).context("Invalid proxy URL")?;
            builder = builder.proxy(p);
        } else if system_proxy {
            // reqwest picks up the environment proxy by default
        }
        Ok(builder)
    }

    fn apply_user_agent(
        builder: reqwest::ClientBuilder,
        user_agent: &Option<String>,
    ) -> reqwest::ClientBuilder {
        match user_agent {
            Some(ua) => builder.user_agent(ua.clone()),
            None => builder.user_agent(default_user_agent()),
        }
    }
}

/// Identifying client label.
pub(crate) fn default_user_agent() -> String {
    format!("vetscript/{}", env!("CARGO_PKG_VERSION"))
}

/// Parse `Key: Value` header flags.
pub(crate) fn parse_headers(headers: &[String]) -> Result<HeaderMap> {
    let mut parsed = HeaderMap::new();
    for header in headers {
        let Some((key, value)) = header.split_once(':') else {
            anyhow::bail!("Invalid header format: '{}'. Use 'Key: Value'", header);
        };
        let name = HeaderName::from_bytes(key.trim().as_bytes())
            .with_context(|| format!("Invalid header name in '{}'", header))?;
        let value = HeaderValue::from_str(value.trim())
            .with_context(|| format!("Invalid header value in '{}'", header))?;
        parsed.append(name, value);
    }
    Ok(parsed)
}
