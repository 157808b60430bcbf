use anyhow::{Context, Result};
use reqwest::Url;

// ============================================================================
// Reference Validation
// ============================================================================

/// Longest URL we are willing to fetch (8 KB).
const MAX_URL_LEN: usize = 8192;

/// Characters that mean the candidate still carries unexpanded shell syntax.
const SHELL_MARKERS: &[char] = &['$', '`', '{', '}', '\'', '"', '(', ')', '\\'];

/// A candidate reference that is safe to fetch: absolute http(s) URL with a
/// host and no shell-expansion residue.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct ValidatedReference(Url);

impl ValidatedReference {
    /// A URL typed by the user rather than extracted from a script.
    pub(crate) fn from_user(url: &str) -> Result<Self> {
        validate_url(url.trim()).map(ValidatedReference)
    }

    pub(crate) fn url(&self) -> &Url {
        &self.0
    }

    #[cfg(test)]
    pub(crate) fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl std::fmt::Display for ValidatedReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.0.as_str())
    }
}

/// Filter one extracted candidate. Ambiguity resolves to `None`.
pub(crate) fn validate_reference(raw: &str) -> Option<ValidatedReference> {
    let candidate = strip_enclosing_quotes(raw.trim());

    if candidate.is_empty() || candidate.contains(SHELL_MARKERS) {
        tracing::debug!(candidate = raw, "rejected: shell expansion syntax");
        return None;
    }

    match validate_url(candidate) {
        Ok(url) => Some(ValidatedReference(url)),
        Err(e) => {
            tracing::debug!(candidate = raw, error = %e, "rejected candidate");
            None
        }
    }
}

/// Strict URL check shared by candidate validation and the root URL given on
/// the command line.
pub(crate) fn validate_url(url: &str) -> Result<Url> {
    if url.len() > MAX_URL_LEN {
        anyhow::bail!("URL too long ({} bytes, max {})", url.len(), MAX_URL_LEN);
    }

    let parsed = Url::parse(url).context("Invalid URL format")?;

    let scheme = parsed.scheme();
    if !matches!(scheme, "http" | "https") {
        anyhow::bail!(
            "Invalid URL scheme: {}. Only http and https are supported.",
            scheme
        );
    }

    let host = parsed.host_str().context("URL has no host component")?;

    if !parsed.username().is_empty() || parsed.password().is_some() {
        anyhow::bail!("URLs with embedded credentials are not supported for security reasons");
    }

    if is_private_host(host) {
        tracing::warn!(host, "reference points at a private or local address");
    }

    Ok(parsed)
}

/// Normalised string form used as the registry and dedup key.
pub(crate) fn normalize_url(url: &str) -> Option<String> {
    Url::parse(url.trim()).ok().map(|u| u.to_string())
}

fn strip_enclosing_quotes(s: &str) -> &str {
    for quote in ['"', '\''] {
        if s.len() >= 2 && s.starts_with(quote) && s.ends_with(quote) {
            return &s[1..s.len() - 1];
        }
    }
    s
}

fn is_private_host(host: &str) -> bool {
    if matches!(host, "localhost" | "0.0.0.0" | "[::1]" | "::1") {
        return true;
    }
    if let Ok(ip) = host.trim_matches(['[', ']']).parse::<std::net::IpAddr>() {
        return match ip {
            std::net::IpAddr::V4(v4) => {
                v4.is_private() || v4.is_loopback() || v4.is_link_local() || v4.is_unspecified()
            }
            std::net::IpAddr::V6(v6) => {
                let first = v6.segments()[0];
                v6.is_loopback() || (first & 0xfe00) == 0xfc00 || (first & 0xffc0) == 0xfe80
            }
        };
    }
    false
}
