use crate::error::PreviewError;
use regex::Regex;
use std::fmt;
use std::sync::LazyLock;

static PORT_LABEL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d+)-(.+)$").expect("static regex"));

/// Sandbox and port a preview host points at.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SandboxAddress {
    pub sandbox_id: String,
    pub port: u16,
}

impl SandboxAddress {
    /// Parse the leftmost label of `host`.
    ///
    /// `3000-abc123.example.com` encodes port 3000 of sandbox `abc123`; any
    /// other label is taken whole as the sandbox id on `default_port`. A host
    /// without a dot is rejected.
    pub fn parse(host: &str, default_port: u16) -> Result<Self, PreviewError> {
        let host = strip_port(host);
        let Some((label, _rest)) = host.split_once('.') else {
            return Err(PreviewError::InvalidHost(host.to_string()));
        };
        if label.is_empty() {
            return Err(PreviewError::InvalidHost(host.to_string()));
        }

        if let Some(captures) = PORT_LABEL.captures(label) {
            if let Ok(port) = captures[1].parse::<u16>() {
                return Ok(Self {
                    sandbox_id: captures[2].to_string(),
                    port,
                });
            }
        }

        Ok(Self {
            sandbox_id: label.to_string(),
            port: default_port,
        })
    }

    pub fn cache_key(&self) -> String {
        format!("{}:{}", self.sandbox_id, self.port)
    }
}

impl fmt::Display for SandboxAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.sandbox_id, self.port)
    }
}

/// Drop a trailing `:port` from a Host header value.
pub fn strip_port(host: &str) -> &str {
    match host.rsplit_once(':') {
        Some((name, port)) if !name.is_empty() && port.chars().all(|c| c.is_ascii_digit()) => name,
        _ => host,
    }
}

/// First DNS label of the host, lowercased by the caller if needed.
pub fn first_label(host: &str) -> &str {
    let host = strip_port(host);
    host.split('.').next().unwrap_or(host)
}

/// Whether the host addresses a sandbox preview rather than a published worker.
pub fn is_preview_host(host: &str) -> bool {
    let host = strip_port(host);
    if !host.contains('.') {
        return false;
    }
    let label = first_label(host);
    label.starts_with("preview-") || PORT_LABEL.is_match(label)
}
