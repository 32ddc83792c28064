use crate::error::ProxyError;
use crate::validate::RemoteUrl;
use log::{debug, info};
use std::collections::HashMap;
use std::path::Path;

/// Static host -> forward-host table, loaded once before the server starts.
#[derive(Debug, Clone, Default)]
pub struct ForwardRules {
    rules: HashMap<String, String>,
}

impl ForwardRules {
    /// Parses rule-file text: one `<host> <forward-host>` pair per line.
    /// Lines with any other number of fields are skipped.
    pub fn parse(content: &str) -> Self {
        let mut rules = HashMap::new();

        for line in content.lines() {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if let [host, forward_host] = fields.as_slice() {
                rules.insert(host.to_string(), forward_host.to_string());
            } else if !fields.is_empty() {
                debug!("Skipping malformed forward rule: {:?}", line);
            }
        }

        Self { rules }
    }

    pub fn from_file(path: &Path) -> Result<Self, ProxyError> {
        if !path.exists() {
            return Err(ProxyError::Config(format!(
                "Forward config file does not exist: {}",
                path.display()
            )));
        }

        let content = std::fs::read_to_string(path)
            .map_err(|e| ProxyError::Config(format!("Failed to read forward config {}: {}", path.display(), e)))?;
        let rules = Self::parse(&content);
        info!("Loaded {} forward rule(s) from {}", rules.len(), path.display());
        Ok(rules)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn forward_host(&self, host: &str) -> Option<&str> {
        self.rules.get(host).map(String::as_str)
    }

    /// Where the bytes for `remote` are fetched from.
    ///
    /// With a rule for the URL's host this is `<forward-host>/<url>`,
    /// otherwise the URL itself. Never affects the cache key.
    pub fn resolve(&self, remote: &RemoteUrl) -> String {
        match remote.host().and_then(|host| self.forward_host(host)) {
            Some(forward_host) => {
                let target = format!("{}/{}", forward_host.trim_end_matches('/'), remote.as_str());
                debug!("Forwarding {} via {}", remote.raw, forward_host);
                target
            }
            None => remote.as_str().to_string(),
        }
    }
}

/// A forward host may be written without a scheme (`cache.internal`);
/// those targets are fetched over plain http.
pub fn with_default_scheme(target: &str) -> String {
    let has_scheme = target
        .split_once("://")
        .map(|(scheme, _)| !scheme.is_empty() && !scheme.contains('/'))
        .unwrap_or(false);

    if has_scheme {
        target.to_string()
    } else {
        format!("http://{}", target)
    }
}
