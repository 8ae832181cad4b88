/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub data_dir: String,
    /// Period of automatic saves (ms); 0 disables them
    pub save_interval_ms: u64,
    /// Categories created at startup when not restored from disk
    pub categories: Vec<(String, usize)>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            data_dir: "/tmp/mnemodb".to_string(),
            save_interval_ms: 5 * 60 * 1000,
            categories: vec![],
        }
    }
}

impl ServerConfig {
    /// Load from environment variables.
    pub fn from_env() -> Self {
        let mut config = ServerConfig::default();

        if let Ok(path) = std::env::var("MNEMODB_DATA_DIR") {
            config.data_dir = path;
        }
        if let Ok(interval) = std::env::var("MNEMODB_SAVE_INTERVAL_MS") {
            config.save_interval_ms = interval.parse().unwrap_or(5 * 60 * 1000);
        }
        if let Ok(raw) = std::env::var("MNEMODB_CATEGORIES") {
            config.categories = parse_categories(&raw);
        }

        config
    }
}

/// "episodic:384,semantic:768" -> [("episodic", 384), ("semantic", 768)].
/// Malformed entries are skipped with a warning.
pub fn parse_categories(raw: &str) -> Vec<(String, usize)> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .filter_map(|entry| {
            let parsed = entry
                .split_once(':')
                .and_then(|(name, dim)| Some((name.trim(), dim.trim().parse::<usize>().ok()?)))
                .filter(|(name, dim)| !name.is_empty() && *dim > 0);
            if parsed.is_none() {
                tracing::warn!(entry, "Ignoring malformed category entry");
            }
            parsed.map(|(name, dim)| (name.to_string(), dim))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_categories() {
        let parsed = parse_categories("episodic:384, semantic:768,,bad,zero:0,:3");
        assert_eq!(parsed, vec![("episodic".to_string(), 384), ("semantic".to_string(), 768)]);
    }
}
