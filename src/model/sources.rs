/// Environment variable holding a comma-separated model source list.
pub const MODEL_URLS_ENV: &str = "MATTEBOX_MODEL_URLS";

/// Environment variable holding a single model source; shadowed by the list
/// variable when that one is non-empty.
pub const MODEL_URL_ENV: &str = "MATTEBOX_MODEL_URL";

/// Raw configuration inputs for model-source resolution, captured once at
/// startup. CLI overrides take precedence over the environment.
#[derive(Debug, Clone, Default)]
pub struct ModelSourceConfig {
    pub cli_single: Option<String>,
    pub cli_list: Option<String>,
    pub env_multi: Option<String>,
    pub env_single: Option<String>,
}

impl ModelSourceConfig {
    /// Capture CLI overrides plus the process environment.
    pub fn from_env(cli_single: Option<String>, cli_list: Option<String>) -> Self {
        Self {
            cli_single,
            cli_list,
            env_multi: std::env::var(MODEL_URLS_ENV).ok(),
            env_single: std::env::var(MODEL_URL_ENV).ok(),
        }
    }

    /// Resolve the ordered candidate list: CLI single value, CLI list, then
    /// whichever environment variable applies. Entries are trimmed, empties
    /// dropped, duplicates removed keeping first-seen order.
    pub fn resolve(&self) -> Vec<String> {
        let mut sources: Vec<String> = Vec::new();

        if let Some(single) = &self.cli_single {
            push_unique(&mut sources, single);
        }
        if let Some(list) = &self.cli_list {
            for candidate in list.split(',') {
                push_unique(&mut sources, candidate);
            }
        }

        // The multi variable wins unless it is entirely absent or empty
        let env_raw = self
            .env_multi
            .as_deref()
            .filter(|raw| !raw.is_empty())
            .or(self.env_single.as_deref());
        if let Some(raw) = env_raw {
            for candidate in raw.split(',') {
                push_unique(&mut sources, candidate);
            }
        }

        sources
    }
}

fn push_unique(sources: &mut Vec<String>, candidate: &str) {
    let trimmed = candidate.trim();
    if !trimmed.is_empty() && !sources.iter().any(|s| s == trimmed) {
        sources.push(trimmed.to_string());
    }
}
