use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::PathBuf;

const CONFIG_FILE_NAME: &str = "elsie_config.toml";

/// A human-controlled character the scene already knows about, with the
/// topics that character is known to be an expert in.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct KnownCharacterConfig {
    pub name: String,
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default)]
    pub expertise: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    // AI character identity
    #[serde(default = "default_character_name", alias = "agent_name")]
    pub character_name: String,
    #[serde(default = "default_character_aliases")]
    pub character_aliases: Vec<String>,
    #[serde(default = "default_role_titles")]
    pub role_titles: Vec<String>,
    #[serde(default = "default_character_expertise")]
    pub character_expertise: Vec<String>,

    #[serde(default)]
    pub known_characters: Vec<KnownCharacterConfig>,

    // Director commands
    #[serde(default = "default_director_tags")]
    pub director_tags: Vec<String>,

    // Lifecycle thresholds
    #[serde(default = "default_implicit_trigger_threshold")]
    pub implicit_trigger_threshold: f32,
    #[serde(default = "default_soft_close_threshold")]
    pub soft_close_threshold: f32,
    #[serde(default = "default_dialogue_density_threshold")]
    pub dialogue_density_threshold: usize,
    #[serde(default = "default_recent_turn_window")]
    pub recent_turn_window: usize,
    #[serde(default = "default_inactivity_timeout_secs")]
    pub inactivity_timeout_secs: u64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    // Cue thresholds
    #[serde(default = "default_vulnerability_threshold")]
    pub vulnerability_threshold: f32,
    #[serde(default = "default_max_message_chars")]
    pub max_message_chars: usize,

    /// Priority order of the decision rules, by name.
    #[serde(default = "default_rule_order")]
    pub rule_order: Vec<String>,

    /// Extra theme keywords merged into the built-in lexicon (tag -> keywords).
    #[serde(default)]
    pub theme_keywords: BTreeMap<String, Vec<String>>,

    // Journal and outbound delivery
    #[serde(default = "default_journal_path")]
    pub journal_path: String,
    #[serde(default)]
    pub response_webhook_url: Option<String>,
}

fn default_character_name() -> String {
    "Elsie".to_string()
}

fn default_character_aliases() -> Vec<String> {
    vec!["Els".to_string()]
}

fn default_role_titles() -> Vec<String> {
    vec![
        "bartender".to_string(),
        "barkeep".to_string(),
        "barmaid".to_string(),
        "server".to_string(),
    ]
}

fn default_character_expertise() -> Vec<String> {
    vec![
        "drinks".to_string(),
        "hospitality".to_string(),
        "stellar_cartography".to_string(),
        "music".to_string(),
    ]
}

fn default_director_tags() -> Vec<String> {
    vec!["DGM".to_string()]
}

fn default_implicit_trigger_threshold() -> f32 {
    0.6
}

fn default_soft_close_threshold() -> f32 {
    0.8
}

fn default_dialogue_density_threshold() -> usize {
    3
}

fn default_recent_turn_window() -> usize {
    12
}

fn default_inactivity_timeout_secs() -> u64 {
    1800
}

fn default_sweep_interval_secs() -> u64 {
    60
}

fn default_vulnerability_threshold() -> f32 {
    0.5
}

fn default_max_message_chars() -> usize {
    4000
}

pub fn default_rule_order() -> Vec<String> {
    [
        "director_override",
        "cross_channel",
        "direct_address",
        "emotional_support",
        "group_address",
        "technical_expertise",
        "other_character_addressed",
        "default",
    ]
    .iter()
    .map(|name| name.to_string())
    .collect()
}

fn default_journal_path() -> String {
    "elsie_journal.db".to_string()
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            character_name: default_character_name(),
            character_aliases: default_character_aliases(),
            role_titles: default_role_titles(),
            character_expertise: default_character_expertise(),
            known_characters: Vec::new(),
            director_tags: default_director_tags(),
            implicit_trigger_threshold: default_implicit_trigger_threshold(),
            soft_close_threshold: default_soft_close_threshold(),
            dialogue_density_threshold: default_dialogue_density_threshold(),
            recent_turn_window: default_recent_turn_window(),
            inactivity_timeout_secs: default_inactivity_timeout_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            vulnerability_threshold: default_vulnerability_threshold(),
            max_message_chars: default_max_message_chars(),
            rule_order: default_rule_order(),
            theme_keywords: BTreeMap::new(),
            journal_path: default_journal_path(),
            response_webhook_url: None,
        }
    }
}

impl EngineConfig {
    /// Get the directory containing the executable
    fn get_base_dir() -> PathBuf {
        match std::env::current_exe() {
            Ok(exe_path) => exe_path
                .parent()
                .map(|p| p.to_path_buf())
                .unwrap_or_else(|| PathBuf::from(".")),
            Err(_) => PathBuf::from("."),
        }
    }

    /// Path of the config file next to the executable.
    pub fn config_path() -> PathBuf {
        Self::get_base_dir().join(CONFIG_FILE_NAME)
    }

    fn user_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("elsie").join(CONFIG_FILE_NAME))
    }

    /// Load config from elsie_config.toml next to the executable, then the
    /// user config directory, falling back to defaults + env vars.
    /// Environment overrides are applied on top of whichever source won.
    pub fn load() -> Self {
        let mut candidates = vec![Self::config_path()];
        candidates.extend(Self::user_config_path());

        for path in candidates {
            let Ok(contents) = fs::read_to_string(&path) else {
                continue;
            };
            match toml::from_str::<EngineConfig>(&contents) {
                Ok(mut config) => {
                    tracing::info!("Loaded config from {:?}", path);
                    config.apply_env_overrides();
                    return config;
                }
                Err(e) => {
                    tracing::error!("Failed to parse {:?}: {}", path, e);
                }
            }
        }

        tracing::warn!("No config file found, using defaults + env vars");
        Self::from_env()
    }

    /// Save config to file (next to executable)
    pub fn save(&self) -> Result<()> {
        let path = Self::config_path();

        let toml_string = toml::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(&path, toml_string)
            .with_context(|| format!("Failed to write config to {:?}", path))?;

        tracing::info!("Saved config to {:?}", path);
        Ok(())
    }

    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(name) = env::var("ELSIE_CHARACTER_NAME") {
            if !name.trim().is_empty() {
                self.character_name = name.trim().to_string();
            }
        }

        if let Ok(raw) = env::var("ELSIE_INACTIVITY_TIMEOUT_SECS") {
            if let Ok(seconds) = raw.trim().parse() {
                self.inactivity_timeout_secs = seconds;
            }
        }

        if let Ok(raw) = env::var("ELSIE_SWEEP_INTERVAL_SECS") {
            if let Ok(seconds) = raw.trim().parse() {
                self.sweep_interval_secs = seconds;
            }
        }

        if let Ok(path) = env::var("ELSIE_JOURNAL_PATH") {
            if !path.trim().is_empty() {
                self.journal_path = path;
            }
        }

        if let Ok(url) = env::var("ELSIE_RESPONSE_WEBHOOK_URL") {
            let url = url.trim();
            self.response_webhook_url = if url.is_empty() {
                None
            } else {
                Some(url.to_string())
            };
        }

        if let Ok(raw) = env::var("ELSIE_RULE_ORDER") {
            let order = parse_rule_order_list(&raw);
            if !order.is_empty() {
                self.rule_order = order;
            }
        }
    }
}

fn parse_rule_order_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|name| name.trim().to_ascii_lowercase())
        .filter(|name| !name.is_empty())
        .collect()
}
