use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Config {
    /// Sqlite database path
    #[serde(default = "default_db")]
    pub db: String,
    /// Polling interval in minutes
    #[serde(default = "default_poll_interval")]
    pub poll_interval: u64,
    #[serde(default)]
    pub feeds: Vec<FeedAction>,
}

fn default_db() -> String {
    "rss-actions.db".to_string()
}

fn default_poll_interval() -> u64 {
    15
}

impl Default for Config {
    fn default() -> Self {
        Config {
            db: default_db(),
            poll_interval: default_poll_interval(),
            feeds: Vec::new(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FeedType {
    Rss,
    Atom,
    Json,
    Opml,
}

/// One configured subscription: a feed (or OPML list) URL bound to the
/// command to run when it updates.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct FeedAction {
    pub feed_url: String,
    pub cmd: String,
    #[serde(rename = "type")]
    pub feed_type: FeedType,
}

impl FeedAction {
    pub fn is_list(&self) -> bool {
        self.feed_type == FeedType::Opml
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Parse config from a TOML string (useful for testing)
    pub fn from_str(content: &str) -> anyhow::Result<Self> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Write a default config file if none exists at `path`.
    pub fn touch<P: AsRef<Path>>(path: P) -> anyhow::Result<()> {
        let path = path.as_ref();
        if path.exists() {
            return Ok(());
        }
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let content = toml::to_string_pretty(&Config::default())?;
        std::fs::write(path, content)?;
        Ok(())
    }
}
