//! Binary configuration: the engine config plus messenger definitions.
//!
//! Loaded from `courier.toml` (overridable via `COURIER_CONFIG`) with
//! `COURIER__`-prefixed environment variables layered on top.

use serde::Deserialize;

use courier_messenger::{email::SmtpServerConfig, postback::PostbackConfig};

#[derive(Debug, Clone, Deserialize)]
pub struct SmtpEntry {
    #[serde(default = "enabled")]
    pub enabled: bool,
    #[serde(flatten)]
    pub server: SmtpServerConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PostbackEntry {
    #[serde(default = "enabled")]
    pub enabled: bool,
    #[serde(flatten)]
    pub config: PostbackConfig,
}

const fn enabled() -> bool {
    true
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct AppConfig {
    /// Engine configuration.
    pub app: courier_common::Config,

    /// SMTP relays for the built-in "email" messenger.
    pub smtp: Vec<SmtpEntry>,

    /// HTTP postback messengers.
    pub messengers: Vec<PostbackEntry>,

    /// Recipients of operator notifications (campaign finished/cancelled).
    pub notify_emails: Vec<String>,

    /// Optional JSON file of campaigns and subscribers loaded into the
    /// in-memory store at startup.
    pub seed_file: Option<String>,
}

impl AppConfig {
    /// Load and merge file + environment sources.
    pub fn load() -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder()
            .add_source(config::File::new("courier", config::FileFormat::Toml).required(false));

        if let Ok(path) = std::env::var("COURIER_CONFIG") {
            builder = builder.add_source(config::File::with_name(&path).required(true));
        }

        builder
            .add_source(
                config::Environment::with_prefix("COURIER")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }
}
