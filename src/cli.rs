//! CLI argument parsing.

use aogate_core::config::Config;
use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "aogate", version, about = "Reverse proxy for Azure OpenAI endpoints")]
pub struct Cli {
    /// Path to a YAML configuration file
    #[arg(long)]
    pub config_file: Option<String>,

    /// Name of an environment variable holding the configuration
    #[arg(long)]
    pub config_env_var: Option<String>,

    /// Configuration as a literal YAML/JSON string
    #[arg(long)]
    pub config_string: Option<String>,

    /// Port the proxy listens on. Ports <= 1024 may need special permissions.
    #[arg(long, default_value_t = 80, env = "AOGATE_PORT")]
    pub port: u16,

    /// Log level
    #[arg(long, default_value = "info", env = "AOGATE_LOG_LEVEL")]
    pub log_level: String,
}

impl Cli {
    /// Load the configuration: explicit file, then named environment
    /// variable, then literal string, then the `AOGATE_CONFIG_STRING`
    /// fallback variable.
    pub fn load_config(&self) -> anyhow::Result<Config> {
        if let Some(ref path) = self.config_file {
            return Config::from_file(path);
        }
        if let Some(ref name) = self.config_env_var {
            return Config::from_env_var(name);
        }
        if let Some(ref contents) = self.config_string {
            return Config::from_yaml(contents);
        }
        if std::env::var("AOGATE_CONFIG_STRING").is_ok() {
            return Config::from_env_var("AOGATE_CONFIG_STRING");
        }
        anyhow::bail!(
            "no configuration provided; pass --config-file, --config-env-var or \
             --config-string, or set AOGATE_CONFIG_STRING"
        )
    }
}
