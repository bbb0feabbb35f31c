use anyhow::Context;
use clap::Parser;
use hotswap_server::config::{Config, Language, PortRange};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const BANNER: &str = r"
  _           _
 | |__   ___ | |_ _____      ____ _ _ __
 | '_ \ / _ \| __/ __\ \ /\ / / _` | '_ \
 | | | | (_) | |_\__ \\ V  V / (_| | |_) |
 |_| |_|\___/ \__|___/ \_/\_/ \__,_| .__/
                                   |_|
";

#[derive(Parser)]
#[command(name = "hotswap", version)]
#[command(about = "Push-to-deploy server with zero-downtime swaps", long_about = None)]
struct Cli {
    /// Name of the managed repository
    #[arg(long, env = "HOTSWAP_REPOSITORY", default_value = "hotswap")]
    repository: String,

    /// Branch that gets deployed
    #[arg(long, env = "HOTSWAP_HEAD", default_value = "main")]
    head: String,

    /// Project language, selects the build and run steps
    #[arg(long, env = "HOTSWAP_LANGUAGE", default_value = "golang")]
    language: String,

    /// Bind address of the git and API listener
    #[arg(long, env = "HOTSWAP_API_ADDR", default_value = "0.0.0.0:8080")]
    api_addr: String,

    /// Bind address of the reverse proxy
    #[arg(long, env = "HOTSWAP_PROXY_ADDR", default_value = "0.0.0.0:8081")]
    proxy_addr: String,

    /// Working root; a temporary directory removed on exit when unset
    #[arg(long, env = "HOTSWAP_WORKDIR")]
    workdir: Option<PathBuf>,

    /// Lowest port handed to launched instances
    #[arg(long, env = "HOTSWAP_PORT_MIN", default_value_t = 8090)]
    port_min: u16,

    /// Highest port handed to launched instances
    #[arg(long, env = "HOTSWAP_PORT_MAX", default_value_t = 8100)]
    port_max: u16,
}

impl Cli {
    fn into_config(self) -> anyhow::Result<Config> {
        let language: Language = self.language.parse()?;
        let mut config = Config::for_language(language, self.repository, self.head);
        config.api_addr = self.api_addr;
        config.proxy_addr = self.proxy_addr;
        config.workdir = self.workdir;
        config.release.port_range = PortRange::new(self.port_min, self.port_max);
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "hotswap_server=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Cli::parse()
        .into_config()
        .context("invalid configuration")?;

    tracing::info!("{}", BANNER);
    tracing::info!(
        "Starting hotswap {} for '{}' on branch '{}'",
        env!("CARGO_PKG_VERSION"),
        config.repository,
        config.head
    );

    hotswap_server::server::run(config).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::{CommandFactory, error::ErrorKind};

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_version_flag() {
        let err = Cli::try_parse_from(["hotswap", "--version"]).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::DisplayVersion);
    }

    #[test]
    fn test_port_range_from_flags() {
        let config = Cli::try_parse_from(["hotswap", "--port-min", "9000", "--port-max", "9010"])
            .unwrap()
            .into_config()
            .unwrap();
        assert_eq!(config.release.port_range, PortRange::new(9000, 9010));
    }
}
