//! Service configuration
//!
//! Defines the tracked repository, listener addresses, the deploy and
//! release step definitions and the port range handed to launched instances.
//! Step definitions come from per-language defaults.

use hotswap_core::domain::step::ExecStep;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Configuration errors; all of them are fatal at startup
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("unsupported language '{0}' (supported: golang)")]
    UnsupportedLanguage(String),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Platform-dependent values, computed once at startup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Platform {
    /// Suffix appended to built executables (`.exe` on Windows)
    pub exe_suffix: &'static str,
}

impl Platform {
    pub fn current() -> Self {
        Self {
            exe_suffix: if cfg!(windows) { ".exe" } else { "" },
        }
    }
}

/// Project language, selects the default steps
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Language {
    Golang,
}

impl FromStr for Language {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "golang" | "go" => Ok(Language::Golang),
            other => Err(ConfigError::UnsupportedLanguage(other.to_string())),
        }
    }
}

/// Inclusive port range handed out to launched instances
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    pub min: u16,
    pub max: u16,
}

impl PortRange {
    pub fn new(min: u16, max: u16) -> Self {
        Self { min, max }
    }

    pub fn contains(&self, port: u16) -> bool {
        (self.min..=self.max).contains(&port)
    }
}

/// Steps run by the deploy stage, in order; `None` skips the step
#[derive(Debug, Clone, Default)]
pub struct DeployConfig {
    pub install: Option<ExecStep>,
    pub test: Option<ExecStep>,
    pub pre_build: Option<ExecStep>,
    pub build: Option<ExecStep>,
}

/// Release stage settings
#[derive(Debug, Clone)]
pub struct ReleaseConfig {
    /// Command that starts the built artifact
    pub run: ExecStep,

    pub port_range: PortRange,

    /// Host part of the address registered for each instance
    pub host: String,

    /// How long a new instance may take to accept connections before the
    /// release is abandoned; `None` promotes as soon as the process starts
    pub ready_timeout: Option<Duration>,
}

/// Service configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Name of the managed bare repository (path segment of git URLs)
    pub repository: String,

    /// Tracked branch
    pub head: String,

    pub language: Language,

    /// Bind address of the git/API listener
    pub api_addr: String,

    /// Bind address of the reverse proxy listener
    pub proxy_addr: String,

    /// Working root; a fresh temporary directory when unset
    pub workdir: Option<PathBuf>,

    pub platform: Platform,

    pub deploy: DeployConfig,

    pub release: ReleaseConfig,
}

impl Config {
    /// Creates a configuration with the defaults of `language`
    pub fn for_language(
        language: Language,
        repository: impl Into<String>,
        head: impl Into<String>,
    ) -> Self {
        let (deploy, run) = match language {
            Language::Golang => (
                DeployConfig {
                    install: None,
                    test: Some(ExecStep::new("test", "go").args(["test", "-v", "./..."])),
                    pre_build: None,
                    build: Some(
                        ExecStep::new("build", "go").args(["build", "-o", "${artifact}", "."]),
                    ),
                },
                ExecStep::new("run", "${artifact}")
                    .env("ADDR", "localhost:${port}")
                    .env("PORT", "${port}"),
            ),
        };

        Self {
            repository: repository.into(),
            head: head.into(),
            language,
            api_addr: "0.0.0.0:8080".to_string(),
            proxy_addr: "0.0.0.0:8081".to_string(),
            workdir: None,
            platform: Platform::current(),
            deploy,
            release: ReleaseConfig {
                run,
                port_range: PortRange::new(8090, 8100),
                host: "localhost".to_string(),
                ready_timeout: Some(Duration::from_secs(10)),
            },
        }
    }

    /// Validates the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.repository.trim().is_empty() {
            return Err(ConfigError::Invalid("repository cannot be empty".to_string()));
        }

        if self.repository.contains('/') {
            return Err(ConfigError::Invalid(
                "repository must be a single path segment".to_string(),
            ));
        }

        if self.head.trim().is_empty() {
            return Err(ConfigError::Invalid("head cannot be empty".to_string()));
        }

        let range = self.release.port_range;
        if range.min == 0 || range.min > range.max {
            return Err(ConfigError::Invalid(format!(
                "port range [{}, {}] is empty",
                range.min, range.max
            )));
        }

        if self.release.run.command.is_empty() {
            return Err(ConfigError::Invalid("release.run needs a command".to_string()));
        }

        if self.api_addr == self.proxy_addr {
            return Err(ConfigError::Invalid(
                "api and proxy listeners must use different addresses".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_golang_defaults() {
        let config = Config::for_language(Language::Golang, "myrepo", "main");

        assert_eq!(config.release.port_range, PortRange::new(8090, 8100));
        assert_eq!(config.api_addr, "0.0.0.0:8080");
        assert_eq!(config.proxy_addr, "0.0.0.0:8081");

        let build = config.deploy.build.as_ref().unwrap();
        assert_eq!(build.args, vec!["build", "-o", "${artifact}", "."]);
        assert!(config.deploy.install.is_none());
        assert_eq!(config.release.run.envs.get("PORT"), Some("${port}"));
        assert_eq!(config.release.run.envs.get("ADDR"), Some("localhost:${port}"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_language_parsing() {
        assert_eq!("golang".parse::<Language>(), Ok(Language::Golang));
        assert_eq!("Go".parse::<Language>(), Ok(Language::Golang));
        assert_eq!(
            "java".parse::<Language>(),
            Err(ConfigError::UnsupportedLanguage("java".to_string()))
        );
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::for_language(Language::Golang, "myrepo", "main");

        config.repository = String::new();
        assert!(config.validate().is_err());
        config.repository = "a/b".to_string();
        assert!(config.validate().is_err());
        config.repository = "myrepo".to_string();

        config.release.port_range = PortRange::new(9000, 8999);
        assert!(config.validate().is_err());
        config.release.port_range = PortRange::new(9000, 9000);
        assert!(config.validate().is_ok());

        config.proxy_addr = config.api_addr.clone();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_platform_suffix() {
        let platform = Platform::current();
        if cfg!(windows) {
            assert_eq!(platform.exe_suffix, ".exe");
        } else {
            assert_eq!(platform.exe_suffix, "");
        }
    }
}
