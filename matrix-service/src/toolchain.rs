// Toolchain Resolution
// Maps a snapshot's toolchain pin to the ordered list of toolchains to test

use crate::error::{ServiceError, ServiceResult};
use crate::runners::{ProcessCommand, ProcessRunner};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

/// Minimum supported version used when a snapshot pins nothing
pub const DEFAULT_FALLBACK_MSRV: &str = "1.63.0";

/// Release channel a toolchain stands for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Nightly,
    Stable,
    Beta,
    Msrv,
}

impl Channel {
    pub const ALL: [Channel; 4] = [Channel::Nightly, Channel::Stable, Channel::Beta, Channel::Msrv];

    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Nightly => "nightly",
            Channel::Stable => "stable",
            Channel::Beta => "beta",
            Channel::Msrv => "msrv",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Channel {
    type Err = ServiceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "nightly" => Ok(Channel::Nightly),
            "stable" => Ok(Channel::Stable),
            "beta" => Ok(Channel::Beta),
            "msrv" | "minimum" => Ok(Channel::Msrv),
            other => Err(ServiceError::Config(format!("unknown channel '{}'", other))),
        }
    }
}

/// A concrete toolchain, named the way `cargo +<name>` expects
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToolchainHandle {
    pub channel: Channel,
    pub name: String,
    /// False when the name is a fallback rather than the snapshot's own pin
    pub pinned: bool,
}

impl ToolchainHandle {
    pub fn new(channel: Channel, name: impl Into<String>) -> Self {
        Self {
            channel,
            name: name.into(),
            pinned: true,
        }
    }
}

/// Resolves the toolchains a snapshot is tested with
#[async_trait::async_trait]
pub trait ToolchainResolver: Send + Sync {
    /// Ordered handles (nightly, stable, beta, minimum supported). Without a
    /// pin the minimum-supported handle carries the fallback and `pinned`
    /// is false.
    async fn resolve(&self, pin: Option<&str>) -> ServiceResult<Vec<ToolchainHandle>>;
}

/// Resolver backed by rustup channel names
pub struct RustupToolchainResolver {
    runner: Arc<dyn ProcessRunner>,
    channels: Vec<Channel>,
    fallback_msrv: String,
    /// Install each toolchain through rustup before handing it out
    install: bool,
}

impl RustupToolchainResolver {
    pub fn new(runner: Arc<dyn ProcessRunner>) -> Self {
        Self {
            runner,
            channels: Channel::ALL.to_vec(),
            fallback_msrv: DEFAULT_FALLBACK_MSRV.to_string(),
            install: false,
        }
    }

    pub fn with_channels(mut self, channels: Vec<Channel>) -> Self {
        self.channels = channels;
        self
    }

    pub fn with_fallback_msrv(mut self, version: impl Into<String>) -> Self {
        self.fallback_msrv = version.into();
        self
    }

    pub fn with_install(mut self, install: bool) -> Self {
        self.install = install;
        self
    }

    fn handles(&self, pin: Option<&str>) -> Vec<ToolchainHandle> {
        let mut handles: Vec<ToolchainHandle> = Vec::new();
        for channel in Channel::ALL {
            if !self.channels.contains(&channel) {
                continue;
            }
            let handle = match channel {
                Channel::Msrv => match pin {
                    Some(pin) => ToolchainHandle::new(channel, pin),
                    None => ToolchainHandle {
                        pinned: false,
                        ..ToolchainHandle::new(channel, self.fallback_msrv.clone())
                    },
                },
                other => ToolchainHandle::new(other, other.as_str()),
            };
            // A pin naming a channel ("stable") is already covered
            if handles.iter().all(|h| h.name != handle.name) {
                handles.push(handle);
            }
        }
        handles
    }

    async fn install(&self, handle: &ToolchainHandle) -> ServiceResult<()> {
        let command = ProcessCommand::new("rustup", cwd()).args([
            "toolchain",
            "install",
            handle.name.as_str(),
            "--profile",
            "minimal",
            "--component",
            "clippy",
            "--component",
            "rustfmt",
        ]);
        let output = self.runner.run(&command).await?;
        if !output.success() {
            return Err(ServiceError::command(
                command.display(),
                output.failure_summary(),
            ));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl ToolchainResolver for RustupToolchainResolver {
    async fn resolve(&self, pin: Option<&str>) -> ServiceResult<Vec<ToolchainHandle>> {
        let handles = self.handles(pin);
        if handles.is_empty() {
            return Err(ServiceError::Config("no toolchain channels enabled".to_string()));
        }

        if self.install {
            for handle in &handles {
                tracing::info!(toolchain = %handle.name, "installing toolchain");
                self.install(handle).await?;
            }
        }

        Ok(handles)
    }
}

fn cwd() -> PathBuf {
    std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runners::fake::ScriptedRunner;

    fn names(handles: &[ToolchainHandle]) -> Vec<&str> {
        handles.iter().map(|h| h.name.as_str()).collect()
    }

    #[tokio::test]
    async fn test_resolve_with_pin() {
        let resolver = RustupToolchainResolver::new(Arc::new(ScriptedRunner::new()));
        let handles = resolver.resolve(Some("1.70.0")).await.unwrap();

        assert_eq!(names(&handles), vec!["nightly", "stable", "beta", "1.70.0"]);
        assert!(handles.iter().all(|h| h.pinned));
        assert_eq!(handles[3].channel, Channel::Msrv);
    }

    #[tokio::test]
    async fn test_missing_pin_uses_fallback() {
        let resolver = RustupToolchainResolver::new(Arc::new(ScriptedRunner::new()))
            .with_fallback_msrv("1.56.1");
        let handles = resolver.resolve(None).await.unwrap();

        let msrv = handles.iter().find(|h| h.channel == Channel::Msrv).unwrap();
        assert_eq!(msrv.name, "1.56.1");
        assert!(!msrv.pinned);
    }

    #[tokio::test]
    async fn test_pin_naming_a_channel_is_deduplicated() {
        let resolver = RustupToolchainResolver::new(Arc::new(ScriptedRunner::new()));
        let handles = resolver.resolve(Some("stable")).await.unwrap();
        assert_eq!(names(&handles), vec!["nightly", "stable", "beta"]);
    }

    #[tokio::test]
    async fn test_channel_subset() {
        let resolver = RustupToolchainResolver::new(Arc::new(ScriptedRunner::new()))
            .with_channels(vec![Channel::Msrv, Channel::Stable]);
        let handles = resolver.resolve(Some("1.65")).await.unwrap();
        // Order follows the channel order, not the configuration order
        assert_eq!(names(&handles), vec!["stable", "1.65"]);

        let empty = RustupToolchainResolver::new(Arc::new(ScriptedRunner::new()))
            .with_channels(Vec::new());
        assert!(empty.resolve(None).await.is_err());
    }

    #[tokio::test]
    async fn test_install_runs_rustup() {
        let runner = Arc::new(ScriptedRunner::new().fail("install beta", "network down"));
        let resolver = RustupToolchainResolver::new(runner.clone())
            .with_channels(vec![Channel::Stable, Channel::Beta])
            .with_install(true);

        let err = resolver.resolve(None).await.unwrap_err();
        assert!(err.to_string().contains("network down"));
        assert_eq!(runner.count("rustup toolchain install"), 2);
    }

    #[test]
    fn test_channel_parse() {
        assert_eq!("Nightly".parse::<Channel>().unwrap(), Channel::Nightly);
        assert_eq!("minimum".parse::<Channel>().unwrap(), Channel::Msrv);
        assert!("lts".parse::<Channel>().is_err());
    }
}
