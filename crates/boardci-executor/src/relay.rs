//! Relay-driven board power control.

use async_trait::async_trait;
use boardci_config::RelayConfig;
use boardci_core::device::{Device, Switch};
use boardci_core::{Error, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info};

/// One channel of a USB relay board, switched through an external command
/// (`<command> on|off <relay>`).
#[derive(Debug, Clone)]
pub struct RelaySwitch {
    name: &'static str,
    command: PathBuf,
    relay: u32,
}

impl RelaySwitch {
    pub fn new(name: &'static str, command: impl Into<PathBuf>, relay: u32) -> Self {
        Self {
            name,
            command: command.into(),
            relay,
        }
    }

    async fn set(&self, state: &str) -> Result<()> {
        debug!(
            switch = self.name,
            relay = self.relay,
            state,
            command = %self.command.display(),
            "Switching relay"
        );

        let status = Command::new(&self.command)
            .arg(state)
            .arg(self.relay.to_string())
            .status()
            .await
            .map_err(|e| {
                Error::Device(format!(
                    "failed to run {}: {}",
                    self.command.display(),
                    e
                ))
            })?;

        if !status.success() {
            return Err(Error::Device(format!(
                "{} {} {} exited with {}",
                self.command.display(),
                state,
                self.relay,
                status
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl Switch for RelaySwitch {
    async fn turn_on(&self) -> Result<()> {
        self.set("on").await
    }

    async fn turn_off(&self) -> Result<()> {
        self.set("off").await
    }
}

/// A board wired to a power relay and a recovery-mode relay.
///
/// The power relay is normally closed: switching it on cuts the power.
pub struct BoardPower {
    power: Arc<dyn Switch>,
    recovery: Arc<dyn Switch>,
    settle: Duration,
}

impl BoardPower {
    pub fn new(power: Arc<dyn Switch>, recovery: Arc<dyn Switch>, settle: Duration) -> Self {
        Self {
            power,
            recovery,
            settle,
        }
    }

    pub fn from_config(config: &RelayConfig) -> Self {
        Self::new(
            Arc::new(RelaySwitch::new("power", &config.command, config.power)),
            Arc::new(RelaySwitch::new("recovery", &config.command, config.recovery)),
            config.settle,
        )
    }
}

#[async_trait]
impl Device for BoardPower {
    async fn power_on(&self) -> Result<()> {
        self.power.turn_off().await
    }

    async fn power_off(&self) -> Result<()> {
        self.power.turn_on().await
    }

    async fn power_cycle(&self) -> Result<()> {
        info!("Power cycling board");
        self.power_off().await?;
        tokio::time::sleep(self.settle).await;
        self.power_on().await
    }

    async fn enter_recovery(&self) -> Result<()> {
        info!("Booting board into recovery mode");
        self.power_off().await?;
        self.recovery.turn_on().await?;
        tokio::time::sleep(self.settle).await;
        self.power_on().await
    }

    async fn leave_recovery(&self) -> Result<()> {
        self.power_off().await?;
        self.recovery.turn_off().await
    }
}
