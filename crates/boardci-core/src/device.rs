//! Device power control.
//!
//! The orchestrator never sequences relays itself; it calls these primitives around
//! the stage loop according to the configured [`PowerAction`]s.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::Result;

/// One physical switch (a relay channel).
#[async_trait]
pub trait Switch: Send + Sync {
    async fn turn_on(&self) -> Result<()>;
    async fn turn_off(&self) -> Result<()>;
}

/// Power and recovery-mode primitives of the board under test.
#[async_trait]
pub trait Device: Send + Sync {
    async fn power_on(&self) -> Result<()>;
    async fn power_off(&self) -> Result<()>;
    async fn power_cycle(&self) -> Result<()>;
    /// Power cycle into the boot ROM recovery mode.
    async fn enter_recovery(&self) -> Result<()>;
    async fn leave_recovery(&self) -> Result<()>;
}

/// What to do with the board before or after a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PowerAction {
    #[default]
    Nothing,
    On,
    Off,
    Cycle,
    Recovery,
}

impl PowerAction {
    pub async fn apply(self, device: &dyn Device) -> Result<()> {
        match self {
            PowerAction::Nothing => Ok(()),
            PowerAction::On => device.power_on().await,
            PowerAction::Off => device.power_off().await,
            PowerAction::Cycle => device.power_cycle().await,
            PowerAction::Recovery => device.enter_recovery().await,
        }
    }
}

impl std::str::FromStr for PowerAction {
    type Err = crate::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "nothing" | "none" => Ok(PowerAction::Nothing),
            "on" => Ok(PowerAction::On),
            "off" => Ok(PowerAction::Off),
            "cycle" => Ok(PowerAction::Cycle),
            "recovery" => Ok(PowerAction::Recovery),
            other => Err(crate::Error::InvalidInput(format!(
                "unknown power action: {}",
                other
            ))),
        }
    }
}
