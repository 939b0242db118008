//! Execution backends for boardci.
//!
//! Provides:
//! - A command session on a real shell behind a pseudo-terminal
//! - The stage executor that replays command entries and classifies outcomes
//! - Relay control of the board's power and recovery mode

pub mod pty;
pub mod relay;
pub mod stage;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use pty::{PtySession, PtySessionFactory};
pub use relay::{BoardPower, RelaySwitch};
pub use stage::{ShellState, StageExecutor, prepare_session};
