//! Core domain types and traits for boardci, a hardware-in-the-loop CI orchestrator.
//!
//! This crate contains:
//! - Job identity, descriptor and status types
//! - Stage and command entry definitions
//! - Collaborator traits: command sessions, status sinks, job stores, device power
//! - Transcript helpers shared by the store and the HTTP API

pub mod device;
pub mod error;
pub mod id;
pub mod job;
pub mod pipeline;
pub mod session;
pub mod status;
pub mod store;
pub mod transcript;

pub use error::{Error, Result};
pub use id::RunId;
pub use job::{Job, JobDescriptor, JobIdentity, JobStatus, SupersessionKey};
