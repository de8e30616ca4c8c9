//! Core building blocks shared by storechain binaries.
//!
//! Configuration, state inspection, unit generation and the provisioning
//! workflows live here; host integration is injected through the provider
//! traits so the CLI only wires a concrete host in.

pub mod activation;
pub mod config;
pub mod error;
pub mod fstab;
pub mod inspect;
pub mod logging;
pub mod perms;
pub mod poll;
pub mod provider;
pub mod units;
pub mod workflow;

pub use config::{ConfigFormat, StorechainConfig};
pub use error::{StorechainError, StorechainResult};
pub use provider::{
    HostTools, LvLookup, PvState, ServiceManager, ToolStatus, UnitState, VolumeManager,
};
