//! Provider contracts used by `storechain-core` workflows.
//!
//! Concrete implementations live in `storechain-system`; the shared traits
//! and types are sourced from `storechain-provider`.

pub use storechain_provider::host::HostTools;
pub use storechain_provider::service::{ServiceManager, UnitState};
pub use storechain_provider::volume::{LvLookup, PvState, VolumeManager};
pub use storechain_provider::ToolStatus;

use crate::error::StorechainError;

/// Everything a provisioning run needs from the host, bundled as one bound.
pub trait Host:
    VolumeManager<Error = StorechainError>
    + ServiceManager<Error = StorechainError>
    + HostTools<Error = StorechainError>
{
}

impl<T> Host for T where
    T: VolumeManager<Error = StorechainError>
        + ServiceManager<Error = StorechainError>
        + HostTools<Error = StorechainError>
{
}
