//! Transient activation of a boot unit around a one-time action.

use crate::error::{require_ok, StorechainError, StorechainResult};
use crate::provider::ServiceManager;
use log::{debug, info, warn};

/// Keeps a unit started until released or dropped; stops it exactly once.
pub struct ActivationGuard<'a, S>
where
    S: ServiceManager<Error = StorechainError>,
{
    services: &'a S,
    unit: String,
    released: bool,
}

impl<'a, S> ActivationGuard<'a, S>
where
    S: ServiceManager<Error = StorechainError>,
{
    /// Start `unit`. A failed start is followed by one best-effort stop and
    /// the unit's recent journal is logged before the error is returned.
    pub fn start(services: &'a S, unit: &str, journal_lines: usize) -> StorechainResult<Self> {
        info!("starting {unit} for transient activation");
        let status = match services.start(unit) {
            Ok(status) => status,
            Err(err) => {
                stop_best_effort(services, unit);
                return Err(err);
            }
        };

        if !status.is_ok() {
            stop_best_effort(services, unit);
            log_recent_journal(services, unit, journal_lines);
            require_ok(format!("systemctl start {unit}"), status)?;
        }

        Ok(Self {
            services,
            unit: unit.to_string(),
            released: false,
        })
    }

    pub fn unit(&self) -> &str {
        &self.unit
    }

    /// Stop the unit now instead of at drop.
    pub fn release(mut self) {
        self.stop_once();
    }

    fn stop_once(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        stop_best_effort(self.services, &self.unit);
    }
}

impl<S> Drop for ActivationGuard<'_, S>
where
    S: ServiceManager<Error = StorechainError>,
{
    fn drop(&mut self) {
        self.stop_once();
    }
}

/// Run `action` while `unit` is started, stopping it afterwards whatever
/// the action's outcome.
pub fn with_activated<S, T, F>(
    services: &S,
    unit: &str,
    journal_lines: usize,
    action: F,
) -> StorechainResult<T>
where
    S: ServiceManager<Error = StorechainError>,
    F: FnOnce() -> StorechainResult<T>,
{
    let guard = ActivationGuard::start(services, unit, journal_lines)?;
    let result = action();
    if let Err(err) = &result {
        debug!("action under {} failed: {err}", guard.unit());
    }
    guard.release();
    result
}

fn stop_best_effort<S>(services: &S, unit: &str)
where
    S: ServiceManager<Error = StorechainError>,
{
    match services.stop(unit) {
        Ok(status) if status.is_ok() => info!("stopped {unit}"),
        Ok(status) => warn!("systemctl stop {unit} reported {status}"),
        Err(err) => warn!("systemctl stop {unit} failed: {err}"),
    }
}

/// Log the tail of `unit`'s journal at warn level.
pub fn log_recent_journal<S>(services: &S, unit: &str, lines: usize)
where
    S: ServiceManager<Error = StorechainError>,
{
    match services.recent_logs(unit, lines) {
        Ok(journal) if !journal.trim().is_empty() => {
            warn!("last {lines} journal lines for {unit}:");
            for line in journal.lines() {
                warn!("  {line}");
            }
        }
        Ok(_) => warn!("journal for {unit} is empty"),
        Err(err) => warn!("unable to read journal for {unit}: {err}"),
    }
}
