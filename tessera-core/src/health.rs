use crate::{Config, Driver, EngineError, Error, Result};
use tokio::{sync::watch, time::sleep};

/// Block until the endpoint of `config` answers the liveness check.
///
/// Probe failures never abort the wait, the store may still be starting up.
/// Only a shutdown signal ends it early. Returns the number of checks issued.
pub async fn wait_until_alive<D: Driver>(
    driver: &D,
    config: &Config,
    mut shutdown: watch::Receiver<bool>,
) -> Result<u32> {
    let mut attempts = 0;
    loop {
        if *shutdown.borrow() {
            return Err(Error::new(EngineError::Connectivity {
                endpoint: config.endpoint().into(),
            })
            .context("Shutdown requested while waiting for the store to come up"));
        }
        attempts += 1;
        match driver.ping(config).await {
            Ok(()) => {
                log::info!(
                    "{} endpoint `{}` is alive after {} check(s)",
                    D::NAME,
                    config.endpoint(),
                    attempts
                );
                return Ok(attempts);
            }
            Err(e) => {
                log::warn!(
                    "Health check {} against `{}` failed, retrying in {:?}: {:#}",
                    attempts,
                    config.endpoint(),
                    config.health_check_delay,
                    e
                );
            }
        }
        tokio::select! {
            _ = sleep(config.health_check_delay) => {}
            changed = shutdown.changed() => {
                if changed.is_err() {
                    // Sender gone, nobody can ask for a shutdown anymore
                    sleep(config.health_check_delay).await;
                }
            }
        }
    }
}
