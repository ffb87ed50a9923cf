/// Reservation heartbeat
///
/// Keeps a reservation live while a unit of work executes by renewing it from
/// a scoped background thread.
use crossbeam_channel::{bounded, RecvTimeoutError};
use std::thread;
use std::time::Duration;
use tracing::warn;

use super::{ResultStore, ReservationToken};
use crate::logging::services;

const MIN_INTERVAL: Duration = Duration::from_millis(5);

/// Renew often enough that a live worker never looks stale
pub fn heartbeat_interval(stale_after: Duration) -> Duration {
    (stale_after / 4).max(MIN_INTERVAL)
}

/// Run `work` while renewing `token` every `interval`
pub fn with_heartbeat<S, T, F>(store: &S, token: &ReservationToken, interval: Duration, work: F) -> T
where
    S: ResultStore + ?Sized,
    F: FnOnce() -> T,
{
    let (stop_tx, stop_rx) = bounded::<()>(0);

    thread::scope(|scope| {
        scope.spawn(move || loop {
            match stop_rx.recv_timeout(interval) {
                Err(RecvTimeoutError::Timeout) => match store.renew(token) {
                    Ok(true) => {}
                    Ok(false) => {
                        warn!(
                            service = services::STORE,
                            fingerprint = %token.fingerprint,
                            "reservation was taken over while running"
                        );
                        break;
                    }
                    Err(e) => warn!(
                        service = services::STORE,
                        fingerprint = %token.fingerprint,
                        error = %e,
                        "failed to renew reservation"
                    ),
                },
                _ => break,
            }
        });

        let result = work();
        drop(stop_tx);
        result
    })
}
