//! Background key-block populator.
//!
//! One recurring task per process keeps the current and next block filled.
//! Each tick is idempotent, and racing instances converge through "add to
//! set", so no cross-instance coordination is needed.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::manager::KeyRotationManager;
use crate::{AuthError, AuthResult};

static POPULATOR_SLOT: AtomicBool = AtomicBool::new(false);

/// Releases the process-wide slot when the task ends or is dropped.
struct SlotGuard;

impl Drop for SlotGuard {
    fn drop(&mut self) {
        POPULATOR_SLOT.store(false, Ordering::Release);
    }
}

/// Handle to the running populator.
pub struct PopulatorHandle {
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

impl PopulatorHandle {
    /// Token that stops the task when cancelled.
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stops the task and waits for it to exit.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.join.await {
            tracing::warn!(error = %e, "signing-key populator task ended abnormally");
        }
    }
}

/// Returns true while a populator is running in this process.
#[must_use]
pub fn populator_running() -> bool {
    POPULATOR_SLOT.load(Ordering::Acquire)
}

impl KeyRotationManager {
    /// Starts the recurring populator.
    ///
    /// The first tick runs immediately. Cancelling `cancel` (or calling
    /// [`PopulatorHandle::shutdown`]) stops it between ticks.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::Configuration` if a populator is already running
    /// in this process.
    pub fn start_populator(
        self: Arc<Self>,
        cancel: CancellationToken,
    ) -> AuthResult<PopulatorHandle> {
        if POPULATOR_SLOT
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(AuthError::configuration(
                "signing-key populator is already running in this process",
            ));
        }

        let every = self.settings().populate_interval;
        let token = cancel.clone();
        let join = tokio::spawn(async move {
            let _slot = SlotGuard;
            let mut interval = tokio::time::interval(every);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        tracing::info!("signing-key populator stopped");
                        return;
                    }
                    _ = interval.tick() => {}
                }

                match self.populate_once().await {
                    Ok(created) if created > 0 => {
                        tracing::debug!(created, "signing-key populator tick created blocks");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::error!(error = %e, "signing-key populator tick failed");
                    }
                }
            }
        });

        tracing::info!(interval = ?every, "signing-key populator started");
        Ok(PopulatorHandle { cancel, join })
    }
}
