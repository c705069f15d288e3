//! Refresh token revocation.
//!
//! Revocation deletes the session behind a refresh token, which also kills
//! every access token sharing its `jti`. The outcome is never disclosed:
//! unknown, forged and already revoked tokens all succeed the same way.

use std::sync::Arc;

use crate::AuthResult;
use crate::clock::SharedClock;
use crate::runtime::{PenaltyScheduler, run_detached};
use crate::storage::SharedSessionStore;
use crate::token::refresh::{fingerprint, resolve_session};

/// Revokes sessions by refresh token.
pub struct Revoker {
    sessions: SharedSessionStore,
    penalty: Arc<PenaltyScheduler>,
    clock: SharedClock,
}

impl Revoker {
    /// Creates a revoker.
    #[must_use]
    pub fn new(
        sessions: SharedSessionStore,
        penalty: Arc<PenaltyScheduler>,
        clock: SharedClock,
    ) -> Self {
        Self {
            sessions,
            penalty,
            clock,
        }
    }

    /// Revokes the session `refresh_token` belongs to.
    ///
    /// Expiry is ignored so an expired but signature-valid token still tears
    /// down its session. The penalty delay always applies.
    ///
    /// # Errors
    ///
    /// Returns a system error only if the session store fails.
    pub async fn revoke(&self, refresh_token: &str) -> AuthResult<()> {
        let resolved =
            resolve_session(self.sessions.as_ref(), refresh_token, self.clock.now(), None).await;

        let outcome = match resolved {
            Ok(Ok(session)) => {
                let sessions = self.sessions.clone();
                let id = session.id.clone();
                run_detached(async move { sessions.delete(&id).await })
                    .await
                    .map(|removed| {
                        if removed {
                            tracing::info!(session_id = %session.id, "session revoked");
                        }
                    })
            }
            Ok(Err(rejection)) => {
                tracing::debug!(
                    reason = rejection.reason(),
                    token = %fingerprint(refresh_token),
                    "revocation of unusable token ignored"
                );
                Ok(())
            }
            Err(e) => Err(e),
        };

        self.penalty.apply().await;
        outcome
    }
}
