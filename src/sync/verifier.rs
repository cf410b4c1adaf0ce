//! Bounded double-check of provider-reported sign-outs.
//!
//! The provider SDK occasionally reports `SIGNED_OUT` while the session is
//! still valid (token refresh races, storage hiccups in another tab). Before
//! wiping local state the verifier asks the provider for its live session a
//! fixed number of times; any live session means the event was spurious.
//!
//! ```text
//! idle ──SIGNED_OUT──▶ verifying(0) ──none──▶ verifying(1) ──none──▶ verifying(2) ──none──▶ local-cleanup
//!                          │                      │                      │
//!                          └──────── live ────────┴──────────────────────┴──▶ restored
//! ```

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::guard::{GuardLease, GuardState};
use super::SyncContext;

/// How a verification ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifierOutcome {
    /// The provider still had a live session; local state was restored.
    Restored,
    /// No session after every attempt; local state and caches were cleared.
    LocalCleanup,
    /// An explicit sign-out or teardown took over.
    Aborted,
}

pub struct SignOutVerifier {
    ctx: SyncContext,
    attempts: u32,
    interval: Duration,
    /// Id and token of the verification currently running, if any.
    running: Mutex<Option<(u64, CancellationToken)>>,
    next_id: AtomicU64,
    cancel: CancellationToken,
}

impl SignOutVerifier {
    pub fn new(
        ctx: SyncContext,
        attempts: u32,
        interval: Duration,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            attempts: attempts.max(1),
            interval,
            running: Mutex::new(None),
            next_id: AtomicU64::new(0),
            cancel,
        })
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    /// React to a provider `SIGNED_OUT` event.
    ///
    /// Returns the verification task, or `None` when there is nothing to
    /// verify: an explicit sign-out is in flight, a verification is already
    /// running, the tab is already anonymous, or the guard is busy.
    pub fn on_signed_out(self: &Arc<Self>) -> Option<JoinHandle<VerifierOutcome>> {
        if self.ctx.guard.is_signing_out() {
            tracing::debug!("SIGNED_OUT during explicit sign-out, not verifying");
            return None;
        }
        if self.ctx.store.user().is_none() {
            tracing::debug!("SIGNED_OUT while anonymous, nothing to verify");
            return None;
        }

        let (id, token, lease) = {
            let mut running = self.running.lock();
            if running.is_some() {
                tracing::debug!("Sign-out verification already running");
                return None;
            }
            let lease = self.ctx.guard.try_acquire(GuardState::Syncing)?;
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            let token = self.cancel.child_token();
            *running = Some((id, token.clone()));
            (id, token, lease)
        };

        self.ctx.store.set_verifying_sign_out(true);
        let this = Arc::clone(self);
        Some(tokio::spawn(async move {
            let outcome = this.verify(lease, &token).await;
            let idle = {
                let mut running = this.running.lock();
                if running.as_ref().is_some_and(|(current, _)| *current == id) {
                    *running = None;
                }
                running.is_none()
            };
            if idle {
                this.ctx.store.set_verifying_sign_out(false);
            }
            tracing::info!(?outcome, "Sign-out verification finished");
            outcome
        }))
    }

    /// Cancel a running verification.
    pub fn cancel_pending(&self) {
        if let Some((_, token)) = self.running.lock().take() {
            token.cancel();
            self.ctx.store.set_verifying_sign_out(false);
        }
    }

    async fn verify(&self, lease: GuardLease, token: &CancellationToken) -> VerifierOutcome {
        for attempt in 0..self.attempts {
            if attempt > 0 {
                tokio::select! {
                    () = token.cancelled() => return VerifierOutcome::Aborted,
                    () = tokio::time::sleep(self.interval) => {}
                }
            }
            if self.ctx.guard.is_signing_out() {
                return VerifierOutcome::Aborted;
            }

            let result = tokio::select! {
                () = token.cancelled() => return VerifierOutcome::Aborted,
                result = self.ctx.provider.get_session() => result,
            };
            // The explicit flow may have started while the provider answered.
            if self.ctx.guard.is_signing_out() {
                return VerifierOutcome::Aborted;
            }

            match result {
                Ok(Some(session)) => {
                    tracing::info!(user_id = %session.user.id, attempt, "Spurious sign-out, restoring session");
                    self.ctx.restore_session(session);
                    drop(lease);
                    return VerifierOutcome::Restored;
                }
                Ok(None) => {
                    tracing::debug!(attempt, "No live session");
                }
                Err(e) => {
                    tracing::warn!(attempt, "Session check failed during sign-out verification: {e}");
                }
            }
        }

        let user_id = self.ctx.clear_local();
        tracing::info!(
            user_id = user_id.as_deref().unwrap_or("-"),
            attempts = self.attempts,
            "Sign-out confirmed, local state cleared"
        );
        drop(lease);
        VerifierOutcome::LocalCleanup
    }
}
