// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background lease renewal.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, warn};

use super::LeaseLock;

/// Lower bound on the pause between renewals, so an almost-expired lease does not spin.
const MIN_RENEWAL_INTERVAL: Duration = Duration::from_millis(5);

/// Keeps a held lease alive by extending it at a third of its remaining TTL.
///
/// The task is detached: it never blocks the runner and does not keep the
/// process alive. It ends when the lease is observed expired, when
/// [`stop`](Self::stop) is called, or when the daemon is dropped, after which
/// the lease lapses at its expiry. It never interrupts in-flight work; the
/// runner checks [`LeaseLock::ensure_valid`] itself.
pub struct RenewalDaemon {
    cancel_token: CancellationToken,
    handle: JoinHandle<()>,
    _cancel_on_drop: DropGuard,
}

impl RenewalDaemon {
    /// Spawn the renewal loop for `lock`.
    pub fn start(lock: Arc<LeaseLock>) -> Self {
        let cancel_token = CancellationToken::new();
        let token = cancel_token.clone();

        let handle = tokio::spawn(async move {
            debug!(key = %lock.key(), "Lock renewal daemon started");
            loop {
                let remaining = lock.remaining();
                if remaining.is_zero() {
                    info!(key = %lock.key(), "Lease expired, lock renewal daemon stopping");
                    break;
                }
                let interval = (remaining / 3).max(MIN_RENEWAL_INTERVAL);

                tokio::select! {
                    biased;

                    _ = token.cancelled() => {
                        debug!(key = %lock.key(), "Lock renewal daemon cancelled");
                        break;
                    }

                    _ = tokio::time::sleep(interval) => {
                        match lock.extend().await {
                            Ok(true) => {}
                            Ok(false) => {
                                warn!(key = %lock.key(), "Lease was not renewed");
                            }
                            Err(e) => {
                                warn!(key = %lock.key(), error = %e, "Failed to extend lease, will retry");
                            }
                        }
                    }
                }
            }
        });

        Self {
            _cancel_on_drop: cancel_token.clone().drop_guard(),
            cancel_token,
            handle,
        }
    }

    /// Whether the loop has ended (cancelled or lease expired).
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Cancel the loop and wait for it to exit.
    pub async fn stop(self) {
        self.cancel_token.cancel();
        if let Err(e) = self.handle.await {
            warn!(error = %e, "Lock renewal daemon ended abnormally");
        }
    }
}
