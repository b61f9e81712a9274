//! Signed-in user tracking and user-scoped refresh.
//!
//! The identity provider is external; the engine only needs to know who is
//! signed in and to hear when that changes. Each change either refreshes the
//! user's own slice or, on sign-out, drops it. Public data is never touched.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::db::models::{Identity, UserSlice};
use crate::error::SyncError;
use crate::remote::RemoteSource;
use crate::sync::clock::Clock;
use crate::sync::single_flight::SingleFlight;
use crate::sync::store::SnapshotStore;

/// Source of "who is signed in" and change notifications.
pub trait IdentityProvider: Send + Sync {
    fn current_identity(&self) -> Option<Identity>;

    /// Receiver that observes every identity change from now on
    fn subscribe(&self) -> watch::Receiver<Option<Identity>>;

    fn sign_out(&self);
}

/// Identity held in-process, set by the status API or at startup.
pub struct LocalIdentityProvider {
    tx: watch::Sender<Option<Identity>>,
}

impl LocalIdentityProvider {
    pub fn new(initial: Option<Identity>) -> Self {
        let (tx, _rx) = watch::channel(initial);
        LocalIdentityProvider { tx }
    }

    pub fn sign_in(&self, identity: Identity) {
        info!(user = %identity.user_id, "Signed in");
        self.tx.send_replace(Some(identity));
    }
}

impl IdentityProvider for LocalIdentityProvider {
    fn current_identity(&self) -> Option<Identity> {
        self.tx.borrow().clone()
    }

    fn subscribe(&self) -> watch::Receiver<Option<Identity>> {
        self.tx.subscribe()
    }

    fn sign_out(&self) {
        if self.tx.send_replace(None).is_some() {
            info!("Signed out");
        }
    }
}

pub struct IdentityCoordinator {
    remote: Arc<dyn RemoteSource>,
    store: SnapshotStore,
    clock: Arc<dyn Clock>,
    /// User the latest change event named
    current: Mutex<Option<String>>,
    refreshes: SingleFlight<String, Result<(), SyncError>>,
}

impl IdentityCoordinator {
    pub fn new(remote: Arc<dyn RemoteSource>, store: SnapshotStore, clock: Arc<dyn Clock>) -> Self {
        IdentityCoordinator {
            remote,
            store,
            clock,
            current: Mutex::new(None),
            refreshes: SingleFlight::new(),
        }
    }

    fn current(&self) -> MutexGuard<'_, Option<String>> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// React to the provider reporting `identity`. A signed-in user gets
    /// their roster slice refreshed, with duplicate events for the same user
    /// sharing one refresh. `None` clears user data.
    pub async fn on_identity_change(
        self: &Arc<Self>,
        identity: Option<Identity>,
    ) -> Result<(), SyncError> {
        let Some(identity) = identity else {
            *self.current() = None;
            if self.store.clear_user() {
                info!("User data cleared");
            }
            return Ok(());
        };

        let user_id = identity.user_id;
        {
            let mut current = self.current();
            if current.as_deref() != Some(user_id.as_str()) {
                // a different user's slice must not linger while the new one loads
                if self
                    .store
                    .snapshot()
                    .user
                    .as_ref()
                    .is_some_and(|u| u.user_id != user_id)
                {
                    self.store.clear_user();
                }
                *current = Some(user_id.clone());
            }
        }

        let this = Arc::clone(self);
        let key = user_id.clone();
        self.refreshes
            .run(key, move || async move { this.refresh_user(user_id).await })
            .await
    }

    async fn refresh_user(&self, user_id: String) -> Result<(), SyncError> {
        debug!(user = %user_id, "Refreshing user rosters");
        let rosters = match self.remote.get_rosters().await {
            Ok(r) => r,
            Err(e) => {
                warn!(user = %user_id, "User roster refresh failed: {}", e);
                return Err(e);
            }
        };
        let mine: Vec<_> = rosters.into_iter().filter(|r| r.owner_id == user_id).collect();

        let current = self.current();
        if current.as_deref() != Some(user_id.as_str()) {
            debug!(user = %user_id, "Identity changed during refresh; discarding result");
            return Ok(());
        }
        info!(user = %user_id, rosters = mine.len(), "User data refreshed");
        self.store.set_user(UserSlice {
            user_id,
            rosters: mine,
            refreshed_at: self.clock.now(),
        });
        drop(current);
        Ok(())
    }
}
