//! Exclusive lock coordinator
//!
//! Tracks this handle's belief about single-writer ownership and reconciles
//! it with the store. The in-process state only ever changes through
//! [`transition`]; global ownership exists only once the store confirmed it.
//!
//! ```text
//!   Unlocked ──Request──▶ LockRequested ──Granted──▶ Owned
//!      ▲                       │                      │  │
//!      └───────Denied──────────┘                      │  └─Lost──▶ Unlocked
//!      ▲                                         Release
//!      │                                              ▼
//!      └──────────Released─────────────────────── Releasing ──ReleaseFailed──▶ Owned
//! ```

use crate::handle::ImageCtx;
use imgplane_common::{Error, Features, LockInfo, LockMode, LockPolicy, Locker, PoolId, Result};
use imgplane_store::MetadataStore;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Tag marking the lock as managed by this coordinator
pub const LOCK_TAG: &str = "internal";

/// In-process lock state
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockState {
    Unlocked,
    LockRequested,
    Owned,
    Releasing,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum LockEvent {
    Request,
    Granted,
    Denied,
    Release,
    Released,
    ReleaseFailed,
    Lost,
}

/// Result of breaking another client's lock
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BreakOutcome {
    /// An active holder was removed
    Broken,
    /// Nobody held the lock any more
    AlreadyReleased,
}

fn transition(state: LockState, event: LockEvent) -> Result<LockState> {
    use LockEvent::{Denied, Granted, Lost, Release, ReleaseFailed, Released, Request};
    use LockState::{LockRequested, Owned, Releasing, Unlocked};

    match (state, event) {
        (Unlocked, Request) => Ok(LockRequested),
        (LockRequested, Granted) => Ok(Owned),
        (LockRequested, Denied) | (Releasing, Released) | (Owned, Lost) => Ok(Unlocked),
        (Owned, Release) => Ok(Releasing),
        (Releasing, ReleaseFailed) => Ok(Owned),
        (Unlocked, Release) => Err(Error::invalid_argument("not lock owner")),
        (state, event) => Err(Error::busy(format!(
            "lock transition {event:?} not allowed while {state:?}"
        ))),
    }
}

/// Ownership state of the exclusive lock for one handle
pub struct ExclusiveLock {
    state: Mutex<LockState>,
    cookie: String,
    requests_blocked: AtomicBool,
    /// Serializes acquire and release attempts of this handle
    gate: tokio::sync::Mutex<()>,
}

impl ExclusiveLock {
    pub(crate) fn new(cookie: String) -> Self {
        Self {
            state: Mutex::new(LockState::Unlocked),
            cookie,
            requests_blocked: AtomicBool::new(false),
            gate: tokio::sync::Mutex::new(()),
        }
    }

    #[must_use]
    pub fn state(&self) -> LockState {
        *self.state.lock()
    }

    #[must_use]
    pub fn cookie(&self) -> &str {
        &self.cookie
    }

    fn apply(&self, event: LockEvent) -> Result<LockState> {
        let mut state = self.state.lock();
        *state = transition(*state, event)?;
        Ok(*state)
    }

    /// `Ok(false)` means another client owns the lock, a normal outcome
    pub(crate) async fn try_acquire(
        &self,
        store: &dyn MetadataStore,
        pool: PoolId,
        oid: &str,
    ) -> Result<bool> {
        let _gate = self.gate.lock().await;
        if self.state() == LockState::Owned {
            // The store may have fenced us since we last looked
            match store
                .lock_assert(pool, oid, LockMode::Exclusive, &self.cookie, LOCK_TAG)
                .await
            {
                Ok(()) => return Ok(true),
                Err(e) if e.is_retryable() => return Err(e),
                Err(e) => {
                    warn!("Cached ownership of {oid} no longer valid: {e}");
                    self.apply(LockEvent::Lost)?;
                }
            }
        }

        self.apply(LockEvent::Request)?;
        match store
            .lock_acquire(pool, oid, LockMode::Exclusive, &self.cookie, LOCK_TAG)
            .await
        {
            Ok(()) | Err(Error::AlreadyExists(_)) => {
                self.apply(LockEvent::Granted)?;
                info!("Acquired exclusive lock on {pool}/{oid}");
                Ok(true)
            }
            Err(Error::Busy(msg)) => {
                self.apply(LockEvent::Denied)?;
                debug!("Exclusive lock on {oid} held elsewhere: {msg}");
                Ok(false)
            }
            Err(e) => {
                self.apply(LockEvent::Denied)?;
                Err(e)
            }
        }
    }

    /// Release ownership, retrying once on a transient store failure
    pub(crate) async fn release(
        &self,
        store: &dyn MetadataStore,
        pool: PoolId,
        oid: &str,
        retry_delay: Duration,
    ) -> Result<()> {
        let _gate = self.gate.lock().await;
        self.apply(LockEvent::Release)?;

        let mut result = store.lock_release(pool, oid, &self.cookie).await;
        if let Err(e) = &result {
            if e.is_retryable() {
                warn!("Releasing lock on {oid} failed, retrying once: {e}");
                tokio::time::sleep(retry_delay).await;
                result = store.lock_release(pool, oid, &self.cookie).await;
            }
        }

        match result {
            Ok(()) => {
                self.apply(LockEvent::Released)?;
                info!("Released exclusive lock on {pool}/{oid}");
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                self.apply(LockEvent::Released)?;
                warn!("Exclusive lock on {oid} was already gone at release");
                Ok(())
            }
            Err(e) => {
                self.apply(LockEvent::ReleaseFailed)?;
                Err(e)
            }
        }
    }

    /// Drop local ownership without reaching the store
    pub(crate) fn mark_released(&self) {
        *self.state.lock() = LockState::Unlocked;
    }

    /// Re-validate cached ownership against the store
    pub(crate) async fn is_owner(
        &self,
        store: &dyn MetadataStore,
        pool: PoolId,
        oid: &str,
    ) -> Result<bool> {
        if self.state() != LockState::Owned {
            return Ok(false);
        }
        match store
            .lock_assert(pool, oid, LockMode::Exclusive, &self.cookie, LOCK_TAG)
            .await
        {
            Ok(()) => Ok(true),
            Err(e) if e.is_retryable() => Err(e),
            Err(e) => {
                debug!("Lost exclusive lock on {oid}: {e}");
                if let Err(e) = self.apply(LockEvent::Lost) {
                    debug!("Lock state moved on concurrently: {e}");
                }
                Ok(false)
            }
        }
    }

    pub fn block_requests(&self) {
        self.requests_blocked.store(true, Ordering::SeqCst);
    }

    pub fn unblock_requests(&self) {
        self.requests_blocked.store(false, Ordering::SeqCst);
    }

    #[must_use]
    pub fn requests_blocked(&self) -> bool {
        self.requests_blocked.load(Ordering::SeqCst)
    }
}

pub(crate) fn retry_delay(ictx: &ImageCtx) -> Duration {
    Duration::from_millis(ictx.context().config().lock.release_retry_delay_ms)
}

fn managed_owner(info: &LockInfo) -> Option<&Locker> {
    if info.exclusive && info.tag == LOCK_TAG {
        info.lockers.first()
    } else {
        None
    }
}

fn require_exclusive_lock_feature(ictx: &ImageCtx) -> Result<()> {
    if ictx.metadata().features.contains(Features::EXCLUSIVE_LOCK) {
        Ok(())
    } else {
        Err(Error::invalid_argument("exclusive-lock feature is not enabled"))
    }
}

/// Make sure this handle owns the lock before a mutating operation, asking
/// for it when the handle's policy allows
pub(crate) async fn ensure_owner(ictx: &ImageCtx) -> Result<()> {
    if !ictx.metadata().features.contains(Features::EXCLUSIVE_LOCK) {
        return Ok(());
    }
    let store = ictx.context().store();
    let lock = ictx.exclusive_lock();
    if lock.is_owner(store, ictx.pool(), ictx.header_oid()).await? {
        return Ok(());
    }
    match ictx.lock_policy() {
        LockPolicy::Manual => Err(Error::ReadOnly("exclusive lock not held".into())),
        LockPolicy::Auto => {
            if lock.try_acquire(store, ictx.pool(), ictx.header_oid()).await? {
                Ok(())
            } else {
                Err(Error::ReadOnly(
                    "exclusive lock held by another client".into(),
                ))
            }
        }
    }
}

/// Whether this handle owns the lock, confirmed with the store
pub async fn is_exclusive_lock_owner(ictx: &ImageCtx) -> Result<bool> {
    ictx.refresh_if_required().await?;
    ictx.exclusive_lock()
        .is_owner(ictx.context().store(), ictx.pool(), ictx.header_oid())
        .await
}

/// Explicitly take the lock; the handle stops requesting it on its own
pub async fn lock_acquire(ictx: &ImageCtx, mode: LockMode) -> Result<()> {
    if mode != LockMode::Exclusive {
        return Err(Error::not_supported("only exclusive lock mode is supported"));
    }
    ictx.refresh_if_required().await?;
    let _owner = ictx.owner_lock().write().await;
    require_exclusive_lock_feature(ictx)?;
    ictx.set_lock_policy(LockPolicy::Manual);

    let store = ictx.context().store();
    let lock = ictx.exclusive_lock();
    if lock.is_owner(store, ictx.pool(), ictx.header_oid()).await? {
        return Ok(());
    }
    if lock.try_acquire(store, ictx.pool(), ictx.header_oid()).await? {
        Ok(())
    } else {
        Err(Error::ReadOnly("exclusive lock owned by another client".into()))
    }
}

/// Give up an explicitly acquired lock
pub async fn lock_release(ictx: &ImageCtx) -> Result<()> {
    ictx.refresh_if_required().await?;
    let _owner = ictx.owner_lock().write().await;
    require_exclusive_lock_feature(ictx)?;

    let store = ictx.context().store();
    let lock = ictx.exclusive_lock();
    if !lock.is_owner(store, ictx.pool(), ictx.header_oid()).await? {
        return Err(Error::invalid_argument("not lock owner"));
    }
    lock.release(store, ictx.pool(), ictx.header_oid(), retry_delay(ictx))
        .await
}

/// Current owner of the managed exclusive lock
pub async fn lock_get_owners(ictx: &ImageCtx) -> Result<(LockMode, Vec<Locker>)> {
    ictx.refresh_if_required().await?;
    require_exclusive_lock_feature(ictx)?;
    let info = ictx
        .context()
        .store()
        .lock_info(ictx.pool(), ictx.header_oid())
        .await?;
    match managed_owner(&info) {
        Some(owner) => Ok((LockMode::Exclusive, vec![owner.clone()])),
        None => Err(Error::LockNotFound(ictx.header_oid().to_string())),
    }
}

/// Break the managed lock held by `owner`. Fails with an owner mismatch if
/// someone else holds it now.
pub async fn lock_break(ictx: &ImageCtx, mode: LockMode, owner: &Locker) -> Result<BreakOutcome> {
    if mode != LockMode::Exclusive {
        return Err(Error::not_supported("only exclusive lock mode is supported"));
    }
    ictx.refresh_if_required().await?;
    require_exclusive_lock_feature(ictx)?;

    let ctx = ictx.context();
    let store = ctx.store();
    let info = store.lock_info(ictx.pool(), ictx.header_oid()).await?;
    let Some(current) = managed_owner(&info) else {
        info!("Exclusive lock on {} already released", ictx.name());
        return Ok(BreakOutcome::AlreadyReleased);
    };
    if current != owner {
        return Err(Error::OwnerMismatch {
            expected: owner.to_string(),
            actual: current.to_string(),
        });
    }

    let config = &ctx.config().lock;
    if config.blacklist_on_break_lock {
        store
            .blacklist_add(&current.address, config.blacklist_expire_seconds)
            .await?;
    }
    match store
        .lock_break(ictx.pool(), ictx.header_oid(), &current.client, &current.cookie)
        .await
    {
        Ok(()) => {
            info!("Broke exclusive lock on {} held by {current}", ictx.name());
            Ok(BreakOutcome::Broken)
        }
        Err(e) if e.is_not_found() => Ok(BreakOutcome::AlreadyReleased),
        Err(e) => Err(e),
    }
}

/// Hand the lock over to a peer that asked for it, unless requests are
/// blocked for a primary/non-primary transition
pub async fn release_for_peer(ictx: &ImageCtx) -> Result<()> {
    let lock = ictx.exclusive_lock();
    if lock.requests_blocked() {
        return Err(Error::busy("lock requests are blocked"));
    }
    let _owner = ictx.owner_lock().write().await;
    lock.release(
        ictx.context().store(),
        ictx.pool(),
        ictx.header_oid(),
        retry_delay(ictx),
    )
    .await
}

// ── Advisory locks ──

/// Every holder of the header lock, managed or advisory
pub async fn list_lockers(ictx: &ImageCtx) -> Result<LockInfo> {
    ictx.context()
        .store()
        .lock_info(ictx.pool(), ictx.header_oid())
        .await
}

/// Take an advisory lock under a caller-chosen cookie
pub async fn lock(ictx: &ImageCtx, exclusive: bool, cookie: &str, tag: &str) -> Result<()> {
    let mode = if exclusive {
        LockMode::Exclusive
    } else {
        LockMode::Shared
    };
    ictx.context()
        .store()
        .lock_acquire(ictx.pool(), ictx.header_oid(), mode, cookie, tag)
        .await
}

pub async fn unlock(ictx: &ImageCtx, cookie: &str) -> Result<()> {
    ictx.context()
        .store()
        .lock_release(ictx.pool(), ictx.header_oid(), cookie)
        .await
}

/// Remove another client's advisory lock, fencing it first when configured
pub async fn break_lock(ictx: &ImageCtx, client: &str, cookie: &str) -> Result<()> {
    let ctx = ictx.context();
    let store = ctx.store();
    let config = &ctx.config().lock;
    if config.blacklist_on_break_lock {
        let info = store.lock_info(ictx.pool(), ictx.header_oid()).await?;
        let holder = info
            .lockers
            .iter()
            .find(|l| l.client == client && l.cookie == cookie)
            .ok_or_else(|| Error::LockNotFound(ictx.header_oid().to_string()))?;
        store
            .blacklist_add(&holder.address, config.blacklist_expire_seconds)
            .await?;
    }
    store
        .lock_break(ictx.pool(), ictx.header_oid(), client, cookie)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::{self, CreateOptions};
    use crate::io;
    use crate::test_support::{connect, open, setup};
    use imgplane_common::Config;

    #[test]
    fn test_transition_table() {
        use LockEvent::*;
        use LockState::*;
        assert_eq!(transition(Unlocked, Request), Ok(LockRequested));
        assert_eq!(transition(LockRequested, Granted), Ok(Owned));
        assert_eq!(transition(LockRequested, Denied), Ok(Unlocked));
        assert_eq!(transition(Owned, Release), Ok(Releasing));
        assert_eq!(transition(Releasing, ReleaseFailed), Ok(Owned));
        assert_eq!(transition(Releasing, Released), Ok(Unlocked));
        assert_eq!(transition(Owned, Lost), Ok(Unlocked));
        assert!(matches!(transition(LockRequested, Request), Err(Error::Busy(_))));
        assert!(matches!(transition(Owned, Request), Err(Error::Busy(_))));
        assert!(matches!(
            transition(Unlocked, Release),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn test_concurrent_acquire_is_exclusive() {
        let (cluster, ctx_a, pool) = setup();
        image::create(&ctx_a, pool, "img", 1 << 24, &CreateOptions::default())
            .await
            .unwrap();
        let ctx_b = connect(&cluster, Config::default());
        let a = open(&ctx_a, pool, "img").await;
        let b = open(&ctx_b, pool, "img").await;

        let (ra, rb) = tokio::join!(
            lock_acquire(&a, LockMode::Exclusive),
            lock_acquire(&b, LockMode::Exclusive)
        );
        assert!(ra.is_ok() ^ rb.is_ok(), "exactly one acquire must win");
        let loser = if ra.is_ok() { rb } else { ra };
        assert!(matches!(loser, Err(Error::ReadOnly(_))));

        let a_owns = is_exclusive_lock_owner(&a).await.unwrap();
        let b_owns = is_exclusive_lock_owner(&b).await.unwrap();
        assert!(a_owns ^ b_owns);
    }

    #[tokio::test]
    async fn test_stale_owner_break_is_rejected() {
        let (cluster, ctx_a, pool) = setup();
        image::create(&ctx_a, pool, "img", 1 << 24, &CreateOptions::default())
            .await
            .unwrap();
        let ctx_b = connect(&cluster, Config::default());
        let ctx_c = connect(&cluster, Config::default());
        let a = open(&ctx_a, pool, "img").await;
        let b = open(&ctx_b, pool, "img").await;
        let c = open(&ctx_c, pool, "img").await;

        lock_acquire(&a, LockMode::Exclusive).await.unwrap();
        let (_, owners) = lock_get_owners(&c).await.unwrap();
        let stale = owners[0].clone();

        // a hands over to b; c still remembers a
        lock_release(&a).await.unwrap();
        lock_acquire(&b, LockMode::Exclusive).await.unwrap();

        let err = lock_break(&c, LockMode::Exclusive, &stale).await.unwrap_err();
        assert_eq!(err.condition(), "owner-mismatch");
        assert!(is_exclusive_lock_owner(&b).await.unwrap());
    }

    #[tokio::test]
    async fn test_break_fences_owner_and_vacant_break_is_distinct() {
        let (cluster, ctx_a, pool) = setup();
        image::create(&ctx_a, pool, "img", 1 << 24, &CreateOptions::default())
            .await
            .unwrap();
        let ctx_b = connect(&cluster, Config::default());
        let a = open(&ctx_a, pool, "img").await;
        let b = open(&ctx_b, pool, "img").await;

        lock_acquire(&a, LockMode::Exclusive).await.unwrap();
        let (_, owners) = lock_get_owners(&b).await.unwrap();
        assert_eq!(
            lock_break(&b, LockMode::Exclusive, &owners[0]).await.unwrap(),
            BreakOutcome::Broken
        );
        // The old owner is blacklisted and can no longer prove ownership
        assert!(!matches!(is_exclusive_lock_owner(&a).await, Ok(true)));
        assert!(matches!(
            ctx_a.store().lock_info(pool, a.header_oid()).await,
            Err(Error::Blacklisted)
        ));

        assert_eq!(
            lock_break(&b, LockMode::Exclusive, &owners[0]).await.unwrap(),
            BreakOutcome::AlreadyReleased
        );
    }

    #[tokio::test]
    async fn test_release_retries_once_on_transient_failure() {
        let (cluster, ctx, pool) = setup();
        image::create(&ctx, pool, "img", 1 << 24, &CreateOptions::default())
            .await
            .unwrap();
        let img = open(&ctx, pool, "img").await;
        lock_acquire(&img, LockMode::Exclusive).await.unwrap();

        cluster.inject_fault("lock_release", 1, Error::Timeout);
        lock_release(&img).await.unwrap();
        assert_eq!(img.exclusive_lock().state(), LockState::Unlocked);

        lock_acquire(&img, LockMode::Exclusive).await.unwrap();
        cluster.inject_fault("lock_release", 1, Error::Timeout);
        cluster.inject_fault("lock_release", 2, Error::Timeout);
        assert_eq!(lock_release(&img).await, Err(Error::Timeout));
        assert_eq!(img.exclusive_lock().state(), LockState::Owned);
    }

    #[tokio::test]
    async fn test_release_requires_ownership_and_shared_unsupported() {
        let (_cluster, ctx, pool) = setup();
        image::create(&ctx, pool, "img", 1 << 24, &CreateOptions::default())
            .await
            .unwrap();
        let img = open(&ctx, pool, "img").await;
        assert!(matches!(
            lock_release(&img).await,
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            lock_acquire(&img, LockMode::Shared).await,
            Err(Error::NotSupported(_))
        ));
        assert!(lock_get_owners(&img).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_manual_policy_blocks_writes_until_acquired() {
        let (_cluster, ctx, pool) = setup();
        image::create(&ctx, pool, "img", 1 << 24, &CreateOptions::default())
            .await
            .unwrap();
        let img = open(&ctx, pool, "img").await;
        img.set_lock_policy(LockPolicy::Manual);
        assert!(matches!(ensure_owner(&img).await, Err(Error::ReadOnly(_))));

        img.set_lock_policy(LockPolicy::Auto);
        ensure_owner(&img).await.unwrap();
        assert_eq!(img.exclusive_lock().state(), LockState::Owned);
    }

    #[tokio::test]
    async fn test_blocked_requests_refuse_peer_handoff() {
        let (_cluster, ctx, pool) = setup();
        image::create(&ctx, pool, "img", 1 << 24, &CreateOptions::default())
            .await
            .unwrap();
        let img = open(&ctx, pool, "img").await;
        lock_acquire(&img, LockMode::Exclusive).await.unwrap();
        img.exclusive_lock().block_requests();
        assert!(matches!(release_for_peer(&img).await, Err(Error::Busy(_))));
        img.exclusive_lock().unblock_requests();
        release_for_peer(&img).await.unwrap();
    }

    #[tokio::test]
    async fn test_advisory_lockers() {
        let (cluster, ctx_a, pool) = setup();
        image::create(&ctx_a, pool, "img", 1 << 24, &CreateOptions::default())
            .await
            .unwrap();
        let ctx_b = connect(&cluster, Config::default());
        let a = open(&ctx_a, pool, "img").await;
        let b = open(&ctx_b, pool, "img").await;

        lock(&a, false, "c1", "backup").await.unwrap();
        lock(&b, false, "c2", "backup").await.unwrap();
        assert!(matches!(lock(&b, true, "c3", "x").await, Err(Error::Busy(_))));
        let info = list_lockers(&a).await.unwrap();
        assert_eq!(info.lockers.len(), 2);
        assert!(!info.exclusive);

        break_lock(&b, &ctx_a.store().client_name(), "c1").await.unwrap();
        // Breaking fences the former holder's client
        assert!(matches!(list_lockers(&a).await, Err(Error::Blacklisted)));
        unlock(&b, "c2").await.unwrap();
        assert!(list_lockers(&b).await.unwrap().lockers.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_writes_on_one_handle_share_acquisition() {
        let (_cluster, ctx, pool) = setup();
        image::create(&ctx, pool, "img", 1 << 24, &CreateOptions::default())
            .await
            .unwrap();
        let img = open(&ctx, pool, "img").await;
        assert_eq!(img.exclusive_lock().state(), LockState::Unlocked);

        let (ra, rb) = tokio::join!(
            io::write(&img, 0, b"aaaa"),
            io::write(&img, 1 << 22, b"bbbb")
        );
        assert_eq!(ra.unwrap(), 4);
        assert_eq!(rb.unwrap(), 4);
        assert_eq!(img.exclusive_lock().state(), LockState::Owned);

        assert_eq!(io::read(&img, 0, 4).await.unwrap(), b"aaaa");
        assert_eq!(io::read(&img, 1 << 22, 4).await.unwrap(), b"bbbb");
    }

    #[tokio::test]
    async fn test_close_after_lock_broken_releases_handle() {
        let (cluster, ctx_a, pool) = setup();
        image::create(&ctx_a, pool, "img", 1 << 24, &CreateOptions::default())
            .await
            .unwrap();
        let ctx_b = connect(&cluster, Config::default());
        let a = open(&ctx_a, pool, "img").await;
        let b = open(&ctx_b, pool, "img").await;

        lock_acquire(&a, LockMode::Exclusive).await.unwrap();
        let (_, owners) = lock_get_owners(&b).await.unwrap();
        lock_break(&b, LockMode::Exclusive, &owners[0]).await.unwrap();

        assert!(!ctx_a.registry().is_empty());
        image::close(a).await.unwrap();
        assert!(ctx_a.registry().is_empty());
        assert!(lock_get_owners(&b).await.unwrap_err().is_not_found());
    }
}
