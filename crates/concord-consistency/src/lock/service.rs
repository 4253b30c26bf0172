//! Coordinator-side lock registry
//!
//! The lock table lives only on the coordinator. A call sorts its targets
//! into canonical order, grants them one at a time against a shared wait
//! budget, and rolls back everything it took if any target fails.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use concord_common::{ClassId, LockTarget, NodeId, Result, Serial};

use super::hierarchy::ClassHierarchy;
use super::model::*;

/// Answers whether a target is unchanged since a serial
#[async_trait]
pub trait CurrencyCheck: Send + Sync {
    async fn is_current(&self, target: &LockTarget, serial: Serial) -> Result<bool>;
}

#[derive(Default)]
struct LockTable {
    entries: HashMap<LockTarget, Vec<LockEntry>>,
    /// Locked targets grouped by their class
    by_class: HashMap<ClassId, HashSet<LockTarget>>,
}

impl LockTable {
    fn entries_for(&self, target: &LockTarget) -> &[LockEntry] {
        self.entries.get(target).map(Vec::as_slice).unwrap_or(&[])
    }

    fn insert(&mut self, entry: LockEntry) {
        let target = entry.target.clone();
        let slot = self.entries.entry(target.clone()).or_default();
        if slot.is_empty() {
            self.by_class
                .entry(target.class_id().clone())
                .or_default()
                .insert(target);
        }
        slot.push(entry);
    }

    /// Remove entries matching `pred` on one target. Returns how many went.
    fn remove_where(&mut self, target: &LockTarget, pred: impl Fn(&LockEntry) -> bool) -> usize {
        let Some(slot) = self.entries.get_mut(target) else {
            return 0;
        };
        let before = slot.len();
        slot.retain(|e| !pred(e));
        let removed = before - slot.len();

        if slot.is_empty() {
            self.entries.remove(target);
            let class = target.class_id();
            if let Some(set) = self.by_class.get_mut(class) {
                set.remove(target);
                if set.is_empty() {
                    self.by_class.remove(class);
                }
            }
        }
        removed
    }

    fn entry_count(&self) -> usize {
        self.entries.values().map(Vec::len).sum()
    }
}

#[derive(Default)]
struct LockStatsCollector {
    total_grants: AtomicU64,
    total_conflicts: AtomicU64,
    total_timeouts: AtomicU64,
    total_stale: AtomicU64,
    total_releases: AtomicU64,
}

/// What one target contributed to a call, so it can be undone
struct Taken {
    target: LockTarget,
    /// `None` if the entry was created by this call, otherwise the
    /// read-only flag it had before the re-entry
    reentered_from: Option<bool>,
}

/// Counts a blocked call for as long as it waits
struct WaitGuard<'a>(&'a AtomicUsize);

impl<'a> WaitGuard<'a> {
    fn enter(waiters: &'a AtomicUsize) -> Self {
        waiters.fetch_add(1, Ordering::Relaxed);
        Self(waiters)
    }
}

impl Drop for WaitGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

enum Attempt {
    Taken(Taken),
    Blocked(LockGrant),
}

pub struct LockRegistry {
    hierarchy: Arc<ClassHierarchy>,
    currency: Option<Arc<dyn CurrencyCheck>>,
    table: Mutex<LockTable>,
    released: Notify,
    waiters: AtomicUsize,
    stats: LockStatsCollector,
}

impl LockRegistry {
    pub fn new(hierarchy: Arc<ClassHierarchy>) -> Self {
        Self {
            hierarchy,
            currency: None,
            table: Mutex::new(LockTable::default()),
            released: Notify::new(),
            waiters: AtomicUsize::new(0),
            stats: LockStatsCollector::default(),
        }
    }

    /// Attach the currency check consulted by `ensure_current` requests
    pub fn with_currency_check(mut self, currency: Arc<dyn CurrencyCheck>) -> Self {
        self.currency = Some(currency);
        self
    }

    pub fn hierarchy(&self) -> &Arc<ClassHierarchy> {
        &self.hierarchy
    }

    /// Acquire every target of the request, or none of them
    pub async fn lock(&self, request: LockRequest) -> Result<LockGrant> {
        if self.hierarchy.learn(&request.lineage) {
            debug!("Learned class declarations from {}", request.owner);
        }
        let targets = request.canonical_targets();

        let deadline = match request.wait {
            LockWait::Timeout(budget) => Some(Instant::now() + budget),
            _ => None,
        };

        let mut taken: Vec<Taken> = Vec::with_capacity(targets.len());
        for target in &targets {
            match self.acquire_target(target, &request, deadline).await {
                Attempt::Taken(step) => taken.push(step),
                Attempt::Blocked(grant) => {
                    self.revert(&request.owner, &taken);
                    return Ok(grant);
                }
            }
        }

        // Entries are already registered, so concurrent callers conflict
        // with them while the currency check runs.
        if let (Some(serial), Some(currency)) = (request.ensure_current, &self.currency) {
            for target in &targets {
                let current = match currency.is_current(target, serial).await {
                    Ok(current) => current,
                    Err(err) => {
                        self.revert(&request.owner, &taken);
                        return Err(err);
                    }
                };
                if !current {
                    debug!(
                        "Lock on {} for {} is stale as of {}",
                        target, request.owner, serial
                    );
                    self.revert(&request.owner, &taken);
                    self.stats.total_stale.fetch_add(1, Ordering::Relaxed);
                    metrics::counter!("concord_lock_stale_total").increment(1);
                    return Ok(LockGrant::Stale);
                }
            }
        }

        self.stats.total_grants.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("concord_lock_grants_total").increment(1);
        debug!("Granted {} targets to {}", targets.len(), request.owner);
        Ok(LockGrant::Granted)
    }

    async fn acquire_target(
        &self,
        target: &LockTarget,
        request: &LockRequest,
        deadline: Option<Instant>,
    ) -> Attempt {
        loop {
            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let conflict = match self.try_grant(target, request) {
                Ok(taken) => return Attempt::Taken(taken),
                Err(conflict) => conflict,
            };

            match request.wait {
                LockWait::NoWait => {
                    self.record_conflict(target, request, &conflict);
                    return Attempt::Blocked(conflict);
                }
                LockWait::Forever => {
                    let _waiting = WaitGuard::enter(&self.waiters);
                    notified.as_mut().await;
                }
                LockWait::Timeout(_) => {
                    let Some(deadline) = deadline else {
                        return Attempt::Blocked(conflict);
                    };
                    let woken = {
                        let _waiting = WaitGuard::enter(&self.waiters);
                        tokio::time::timeout_at(deadline, notified.as_mut()).await
                    };

                    if woken.is_err() {
                        // One last look: a release may have raced the deadline
                        return match self.try_grant(target, request) {
                            Ok(taken) => Attempt::Taken(taken),
                            Err(conflict) => {
                                self.stats.total_timeouts.fetch_add(1, Ordering::Relaxed);
                                metrics::counter!("concord_lock_timeouts_total").increment(1);
                                self.record_conflict(target, request, &conflict);
                                Attempt::Blocked(conflict)
                            }
                        };
                    }
                }
            }
        }
    }

    fn record_conflict(&self, target: &LockTarget, request: &LockRequest, conflict: &LockGrant) {
        self.stats.total_conflicts.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("concord_lock_conflicts_total").increment(1);
        if let LockGrant::Conflict { owner, .. } = conflict {
            debug!(
                "Lock on {} for {} conflicts with {}",
                target, request.owner, owner
            );
        }
    }

    /// Check and register one target atomically under the table mutex
    fn try_grant(
        &self,
        target: &LockTarget,
        request: &LockRequest,
    ) -> std::result::Result<Taken, LockGrant> {
        let mut table = self.table.lock();

        if let Some(entry) = self.find_conflict(&table, target, &request.owner, request.read_only)
        {
            return Err(LockGrant::Conflict {
                session_info: entry.session_info.clone(),
                owner: entry.owner,
                targets: vec![entry.target.clone()],
            });
        }

        let reentry = table
            .entries
            .get_mut(target)
            .and_then(|slot| slot.iter_mut().find(|e| e.owner == request.owner));

        let taken = match reentry {
            Some(entry) => {
                let previous = entry.read_only;
                entry.depth += 1;
                entry.read_only = entry.read_only && request.read_only;
                Taken {
                    target: target.clone(),
                    reentered_from: Some(previous),
                }
            }
            None => {
                table.insert(LockEntry::new(
                    target.clone(),
                    request.owner,
                    request.read_only,
                    request.session_info.clone(),
                ));
                Taken {
                    target: target.clone(),
                    reentered_from: None,
                }
            }
        };

        metrics::gauge!("concord_lock_entries").set(table.entry_count() as f64);
        Ok(taken)
    }

    /// First entry of another owner that blocks `target`.
    ///
    /// Class targets see class locks anywhere in their closure and object
    /// locks on the class or its descendants. Object targets see their own
    /// entries and class locks on their class or its ancestors.
    fn find_conflict<'a>(
        &self,
        table: &'a LockTable,
        target: &LockTarget,
        owner: &LockOwner,
        read_only: bool,
    ) -> Option<&'a LockEntry> {
        let blocking = |t: &LockTarget| {
            table
                .entries_for(t)
                .iter()
                .find(|e| e.conflicts_with(owner, read_only))
        };

        match target {
            LockTarget::Class(class) => {
                let ancestors = self.hierarchy.ancestors(class);
                let descendants = self.hierarchy.descendants(class);

                let subtree = std::iter::once(class).chain(descendants.iter());
                for k in subtree {
                    let Some(locked) = table.by_class.get(k) else {
                        continue;
                    };
                    if let Some(entry) = locked.iter().find_map(|t| blocking(t)) {
                        return Some(entry);
                    }
                }
                ancestors
                    .iter()
                    .find_map(|k| blocking(&LockTarget::Class(k.clone())))
            }
            LockTarget::Object(object) => {
                if let Some(entry) = blocking(target) {
                    return Some(entry);
                }
                let ancestors = self.hierarchy.ancestors(&object.class);
                std::iter::once(&object.class)
                    .chain(ancestors.iter())
                    .find_map(|k| blocking(&LockTarget::Class(k.clone())))
            }
        }
    }

    /// Undo the steps of a failed call in reverse order
    fn revert(&self, owner: &LockOwner, taken: &[Taken]) {
        if taken.is_empty() {
            return;
        }
        let mut table = self.table.lock();
        for step in taken.iter().rev() {
            match step.reentered_from {
                None => {
                    table.remove_where(&step.target, |e| e.owner == *owner);
                }
                Some(previous) => {
                    if let Some(entry) = table
                        .entries
                        .get_mut(&step.target)
                        .and_then(|slot| slot.iter_mut().find(|e| e.owner == *owner))
                    {
                        entry.depth = entry.depth.saturating_sub(1).max(1);
                        entry.read_only = previous;
                    }
                }
            }
        }
        metrics::gauge!("concord_lock_entries").set(table.entry_count() as f64);
        drop(table);
        self.released.notify_waiters();
    }

    /// Release one level of every listed target held by `owner`.
    ///
    /// Returns the number of entries that reached depth zero and were removed.
    pub fn unlock(&self, owner: &LockOwner, targets: &[LockTarget]) -> usize {
        let mut table = self.table.lock();
        let mut removed = 0;

        for target in targets {
            let Some(entry) = table
                .entries
                .get_mut(target)
                .and_then(|slot| slot.iter_mut().find(|e| e.owner == *owner))
            else {
                debug!("Unlock of {} by {} without a held entry", target, owner);
                continue;
            };

            if entry.depth > 1 {
                entry.depth -= 1;
            } else {
                removed += table.remove_where(target, |e| e.owner == *owner);
            }
        }

        metrics::gauge!("concord_lock_entries").set(table.entry_count() as f64);
        drop(table);

        self.stats
            .total_releases
            .fetch_add(removed as u64, Ordering::Relaxed);
        self.released.notify_waiters();
        removed
    }

    /// Drop every entry of `owner` regardless of depth (end of transaction)
    pub fn unlock_all(&self, owner: &LockOwner) -> usize {
        self.remove_matching(|e| e.owner == *owner)
    }

    /// Drop every entry held by a departed node and wake all waiters
    pub fn release_node(&self, node_id: NodeId) -> usize {
        let removed = self.remove_matching(|e| e.owner.node_id == node_id);
        if removed > 0 {
            info!(
                "Released {} lock entries of departed node {}",
                removed, node_id
            );
        }
        removed
    }

    /// Drop the whole table, e.g. when this node stops coordinating
    pub fn clear(&self) -> usize {
        let removed = self.remove_matching(|_| true);
        if removed > 0 {
            warn!("Cleared {} lock entries", removed);
        }
        removed
    }

    fn remove_matching(&self, pred: impl Fn(&LockEntry) -> bool) -> usize {
        let mut table = self.table.lock();
        let targets: Vec<LockTarget> = table
            .entries
            .iter()
            .filter(|(_, slot)| slot.iter().any(&pred))
            .map(|(target, _)| target.clone())
            .collect();

        let removed = targets
            .iter()
            .map(|target| table.remove_where(target, &pred))
            .sum::<usize>();

        metrics::gauge!("concord_lock_entries").set(table.entry_count() as f64);
        drop(table);

        self.stats
            .total_releases
            .fetch_add(removed as u64, Ordering::Relaxed);
        self.released.notify_waiters();
        removed
    }

    /// Current holders of exactly this target
    pub fn holders(&self, target: &LockTarget) -> Vec<LockEntry> {
        self.table.lock().entries_for(target).to_vec()
    }

    pub fn stats(&self) -> LockStats {
        let table = self.table.lock();
        LockStats {
            entries: table.entry_count(),
            targets: table.entries.len(),
            waiters: self.waiters.load(Ordering::Relaxed),
            total_grants: self.stats.total_grants.load(Ordering::Relaxed),
            total_conflicts: self.stats.total_conflicts.load(Ordering::Relaxed),
            total_timeouts: self.stats.total_timeouts.load(Ordering::Relaxed),
            total_stale: self.stats.total_stale.load(Ordering::Relaxed),
            total_releases: self.stats.total_releases.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn owner(node: NodeId, thread: u64) -> LockOwner {
        LockOwner::new(node, thread, Serial(node * 100 + thread as i64))
    }

    fn registry() -> Arc<LockRegistry> {
        let hierarchy = Arc::new(ClassHierarchy::new());
        hierarchy.register(ClassId::new("Document"), vec![]);
        hierarchy.register(ClassId::new("Invoice"), vec![ClassId::new("Document")]);
        hierarchy.register(ClassId::new("Order"), vec![ClassId::new("Document")]);
        Arc::new(LockRegistry::new(hierarchy))
    }

    async fn try_lock(registry: &LockRegistry, request: LockRequest) -> LockGrant {
        registry.lock(request.with_wait(LockWait::NoWait)).await.unwrap()
    }

    #[tokio::test]
    async fn test_reentrant_lock_depth() {
        let registry = registry();
        let a = owner(1, 1);
        let target = LockTarget::object("Order", 7);

        assert!(try_lock(&registry, LockRequest::single(a, target.clone())).await.is_granted());
        assert!(try_lock(&registry, LockRequest::single(a, target.clone())).await.is_granted());
        assert_eq!(registry.holders(&target)[0].depth, 2);

        assert_eq!(registry.unlock(&a, std::slice::from_ref(&target)), 0);
        assert_eq!(registry.holders(&target).len(), 1);

        let b = owner(2, 1);
        assert!(!try_lock(&registry, LockRequest::single(b, target.clone())).await.is_granted());

        assert_eq!(registry.unlock(&a, std::slice::from_ref(&target)), 1);
        assert!(registry.holders(&target).is_empty());
        assert!(try_lock(&registry, LockRequest::single(b, target)).await.is_granted());
    }

    #[tokio::test]
    async fn test_shared_and_exclusive_locks() {
        let registry = registry();
        let target = LockTarget::object("Order", 1);
        let (a, b, c) = (owner(1, 1), owner(2, 1), owner(3, 1));

        assert!(try_lock(&registry, LockRequest::single(a, target.clone()).read_only()).await.is_granted());
        assert!(try_lock(&registry, LockRequest::single(b, target.clone()).read_only()).await.is_granted());

        let denied = try_lock(
            &registry,
            LockRequest::single(c, target.clone()).with_session_info("writer"),
        )
        .await;
        assert!(matches!(denied, LockGrant::Conflict { .. }));
        assert_eq!(registry.holders(&target).len(), 2);
    }

    #[tokio::test]
    async fn test_conflict_carries_holder_session_info() {
        let registry = registry();
        let target = LockTarget::object("Invoice", 3);

        try_lock(
            &registry,
            LockRequest::single(owner(1, 1), target.clone()).with_session_info("nightly-close"),
        )
        .await;

        match try_lock(&registry, LockRequest::single(owner(2, 1), target.clone())).await {
            LockGrant::Conflict {
                session_info,
                owner: holder,
                targets,
            } => {
                assert_eq!(session_info.as_deref(), Some("nightly-close"));
                assert_eq!(holder, owner(1, 1));
                assert_eq!(targets, vec![target]);
            }
            other => panic!("expected conflict, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_class_lock_blocks_descendant_objects_and_back() {
        let registry = registry();
        let (a, b) = (owner(1, 1), owner(2, 1));

        // Ancestor class lock blocks objects and classes below it
        assert!(try_lock(&registry, LockRequest::single(a, LockTarget::class("Document"))).await.is_granted());
        assert!(!try_lock(&registry, LockRequest::single(b, LockTarget::object("Invoice", 1))).await.is_granted());
        assert!(!try_lock(&registry, LockRequest::single(b, LockTarget::class("Order"))).await.is_granted());
        registry.unlock_all(&a);

        // Object lock on a subclass blocks the ancestor class
        assert!(try_lock(&registry, LockRequest::single(a, LockTarget::object("Invoice", 1))).await.is_granted());
        assert!(!try_lock(&registry, LockRequest::single(b, LockTarget::class("Document"))).await.is_granted());
        assert!(!try_lock(&registry, LockRequest::single(b, LockTarget::class("Invoice"))).await.is_granted());

        // Siblings are independent
        assert!(try_lock(&registry, LockRequest::single(b, LockTarget::class("Order"))).await.is_granted());
    }

    #[tokio::test]
    async fn test_request_lineage_extends_hierarchy() {
        // Nothing registered on this side
        let registry = LockRegistry::new(Arc::new(ClassHierarchy::new()));
        let (a, b) = (owner(1, 1), owner(2, 1));

        let declared = ClassHierarchy::new();
        declared.register(ClassId::new("Document"), vec![]);
        declared.register(ClassId::new("Invoice"), vec![ClassId::new("Document")]);

        assert!(try_lock(&registry, LockRequest::single(a, LockTarget::class("Document"))).await.is_granted());

        let invoice = LockTarget::object("Invoice", 1);
        let request = LockRequest::single(b, invoice.clone())
            .with_lineage(declared.lineage(std::slice::from_ref(&invoice)));
        assert!(matches!(try_lock(&registry, request).await, LockGrant::Conflict { .. }));
        assert!(registry.hierarchy().is_a(&ClassId::new("Invoice"), &ClassId::new("Document")));
    }

    #[tokio::test]
    async fn test_duplicate_targets_count_once() {
        let registry = registry();
        let a = owner(1, 1);
        let target = LockTarget::object("Order", 4);

        let request = LockRequest::new(a, vec![target.clone(), target.clone()]);
        let canonical = request.canonical_targets();
        assert!(try_lock(&registry, request).await.is_granted());
        assert_eq!(registry.holders(&target)[0].depth, 1);
        assert_eq!(registry.unlock(&a, &canonical), 1);
    }

    #[tokio::test]
    async fn test_multi_target_lock_is_all_or_nothing() {
        let registry = registry();
        let (a, b) = (owner(1, 1), owner(2, 1));

        try_lock(&registry, LockRequest::single(b, LockTarget::object("Order", 9))).await;

        let request = LockRequest::new(
            a,
            vec![
                LockTarget::object("Order", 9),
                LockTarget::object("Order", 2),
                LockTarget::object("Invoice", 1),
            ],
        );
        assert!(!try_lock(&registry, request).await.is_granted());

        assert!(registry.holders(&LockTarget::object("Order", 2)).is_empty());
        assert!(registry.holders(&LockTarget::object("Invoice", 1)).is_empty());
        assert_eq!(registry.stats().entries, 1);
    }

    #[tokio::test]
    async fn test_failed_reentry_restores_previous_state() {
        let registry = registry();
        let (a, b) = (owner(1, 1), owner(2, 1));
        let shared = LockTarget::object("Order", 1);

        try_lock(&registry, LockRequest::single(a, shared.clone()).read_only()).await;
        try_lock(&registry, LockRequest::single(b, LockTarget::object("Order", 5))).await;

        let request = LockRequest::new(a, vec![shared.clone(), LockTarget::object("Order", 5)])
            .read_only();
        assert!(!try_lock(&registry, request).await.is_granted());

        let held = registry.holders(&shared);
        assert_eq!(held[0].depth, 1);
        assert!(held[0].read_only);
    }

    #[tokio::test]
    async fn test_wait_times_out() {
        let registry = registry();
        let target = LockTarget::object("Order", 1);
        try_lock(&registry, LockRequest::single(owner(1, 1), target.clone())).await;

        let started = std::time::Instant::now();
        let grant = registry
            .lock(LockRequest::single(owner(2, 1), target).with_wait(50i64))
            .await
            .unwrap();
        assert!(!grant.is_granted());
        assert!(started.elapsed() >= Duration::from_millis(45));
        assert_eq!(registry.stats().total_timeouts, 1);
    }

    #[tokio::test]
    async fn test_waiter_is_woken_by_unlock() {
        let registry = registry();
        let a = owner(1, 1);
        let target = LockTarget::object("Order", 1);
        try_lock(&registry, LockRequest::single(a, target.clone())).await;

        let waiter = {
            let registry = registry.clone();
            let target = target.clone();
            tokio::spawn(async move {
                registry
                    .lock(LockRequest::single(owner(2, 1), target).with_wait(5_000i64))
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(registry.stats().waiters, 1);
        registry.unlock(&a, &[target.clone()]);

        let grant = tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(grant.is_granted());
        assert_eq!(registry.holders(&target)[0].owner, owner(2, 1));
    }

    #[tokio::test]
    async fn test_release_node_frees_entries_and_wakes_waiters() {
        let registry = registry();
        let target = LockTarget::class("Document");
        try_lock(&registry, LockRequest::single(owner(4, 1), target.clone())).await;
        try_lock(&registry, LockRequest::single(owner(4, 2), LockTarget::object("Order", 3))).await;

        let waiter = {
            let registry = registry.clone();
            tokio::spawn(async move {
                registry
                    .lock(LockRequest::single(owner(5, 1), LockTarget::object("Invoice", 8)))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert_eq!(registry.release_node(4), 2);
        let grant = tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(grant.is_granted());
    }

    struct StaleAfter(Serial);

    #[async_trait]
    impl CurrencyCheck for StaleAfter {
        async fn is_current(&self, _target: &LockTarget, serial: Serial) -> Result<bool> {
            Ok(serial >= self.0)
        }
    }

    #[tokio::test]
    async fn test_stale_currency_grants_nothing() {
        let hierarchy = Arc::new(ClassHierarchy::new());
        let registry =
            LockRegistry::new(hierarchy).with_currency_check(Arc::new(StaleAfter(Serial(100))));
        let target = LockTarget::object("Order", 1);

        let grant = registry
            .lock(LockRequest::single(owner(1, 1), target.clone()).ensure_current(Serial(50)))
            .await
            .unwrap();
        assert_eq!(grant, LockGrant::Stale);
        assert!(registry.holders(&target).is_empty());
        assert_eq!(registry.stats().total_stale, 1);

        let grant = registry
            .lock(LockRequest::single(owner(1, 1), target.clone()).ensure_current(Serial(100)))
            .await
            .unwrap();
        assert!(grant.is_granted());
    }

    #[tokio::test]
    async fn test_exclusive_holders_never_overlap() {
        let registry = registry();
        let in_section = Arc::new(AtomicUsize::new(0));
        let violations = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..8)
            .map(|i| {
                let registry = registry.clone();
                let in_section = in_section.clone();
                let violations = violations.clone();
                tokio::spawn(async move {
                    let me = owner(i, 1);
                    let targets = if i % 2 == 0 {
                        vec![LockTarget::class("Document")]
                    } else {
                        vec![LockTarget::object("Invoice", 1), LockTarget::object("Order", 1)]
                    };
                    for _ in 0..20 {
                        let grant = registry
                            .lock(LockRequest::new(me, targets.clone()))
                            .await
                            .unwrap();
                        assert!(grant.is_granted());
                        if in_section.fetch_add(1, Ordering::SeqCst) != 0 {
                            violations.fetch_add(1, Ordering::SeqCst);
                        }
                        tokio::task::yield_now().await;
                        in_section.fetch_sub(1, Ordering::SeqCst);
                        registry.unlock(&me, &targets);
                    }
                })
            })
            .collect();

        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(violations.load(Ordering::SeqCst), 0);
        assert_eq!(registry.stats().entries, 0);
    }
}
