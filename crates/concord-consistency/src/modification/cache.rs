//! Modification cache
//!
//! Answers "is X still current as of serial S" from a bounded window of
//! recent changes, falling back to the change log when the window cannot
//! vouch for S. A wrong "not current" only costs a reload; a wrong
//! "current" must never happen, so every uncertain case goes to storage.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, info};

use concord_common::{ClassId, LockTarget, NodeId, ObjectId, Result, Serial};
use concord_persistence::ChangeLogPersistence;

use super::model::*;
use crate::lock::{ClassHierarchy, CurrencyCheck};

struct CacheState {
    records: HashMap<ObjectId, ModificationRecord>,
    /// Eviction queue; entries whose generation no longer matches the
    /// record are stale and skipped
    order: VecDeque<(ObjectId, u64)>,
    /// Objects of each in-flight commit
    pending: HashMap<Serial, Vec<ObjectId>>,
    /// Last change per class, propagated to every ancestor
    class_serials: HashMap<ClassId, Serial>,
    /// Last change per exact class
    table_serials: HashMap<ClassId, Serial>,
    /// Object queries below this serial cannot be answered from records
    horizon: Serial,
    /// Class queries below this serial cannot be answered from memory
    class_coverage: Serial,
    /// False while this node may be missing commit broadcasts
    covering: bool,
    next_generation: u64,
}

impl Default for CacheState {
    fn default() -> Self {
        Self {
            records: HashMap::new(),
            order: VecDeque::new(),
            pending: HashMap::new(),
            class_serials: HashMap::new(),
            table_serials: HashMap::new(),
            horizon: Serial::MAX,
            class_coverage: Serial::MAX,
            covering: false,
            next_generation: 0,
        }
    }
}

impl CacheState {
    fn touch(&mut self, object: &ObjectId) -> &mut ModificationRecord {
        self.next_generation += 1;
        let generation = self.next_generation;
        self.order.push_back((object.clone(), generation));

        let record = self
            .records
            .entry(object.clone())
            .or_insert_with(|| ModificationRecord::new(object.clone(), generation));
        record.generation = generation;
        record.touched_at = Instant::now();
        record
    }

    fn bump_class(&mut self, hierarchy: &ClassHierarchy, class: &ClassId, serial: Serial) {
        raise(&mut self.table_serials, class.clone(), serial);
        raise(&mut self.class_serials, class.clone(), serial);
        for ancestor in hierarchy.ancestors(class).iter() {
            raise(&mut self.class_serials, ancestor.clone(), serial);
        }
    }

    fn drop_pending(&mut self, tx_serial: Serial, object: &ObjectId) {
        if let Some(objects) = self.pending.get_mut(&tx_serial) {
            objects.retain(|o| o != object);
            if objects.is_empty() {
                self.pending.remove(&tx_serial);
            }
        }
    }

    /// Remove a record that carries no information any more
    fn forget_if_empty(&mut self, object: &ObjectId) {
        if self
            .records
            .get(object)
            .is_some_and(|r| r.last_change.is_none() && r.pending.is_none())
        {
            self.records.remove(object);
        }
    }

    fn evict(&mut self, config: &ModificationConfig) -> usize {
        let now = Instant::now();
        let mut evicted = 0;
        let mut budget = self.order.len();

        while budget > 0 {
            budget -= 1;
            let Some((object, generation)) = self.order.front().cloned() else {
                break;
            };

            let (pending, last_change, touched_at) = match self.records.get(&object) {
                Some(r) if r.generation == generation => (r.is_pending(), r.last_change, r.touched_at),
                _ => {
                    self.order.pop_front();
                    continue;
                }
            };

            let over_count = self.records.len() > config.max_records;
            let expired = now.duration_since(touched_at) >= config.max_age;
            if !over_count && !expired {
                break;
            }

            self.order.pop_front();
            if pending {
                // Never evict an unresolved change; requeue it
                self.touch(&object);
                continue;
            }

            self.records.remove(&object);
            if let Some(last_change) = last_change
                && last_change > self.horizon
            {
                self.horizon = last_change;
            }
            evicted += 1;
        }

        if self.order.len() > self.records.len() * 2 + 64 {
            let records = &self.records;
            self.order
                .retain(|(o, g)| records.get(o).is_some_and(|r| r.generation == *g));
        }
        evicted
    }
}

fn raise(map: &mut HashMap<ClassId, Serial>, class: ClassId, serial: Serial) {
    map.entry(class)
        .and_modify(|s| *s = (*s).max(serial))
        .or_insert(serial);
}

enum Decision {
    Current(bool),
    Orphaned(PendingChange),
    Storage,
}

pub struct ModificationCache {
    config: ModificationConfig,
    hierarchy: Arc<ClassHierarchy>,
    storage: Arc<dyn ChangeLogPersistence>,
    state: Mutex<CacheState>,
}

impl ModificationCache {
    pub fn new(
        config: ModificationConfig,
        hierarchy: Arc<ClassHierarchy>,
        storage: Arc<dyn ChangeLogPersistence>,
    ) -> Self {
        Self {
            config,
            hierarchy,
            storage,
            state: Mutex::new(CacheState::default()),
        }
    }

    /// Start answering from memory for serials at or above `serial`.
    ///
    /// Called whenever this node (re)joins the group and is guaranteed to
    /// receive every later commit broadcast. The coverage start only moves
    /// up: changes missed while away are all below the new start.
    pub fn begin_coverage(&self, serial: Serial) {
        let mut state = self.state.lock();
        state.covering = true;
        state.horizon = if state.horizon == Serial::MAX {
            serial
        } else {
            state.horizon.max(serial)
        };
        state.class_coverage = if state.class_coverage == Serial::MAX {
            serial
        } else {
            state.class_coverage.max(serial)
        };
        info!(
            "Modification cache covers objects from {} and classes from {}",
            state.horizon, state.class_coverage
        );
    }

    /// Stop answering "current" from memory until the next `begin_coverage`.
    ///
    /// Called when this node leaves the group: commit broadcasts sent while
    /// it is away never reach the cache. Recorded changes still answer
    /// "not current"; everything else goes to storage.
    pub fn suspend_coverage(&self) {
        let mut state = self.state.lock();
        if state.covering {
            state.covering = false;
            info!("Modification cache coverage suspended");
        }
    }

    pub fn is_covering(&self) -> bool {
        self.state.lock().covering
    }

    /// Announce the objects an in-flight commit is changing
    pub fn prepare(&self, node_id: NodeId, tx_serial: Serial, objects: &[ObjectId]) {
        let mut state = self.state.lock();
        for object in objects {
            state.touch(object).pending = Some(PendingChange {
                tx_serial,
                node_id,
                orphaned: false,
            });
        }
        state
            .pending
            .entry(tx_serial)
            .or_default()
            .extend(objects.iter().cloned());
        self.evict_locked(&mut state);
        debug!(
            "Prepared {} changes of commit {} from node {}",
            objects.len(),
            tx_serial,
            node_id
        );
    }

    /// Apply the outcome of a successful commit.
    ///
    /// `objects` may name changes this node never saw prepared (it joined
    /// after the prepare broadcast).
    pub fn finalize(&self, tx_serial: Serial, objects: &[ObjectId]) {
        let mut state = self.state.lock();
        let mut changed: BTreeSet<ObjectId> = objects.iter().cloned().collect();
        if let Some(prepared) = state.pending.remove(&tx_serial) {
            changed.extend(prepared);
        }

        for object in &changed {
            state.touch(object).commit(tx_serial, tx_serial);
            state.bump_class(&self.hierarchy, &object.class, tx_serial);
        }
        self.evict_locked(&mut state);
        debug!("Finalized {} changes of commit {}", changed.len(), tx_serial);
    }

    /// Discard the pending changes of a rolled back commit
    pub fn abort(&self, tx_serial: Serial) {
        let mut state = self.state.lock();
        let Some(objects) = state.pending.remove(&tx_serial) else {
            return;
        };
        for object in &objects {
            if let Some(record) = state.records.get_mut(object)
                && record.pending.is_some_and(|p| p.tx_serial == tx_serial)
            {
                record.pending = None;
            }
            state.forget_if_empty(object);
        }
        debug!("Aborted {} changes of commit {}", objects.len(), tx_serial);
    }

    /// Mark the pending changes of a departed node as unresolved
    pub fn orphan_node(&self, node_id: NodeId) -> usize {
        self.orphan_where(|p| p.node_id == node_id)
    }

    /// Mark every pending change as unresolved, e.g. on coordinator change
    pub fn orphan_all(&self) -> usize {
        self.orphan_where(|_| true)
    }

    fn orphan_where(&self, pred: impl Fn(&PendingChange) -> bool) -> usize {
        let mut state = self.state.lock();
        let mut orphaned = 0;
        for record in state.records.values_mut() {
            if let Some(pending) = record.pending.as_mut()
                && !pending.orphaned
                && pred(pending)
            {
                pending.orphaned = true;
                orphaned += 1;
            }
        }
        if orphaned > 0 {
            info!("Orphaned {} pending changes", orphaned);
        }
        orphaned
    }

    /// Whether an object read at `serial` is still the latest version
    pub async fn is_object_current(&self, object: &ObjectId, serial: Serial) -> Result<bool> {
        let decision = self.decide_object(object, serial);
        let decision = match decision {
            Decision::Orphaned(pending) => {
                self.resolve_orphan(object, pending).await?;
                self.decide_object(object, serial)
            }
            other => other,
        };

        match decision {
            Decision::Current(current) => Ok(current),
            Decision::Orphaned(_) | Decision::Storage => {
                let stored = self.storage.last_object_change(object).await?;
                Ok(stored.is_none_or(|change| change <= serial))
            }
        }
    }

    fn decide_object(&self, object: &ObjectId, serial: Serial) -> Decision {
        let state = self.state.lock();
        let record = state.records.get(object);

        if let Some(pending) = record.and_then(|r| r.pending)
            && pending.orphaned
        {
            return Decision::Orphaned(pending);
        }
        if let Some(last_change) = record.and_then(|r| r.last_change)
            && last_change > serial
        {
            return Decision::Current(false);
        }
        if state.covering && serial >= state.horizon {
            Decision::Current(true)
        } else {
            Decision::Storage
        }
    }

    /// Settle an orphaned change from the change log: committed if storage
    /// shows a change at or after the commit serial, discarded otherwise.
    async fn resolve_orphan(&self, object: &ObjectId, pending: PendingChange) -> Result<()> {
        let stored = self.storage.last_object_change(object).await?;

        let mut state = self.state.lock();
        let still_orphaned = state
            .records
            .get(object)
            .and_then(|r| r.pending)
            .is_some_and(|p| p == pending);
        if !still_orphaned {
            return Ok(());
        }

        match stored {
            // A log that cannot tell reports `Serial::MAX`; the change is
            // then taken as committed at its own serial
            Some(Serial::MAX) => {
                state.touch(object).commit(pending.tx_serial, pending.tx_serial);
                state.bump_class(&self.hierarchy, &object.class, pending.tx_serial);
                debug!("Orphaned change of {} assumed committed", object);
            }
            Some(change) if change >= pending.tx_serial => {
                state.touch(object).commit(pending.tx_serial, change);
                state.bump_class(&self.hierarchy, &object.class, change);
                debug!("Orphaned change of {} was committed at {}", object, change);
            }
            _ => {
                if let Some(record) = state.records.get_mut(object) {
                    record.pending = None;
                }
                state.forget_if_empty(object);
                debug!("Orphaned change of {} was discarded", object);
            }
        }
        state.drop_pending(pending.tx_serial, object);
        Ok(())
    }

    async fn resolve_orphans_in(&self, classes: &BTreeSet<ClassId>) -> Result<()> {
        self.resolve_orphans_where(|class| classes.contains(class))
            .await
            .map(|_| ())
    }

    /// Settle every orphaned change now instead of on first query.
    ///
    /// Run after membership changes and from the eviction sweep, since
    /// pending records are never evicted. Returns how many were settled.
    pub async fn resolve_orphans(&self) -> Result<usize> {
        self.resolve_orphans_where(|_| true).await
    }

    async fn resolve_orphans_where(&self, pred: impl Fn(&ClassId) -> bool) -> Result<usize> {
        let orphans: Vec<(ObjectId, PendingChange)> = {
            let state = self.state.lock();
            state
                .records
                .values()
                .filter(|r| r.is_orphaned() && pred(&r.object.class))
                .filter_map(|r| r.pending.map(|p| (r.object.clone(), p)))
                .collect()
        };
        let count = orphans.len();
        for (object, pending) in orphans {
            self.resolve_orphan(&object, pending).await?;
        }
        Ok(count)
    }

    /// Objects of unresolved in-flight commits
    pub fn pending_count(&self) -> usize {
        self.state.lock().pending.values().map(Vec::len).sum()
    }

    /// Whether nothing in the class or any of its descendants changed after
    /// `serial`
    pub async fn is_class_current(&self, class: &ClassId, serial: Serial) -> Result<bool> {
        let mut subtree: BTreeSet<ClassId> = self.hierarchy.descendants(class).iter().cloned().collect();
        subtree.insert(class.clone());
        self.resolve_orphans_in(&subtree).await?;

        {
            let state = self.state.lock();
            let last = state.class_serials.get(class).copied();
            if last.is_some_and(|l| l > serial) {
                return Ok(false);
            }
            if state.covering && serial >= state.class_coverage {
                return Ok(true);
            }
        }

        let classes: Vec<ClassId> = subtree.into_iter().collect();
        let stored = self.storage.last_class_change(&classes).await?;
        Ok(stored.is_none_or(|change| change <= serial))
    }

    /// Like `is_class_current` but for the exact class only
    pub async fn is_table_current(&self, class: &ClassId, serial: Serial) -> Result<bool> {
        self.resolve_orphans_in(&BTreeSet::from([class.clone()]))
            .await?;

        {
            let state = self.state.lock();
            let last = state.table_serials.get(class).copied();
            if last.is_some_and(|l| l > serial) {
                return Ok(false);
            }
            if state.covering && serial >= state.class_coverage {
                return Ok(true);
            }
        }

        let stored = self
            .storage
            .last_class_change(std::slice::from_ref(class))
            .await?;
        Ok(stored.is_none_or(|change| change <= serial))
    }

    /// Evict expired records; run periodically by the owning node
    pub fn evict_expired(&self) -> usize {
        let mut state = self.state.lock();
        self.evict_locked(&mut state)
    }

    fn evict_locked(&self, state: &mut CacheState) -> usize {
        let evicted = state.evict(&self.config);
        if evicted > 0 {
            metrics::counter!("concord_modification_evictions_total").increment(evicted as u64);
            debug!(
                "Evicted {} modification records, horizon now {}",
                evicted, state.horizon
            );
        }
        metrics::gauge!("concord_modification_records").set(state.records.len() as f64);
        evicted
    }

    pub fn record(&self, object: &ObjectId) -> Option<ModificationRecord> {
        self.state.lock().records.get(object).cloned()
    }

    pub fn len(&self) -> usize {
        self.state.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn horizon(&self) -> Serial {
        self.state.lock().horizon
    }
}

#[async_trait]
impl CurrencyCheck for ModificationCache {
    async fn is_current(&self, target: &LockTarget, serial: Serial) -> Result<bool> {
        match target {
            LockTarget::Object(object) => self.is_object_current(object, serial).await,
            LockTarget::Class(class) => self.is_class_current(class, serial).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use concord_persistence::{MemoryPersistService, UnknownChangeLog};

    use super::*;

    fn order(id: i64) -> ObjectId {
        ObjectId::new(ClassId::new("Order"), id)
    }

    fn setup(max_records: usize) -> (Arc<MemoryPersistService>, ModificationCache) {
        let hierarchy = Arc::new(ClassHierarchy::new());
        hierarchy.register(ClassId::new("Document"), vec![]);
        hierarchy.register(ClassId::new("Order"), vec![ClassId::new("Document")]);
        hierarchy.register(ClassId::new("Invoice"), vec![ClassId::new("Document")]);

        let storage = Arc::new(MemoryPersistService::new());
        let config = ModificationConfig {
            max_records,
            max_age: Duration::from_secs(3600),
        };
        let cache = ModificationCache::new(config, hierarchy, storage.clone());
        (storage, cache)
    }

    #[tokio::test]
    async fn test_unmodified_object_stays_current() {
        let (_storage, cache) = setup(100);
        cache.begin_coverage(Serial(100));

        assert!(cache.is_object_current(&order(1), Serial(150)).await.unwrap());
        assert!(cache.is_object_current(&order(1), Serial(10_000)).await.unwrap());
    }

    #[tokio::test]
    async fn test_committed_change_makes_older_reads_stale() {
        let (_storage, cache) = setup(100);
        cache.begin_coverage(Serial(100));

        cache.prepare(2, Serial(200), &[order(1)]);
        cache.finalize(Serial(200), &[]);

        assert!(!cache.is_object_current(&order(1), Serial(150)).await.unwrap());
        assert!(cache.is_object_current(&order(1), Serial(200)).await.unwrap());
        assert!(cache.is_object_current(&order(2), Serial(150)).await.unwrap());
    }

    #[tokio::test]
    async fn test_pending_change_does_not_flip_currency() {
        let (_storage, cache) = setup(100);
        cache.begin_coverage(Serial(100));

        cache.prepare(2, Serial(200), &[order(1)]);
        assert!(cache.is_object_current(&order(1), Serial(150)).await.unwrap());
        assert!(cache.record(&order(1)).unwrap().is_pending());

        cache.abort(Serial(200));
        assert!(cache.record(&order(1)).is_none());
        assert!(cache.is_object_current(&order(1), Serial(150)).await.unwrap());
    }

    #[tokio::test]
    async fn test_orphaned_change_resolved_from_storage() {
        let (storage, cache) = setup(100);
        cache.begin_coverage(Serial(100));

        cache.prepare(3, Serial(200), &[order(1), order(2)]);
        assert_eq!(cache.orphan_node(3), 2);

        // Order 1 reached storage before node 3 died; order 2 did not
        storage.record_change(&order(1), Serial(200));

        assert!(!cache.is_object_current(&order(1), Serial(150)).await.unwrap());
        assert_eq!(cache.record(&order(1)).unwrap().last_change, Some(Serial(200)));

        assert!(cache.is_object_current(&order(2), Serial(150)).await.unwrap());
        assert!(cache.record(&order(2)).is_none());
    }

    #[tokio::test]
    async fn test_uncovered_serials_fall_back_to_storage() {
        let (storage, cache) = setup(100);
        storage.record_change(&order(1), Serial(80));

        // No coverage yet: everything goes to storage
        assert!(!cache.is_object_current(&order(1), Serial(50)).await.unwrap());
        assert!(cache.is_object_current(&order(1), Serial(90)).await.unwrap());

        cache.begin_coverage(Serial(100));
        assert!(!cache.is_object_current(&order(1), Serial(50)).await.unwrap());
        assert!(cache.is_object_current(&order(1), Serial(120)).await.unwrap());
    }

    #[tokio::test]
    async fn test_rejoin_moves_coverage_up() {
        let (storage, cache) = setup(100);
        cache.begin_coverage(Serial(100));

        // A change committed while this node was away never reached the cache
        storage.record_change(&order(4), Serial(150));
        cache.begin_coverage(Serial(180));

        assert!(!cache.is_object_current(&order(4), Serial(120)).await.unwrap());
        assert!(cache.is_object_current(&order(4), Serial(180)).await.unwrap());

        cache.begin_coverage(Serial(90));
        assert_eq!(cache.horizon(), Serial(180));
    }

    #[tokio::test]
    async fn test_eviction_raises_horizon() {
        let (storage, cache) = setup(2);
        cache.begin_coverage(Serial(100));

        for (id, serial) in [(1, 110), (2, 120), (3, 130)] {
            storage.record_change(&order(id), Serial(serial));
            cache.finalize(Serial(serial), &[order(id)]);
        }

        assert_eq!(cache.len(), 2);
        assert!(cache.record(&order(1)).is_none());
        assert_eq!(cache.horizon(), Serial(110));

        // Below the horizon the evicted change is still seen via storage
        assert!(!cache.is_object_current(&order(1), Serial(105)).await.unwrap());
        assert!(cache.is_object_current(&order(1), Serial(110)).await.unwrap());
    }

    #[tokio::test]
    async fn test_pending_records_are_never_evicted() {
        let (_storage, cache) = setup(1);
        cache.begin_coverage(Serial(100));

        cache.prepare(1, Serial(110), &[order(1)]);
        cache.finalize(Serial(120), &[order(2)]);
        cache.finalize(Serial(130), &[order(3)]);

        assert!(cache.record(&order(1)).unwrap().is_pending());
        assert!(cache.record(&order(2)).is_none());
    }

    #[tokio::test]
    async fn test_suspended_coverage_defers_to_storage() {
        let (storage, cache) = setup(100);
        cache.begin_coverage(Serial(100));
        cache.finalize(Serial(120), &[order(2)]);
        assert!(cache.is_object_current(&order(1), Serial(150)).await.unwrap());

        // Committed elsewhere while this node was out of the group
        cache.suspend_coverage();
        storage.record_change(&order(1), Serial(160));
        assert!(!cache.is_covering());

        assert!(!cache.is_object_current(&order(1), Serial(150)).await.unwrap());
        assert!(!cache.is_class_current(&ClassId::new("Order"), Serial(150)).await.unwrap());
        assert!(!cache.is_table_current(&ClassId::new("Order"), Serial(150)).await.unwrap());
        // Known changes still answer without storage
        assert!(!cache.is_object_current(&order(2), Serial(110)).await.unwrap());

        cache.begin_coverage(Serial(200));
        assert!(cache.is_covering());
        assert!(cache.is_object_current(&order(1), Serial(200)).await.unwrap());
        assert!(!cache.is_object_current(&order(1), Serial(150)).await.unwrap());
    }

    #[tokio::test]
    async fn test_orphans_resolved_eagerly() {
        let (storage, cache) = setup(100);
        cache.begin_coverage(Serial(100));

        cache.prepare(3, Serial(200), &[order(1), order(2)]);
        cache.prepare(4, Serial(210), &[order(3)]);
        storage.record_change(&order(1), Serial(200));
        assert_eq!(cache.orphan_node(3), 2);

        assert_eq!(cache.resolve_orphans().await.unwrap(), 2);
        assert_eq!(cache.record(&order(1)).unwrap().last_change, Some(Serial(200)));
        assert!(!cache.record(&order(1)).unwrap().is_pending());
        assert!(cache.record(&order(2)).is_none());

        // Node 4 is still alive, its commit stays pending
        assert!(cache.record(&order(3)).unwrap().is_pending());
        assert_eq!(cache.pending_count(), 1);
        assert_eq!(cache.resolve_orphans().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_unknown_history_is_never_current() {
        let hierarchy = Arc::new(ClassHierarchy::new());
        let config = ModificationConfig {
            max_records: 1,
            max_age: Duration::from_secs(3600),
        };
        let cache = ModificationCache::new(config, hierarchy, Arc::new(UnknownChangeLog));
        cache.begin_coverage(Serial(100));

        cache.finalize(Serial(200), &[order(1)]);
        cache.finalize(Serial(300), &[order(2)]);
        assert!(cache.record(&order(1)).is_none());
        assert!(!cache.is_object_current(&order(1), Serial(150)).await.unwrap());
        assert!(cache.is_object_current(&order(1), Serial(300)).await.unwrap());

        // An orphan is taken as committed at its own serial
        cache.prepare(5, Serial(400), &[order(9)]);
        cache.orphan_all();
        cache.resolve_orphans().await.unwrap();
        assert_eq!(cache.record(&order(9)).unwrap().last_change, Some(Serial(400)));
        assert!(cache.is_object_current(&order(9), Serial(400)).await.unwrap());
    }

    #[tokio::test]
    async fn test_class_currency_follows_hierarchy() {
        let (_storage, cache) = setup(100);
        cache.begin_coverage(Serial(100));

        cache.finalize(Serial(200), &[order(1)]);

        let document = ClassId::new("Document");
        let invoice = ClassId::new("Invoice");
        let order_class = ClassId::new("Order");

        assert!(!cache.is_class_current(&document, Serial(150)).await.unwrap());
        assert!(!cache.is_class_current(&order_class, Serial(150)).await.unwrap());
        assert!(cache.is_class_current(&invoice, Serial(150)).await.unwrap());

        // Table currency only looks at the exact class
        assert!(cache.is_table_current(&document, Serial(150)).await.unwrap());
        assert!(!cache.is_table_current(&order_class, Serial(150)).await.unwrap());
    }

    #[tokio::test]
    async fn test_currency_check_for_lock_targets() {
        let (_storage, cache) = setup(100);
        cache.begin_coverage(Serial(100));
        cache.finalize(Serial(300), &[order(5)]);

        assert!(!cache.is_current(&LockTarget::object("Order", 5), Serial(200)).await.unwrap());
        assert!(!cache.is_current(&LockTarget::class("Document"), Serial(200)).await.unwrap());
        assert!(cache.is_current(&LockTarget::object("Order", 6), Serial(200)).await.unwrap());
    }
}
