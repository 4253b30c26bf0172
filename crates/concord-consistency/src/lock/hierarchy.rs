//! Class hierarchy closure table
//!
//! Classes are registered with their direct parents (superclass and
//! interfaces). Ancestor and descendant closures are computed on demand and
//! cached until the next registration. A class never registered is a root
//! with no relatives.
//!
//! Each node registers its own classes. Lock requests carry the caller's
//! declarations for their targets so the coordinator can merge them into
//! its own hierarchy before checking conflicts.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use concord_common::{ClassId, LockTarget};

/// A class and its direct parents, as registered on some node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassDeclaration {
    pub class: ClassId,
    pub parents: Vec<ClassId>,
}

#[derive(Default)]
struct Graph {
    parents: HashMap<ClassId, Vec<ClassId>>,
    children: HashMap<ClassId, Vec<ClassId>>,
}

#[derive(Default)]
struct Closures {
    ancestors: HashMap<ClassId, Arc<BTreeSet<ClassId>>>,
    descendants: HashMap<ClassId, Arc<BTreeSet<ClassId>>>,
}

#[derive(Default)]
pub struct ClassHierarchy {
    graph: RwLock<Graph>,
    closures: Mutex<Closures>,
}

impl ClassHierarchy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a class with its direct parents. Re-registering replaces the
    /// previous parent list.
    pub fn register(&self, class: ClassId, parents: Vec<ClassId>) {
        let mut graph = self.graph.write();

        if let Some(previous) = graph.parents.remove(&class) {
            for parent in previous {
                if let Some(children) = graph.children.get_mut(&parent) {
                    children.retain(|c| *c != class);
                }
            }
        }
        for parent in &parents {
            let children = graph.children.entry(parent.clone()).or_default();
            if !children.contains(&class) {
                children.push(class.clone());
            }
        }
        graph.parents.insert(class, parents);

        let mut closures = self.closures.lock();
        closures.ancestors.clear();
        closures.descendants.clear();
    }

    /// Merge declarations made on another node. Parents are only ever
    /// added. Returns whether anything changed.
    pub fn learn(&self, declarations: &[ClassDeclaration]) -> bool {
        let merged: Vec<(ClassId, Vec<ClassId>)> = {
            let graph = self.graph.read();
            declarations
                .iter()
                .filter_map(|declaration| {
                    let known = graph.parents.get(&declaration.class);
                    let mut parents = known.cloned().unwrap_or_default();
                    for parent in &declaration.parents {
                        if !parents.contains(parent) {
                            parents.push(parent.clone());
                        }
                    }
                    let changed = known.is_none_or(|k| k.len() != parents.len());
                    changed.then(|| (declaration.class.clone(), parents))
                })
                .collect()
        };

        let changed = !merged.is_empty();
        for (class, parents) in merged {
            self.register(class, parents);
        }
        changed
    }

    /// Declarations a coordinator needs to place `targets` in the
    /// hierarchy: object targets bring their class and its ancestors,
    /// class targets also bring their descendants.
    pub fn lineage(&self, targets: &[LockTarget]) -> Vec<ClassDeclaration> {
        let mut classes = BTreeSet::new();
        for target in targets {
            let class = target.class_id();
            classes.insert(class.clone());
            classes.extend(self.ancestors(class).iter().cloned());
            if let LockTarget::Class(_) = target {
                for descendant in self.descendants(class).iter() {
                    classes.insert(descendant.clone());
                    classes.extend(self.ancestors(descendant).iter().cloned());
                }
            }
        }

        let graph = self.graph.read();
        classes
            .into_iter()
            .filter_map(|class| {
                let parents = graph.parents.get(&class)?.clone();
                Some(ClassDeclaration { class, parents })
            })
            .collect()
    }

    /// Every transitive parent, excluding the class itself
    pub fn ancestors(&self, class: &ClassId) -> Arc<BTreeSet<ClassId>> {
        let graph = self.graph.read();
        if let Some(cached) = self.closures.lock().ancestors.get(class) {
            return cached.clone();
        }
        let computed = Arc::new(walk(&graph.parents, class));
        self.closures
            .lock()
            .ancestors
            .insert(class.clone(), computed.clone());
        computed
    }

    /// Every transitive child, excluding the class itself
    pub fn descendants(&self, class: &ClassId) -> Arc<BTreeSet<ClassId>> {
        let graph = self.graph.read();
        if let Some(cached) = self.closures.lock().descendants.get(class) {
            return cached.clone();
        }
        let computed = Arc::new(walk(&graph.children, class));
        self.closures
            .lock()
            .descendants
            .insert(class.clone(), computed.clone());
        computed
    }

    /// The class with all its ancestors and descendants
    pub fn closure(&self, class: &ClassId) -> BTreeSet<ClassId> {
        let mut all: BTreeSet<ClassId> = self.ancestors(class).iter().cloned().collect();
        all.extend(self.descendants(class).iter().cloned());
        all.insert(class.clone());
        all
    }

    /// Whether `class` is `ancestor` or one of its transitive children
    pub fn is_a(&self, class: &ClassId, ancestor: &ClassId) -> bool {
        class == ancestor || self.ancestors(class).contains(ancestor)
    }

    pub fn len(&self) -> usize {
        self.graph.read().parents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn walk(edges: &HashMap<ClassId, Vec<ClassId>>, start: &ClassId) -> BTreeSet<ClassId> {
    let mut seen = BTreeSet::new();
    let mut stack: Vec<&ClassId> = edges.get(start).map(|n| n.iter().collect()).unwrap_or_default();

    while let Some(next) = stack.pop() {
        if next == start || !seen.insert(next.clone()) {
            continue;
        }
        if let Some(more) = edges.get(next) {
            stack.extend(more.iter());
        }
    }
    seen
}
