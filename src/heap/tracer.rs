//! Reachability snapshots over the heap and the "new since two pauses ago"
//! leak heuristic.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap, HashMap, VecDeque};

use serde::Serialize;

use super::object::RefObject;
use super::registry::Heap;
use super::value::{ObjectRef, Value};

/// Path used for objects that have no acyclic route from a root.
pub const CYCLE_PATH: &str = "(cycle)";

/// A named starting point of the walk (global, frame local, capture, ...).
#[derive(Debug, Clone)]
pub struct Root {
    pub name: String,
    pub value: Value,
}

impl Root {
    pub fn new(name: impl Into<String>, value: Value) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IncomingRef {
    /// `None` for edges coming straight from a root.
    pub parent: Option<u64>,
    pub field: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct TracedObject {
    pub id: u64,
    #[serde(skip)]
    pub object: ObjectRef,
    pub key: String,
    pub size: usize,
    pub path: String,
    pub incoming: Vec<IncomingRef>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TypeStats {
    pub count: usize,
    pub size: usize,
}

impl TypeStats {
    fn add(&mut self, size: usize) {
        self.count += 1;
        self.size += size;
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HeapSnapshot {
    pub seq: u64,
    pub objects: BTreeMap<u64, TracedObject>,
    pub by_type: BTreeMap<String, TypeStats>,
    pub total: TypeStats,
}

impl HeapSnapshot {
    pub fn contains(&self, id: u64) -> bool {
        self.objects.contains_key(&id)
    }

    pub fn path_of(&self, id: u64) -> Option<&str> {
        self.objects.get(&id).map(|o| o.path.as_str())
    }
}

fn join_path(parent: &str, field: &str) -> String {
    if field.starts_with('[') {
        format!("{parent}{field}")
    } else {
        format!("{parent}.{field}")
    }
}

/// Walk everything reachable from `roots`.
pub fn trace(heap: &Heap, roots: &[Root], seq: u64) -> HeapSnapshot {
    let mut visited: HashMap<u64, TracedObject> = HashMap::new();
    let mut stack: Vec<(ObjectRef, IncomingRef)> = Vec::new();

    for root in roots.iter().rev() {
        if let Some(r) = root.value.as_object() {
            stack.push((
                r,
                IncomingRef {
                    parent: None,
                    field: root.name.clone(),
                },
            ));
        }
    }

    while let Some((r, edge)) = stack.pop() {
        let Some(obj) = heap.get(r) else {
            continue;
        };
        if let Some(seen) = visited.get_mut(&obj.id) {
            seen.incoming.push(edge);
            continue;
        }

        let id = obj.id;
        let mut children = Vec::new();
        obj.scan(&mut |field, value| {
            if let Some(child) = value.as_object() {
                children.push((
                    child,
                    IncomingRef {
                        parent: Some(id),
                        field: field.to_string(),
                    },
                ));
            }
        });
        stack.extend(children.into_iter().rev());

        visited.insert(
            id,
            TracedObject {
                id,
                object: r,
                key: obj.gc_key(),
                size: obj.gc_size(),
                path: String::new(),
                incoming: vec![edge],
            },
        );
    }

    resolve_paths(&mut visited);

    let mut by_type: BTreeMap<String, TypeStats> = BTreeMap::new();
    let mut total = TypeStats::default();
    for obj in visited.values() {
        by_type.entry(obj.key.clone()).or_default().add(obj.size);
        total.add(obj.size);
    }

    HeapSnapshot {
        seq,
        objects: visited.into_iter().collect(),
        by_type,
        total,
    }
}

/// Pick, per object, the shortest route from a root (fewest hops, then shortest text).
fn resolve_paths(visited: &mut HashMap<u64, TracedObject>) {
    let mut outgoing: HashMap<u64, Vec<(u64, String)>> = HashMap::new();
    let mut queue = BinaryHeap::new();

    for obj in visited.values() {
        for edge in &obj.incoming {
            match edge.parent {
                Some(parent) => outgoing
                    .entry(parent)
                    .or_default()
                    .push((obj.id, edge.field.clone())),
                None => queue.push(Reverse((0usize, edge.field.len(), edge.field.clone(), obj.id))),
            }
        }
    }

    let mut resolved: HashMap<u64, String> = HashMap::new();
    while let Some(Reverse((hops, _, path, id))) = queue.pop() {
        if resolved.contains_key(&id) {
            continue;
        }
        if let Some(children) = outgoing.get(&id) {
            for (child, field) in children {
                if !resolved.contains_key(child) {
                    let child_path = join_path(&path, field);
                    queue.push(Reverse((hops + 1, child_path.len(), child_path, *child)));
                }
            }
        }
        resolved.insert(id, path);
    }

    for (id, obj) in visited.iter_mut() {
        obj.path = resolved
            .remove(id)
            .unwrap_or_else(|| CYCLE_PATH.to_string());
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LeakCandidate {
    pub id: u64,
    pub key: String,
    pub size: usize,
    pub path: String,
    /// Whether the object is also reachable in the newest snapshot.
    pub still_live: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct LeakReport {
    pub candidates: Vec<LeakCandidate>,
    pub by_type: BTreeMap<String, TypeStats>,
}

/// Keeps the most recent snapshots and diffs them.
#[derive(Debug)]
pub struct HeapTracer {
    retention: usize,
    next_seq: u64,
    snapshots: VecDeque<HeapSnapshot>,
}

impl HeapTracer {
    pub fn new(retention: usize) -> Self {
        Self {
            retention: retention.max(3),
            next_seq: 1,
            snapshots: VecDeque::new(),
        }
    }

    pub fn snapshot(&mut self, heap: &Heap, roots: &[Root]) -> &HeapSnapshot {
        let snap = trace(heap, roots, self.next_seq);
        self.next_seq += 1;
        tracing::debug!(
            seq = snap.seq,
            objects = snap.total.count,
            size = snap.total.size,
            "heap snapshot"
        );
        if self.snapshots.len() == self.retention {
            self.snapshots.pop_front();
        }
        self.snapshots.push_back(snap);
        &self.snapshots[self.snapshots.len() - 1]
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    pub fn clear(&mut self) {
        self.snapshots.clear();
    }

    /// Objects present one snapshot ago but not two snapshots ago.
    ///
    /// Types whose candidate count stays within `expected(type)` are skipped.
    /// Returns `None` until three snapshots exist.
    pub fn leak_report(&self, expected: impl Fn(&str) -> usize) -> Option<LeakReport> {
        let n = self.snapshots.len();
        if n < 3 {
            return None;
        }
        let current = &self.snapshots[n - 1];
        let previous = &self.snapshots[n - 2];
        let older = &self.snapshots[n - 3];

        let mut grouped: BTreeMap<String, Vec<&TracedObject>> = BTreeMap::new();
        for obj in previous.objects.values() {
            if !older.contains(obj.id) {
                grouped.entry(obj.key.clone()).or_default().push(obj);
            }
        }

        let mut report = LeakReport::default();
        for (key, objs) in grouped {
            if objs.len() <= expected(&key) {
                continue;
            }
            let stats = report.by_type.entry(key.clone()).or_default();
            for obj in objs {
                stats.add(obj.size);
                report.candidates.push(LeakCandidate {
                    id: obj.id,
                    key: key.clone(),
                    size: obj.size,
                    path: obj.path.clone(),
                    still_live: current.contains(obj.id),
                });
            }
        }
        Some(report)
    }
}
