//! In-process graph engine
//!
//! A path-addressed tree of slots with last-write-wins leaves and a single
//! broadcast change bus. Watches filter bus events by path overlap and then
//! re-read current state, so a lagged receiver loses nothing but wakeups.

use std::collections::BTreeMap;

use tokio::sync::broadcast;

use super::value::Value;

/// Capacity of the change bus. Watches re-read on every wake, so overflow
/// only costs redundant recomputation, never lost state.
pub(crate) const CHANGE_BUS_CAPACITY: usize = 256;

/// A change notification: the path that was written.
#[derive(Debug, Clone)]
pub(crate) struct ChangeEvent {
    pub path: Vec<String>,
}

/// True when a write at `changed` can alter the value observed at `watched`
/// (either path is a prefix of the other).
pub(crate) fn paths_overlap(changed: &[String], watched: &[String]) -> bool {
    let n = changed.len().min(watched.len());
    changed[..n] == watched[..n]
}

/// One storage slot: a leaf with its write stamp, or an interior node.
#[derive(Debug, Clone)]
enum Slot {
    Leaf { value: Value, stamp: u64 },
    Node(BTreeMap<String, Slot>),
}

/// The mutable graph state. Callers hold it behind `parking_lot::RwLock`;
/// nothing here blocks or awaits.
#[derive(Debug)]
pub(crate) struct Graph {
    root: BTreeMap<String, Slot>,
    /// Monotonic write counter backing last-write-wins
    clock: u64,
}

impl Graph {
    pub fn new() -> Self {
        Self {
            root: BTreeMap::new(),
            clock: 0,
        }
    }

    fn next_stamp(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    /// Write `value` at `path`. Records merge field-by-field; any other
    /// shape replaces the slot if its stamp is not older than what is there.
    pub fn write(&mut self, path: &[String], value: Value) {
        let stamp = self.next_stamp();
        let slot = navigate_mut(&mut self.root, path);
        write_slot(slot, value, stamp);
    }

    /// Deep snapshot of the value at `path`, `None` when nothing was ever
    /// written there.
    pub fn read(&self, path: &[String]) -> Option<Value> {
        self.navigate(path).map(materialize)
    }

    /// Snapshot of an interior node's children. Absent nodes and leaves
    /// yield an empty map so collection views never need a distinct
    /// "not created yet" branch.
    pub fn children(&self, path: &[String]) -> BTreeMap<String, Value> {
        match self.navigate(path) {
            Some(Slot::Node(children)) => children
                .iter()
                .map(|(k, slot)| (k.clone(), materialize(slot)))
                .collect(),
            _ => BTreeMap::new(),
        }
    }

    fn navigate(&self, path: &[String]) -> Option<&Slot> {
        let (first, rest) = path.split_first()?;
        let mut slot = self.root.get(first)?;
        for segment in rest {
            match slot {
                Slot::Node(children) => slot = children.get(segment)?,
                Slot::Leaf { .. } => return None,
            }
        }
        Some(slot)
    }
}

/// Walk to `path`, materializing interior nodes. A leaf in the way is
/// replaced by a node: writes through a tombstone re-create the subtree.
fn navigate_mut<'a>(root: &'a mut BTreeMap<String, Slot>, path: &[String]) -> &'a mut Slot {
    debug_assert!(!path.is_empty(), "graph writes need a non-empty path");

    let mut children = root;
    let mut segments = path.iter().peekable();
    loop {
        let segment = segments.next().expect("non-empty path");
        let slot = children
            .entry(segment.clone())
            .or_insert_with(|| Slot::Node(BTreeMap::new()));

        if segments.peek().is_none() {
            return slot;
        }

        if matches!(slot, Slot::Leaf { .. }) {
            *slot = Slot::Node(BTreeMap::new());
        }
        match slot {
            Slot::Node(next) => children = next,
            Slot::Leaf { .. } => unreachable!("leaf was just replaced"),
        }
    }
}

fn write_slot(slot: &mut Slot, value: Value, stamp: u64) {
    match value {
        Value::Record(fields) => {
            // Merge: records never clobber sibling fields
            if !matches!(slot, Slot::Node(_)) {
                *slot = Slot::Node(BTreeMap::new());
            }
            if let Slot::Node(children) = slot {
                for (name, field_value) in fields {
                    let child = children
                        .entry(name)
                        .or_insert_with(|| Slot::Node(BTreeMap::new()));
                    write_slot(child, field_value, stamp);
                }
            }
        }
        leaf => {
            if let Slot::Leaf { stamp: existing, .. } = slot {
                if *existing > stamp {
                    return;
                }
            }
            *slot = Slot::Leaf { value: leaf, stamp };
        }
    }
}

fn materialize(slot: &Slot) -> Value {
    match slot {
        Slot::Leaf { value, .. } => value.clone(),
        Slot::Node(children) => Value::Record(
            children
                .iter()
                .map(|(k, child)| (k.clone(), materialize(child)))
                .collect(),
        ),
    }
}

/// Change bus shared by every watch on one store.
#[derive(Debug)]
pub(crate) struct ChangeBus {
    tx: broadcast::Sender<ChangeEvent>,
}

impl ChangeBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANGE_BUS_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, path: Vec<String>) {
        // No receivers is fine
        let _ = self.tx.send(ChangeEvent { path });
    }
}
