//! Process-wide dependency graph between queues, semaphores and groups.
//!
//! A directed edge `A -> B` means "a block running for A is blocked until B
//! makes progress": a synchronous dispatch from A to B, a semaphore wait
//! inside A, or a group wait inside A. Edges exist only while the blocking
//! call is in flight, and are reference counted so nested or concurrent
//! calls between the same pair of nodes stack up. A cycle therefore means a
//! set of threads that can never make progress again.
//!
//! # Purpose
//!
//! - Detects deadlocks in running programs ([`QueueGraph::check_tree_structure`]).
//! - Dumps the current wait relationships for debugging ([`QueueGraph::dump`]).
//!
//! # Example
//!
//! ```ignore
//! use dispatchq::{QueueGraph, GraphState};
//!
//! QueueGraph::shared().set_state(GraphState::WithLabels);
//! // ... run the program ...
//! if !QueueGraph::shared().check_tree_structure(true) {
//!     eprintln!("{}", QueueGraph::shared().dump());
//! }
//! ```
//!
//! Nodes live in a generational arena: the id of a dropped queue is never
//! confused with a queue created later in the same slot.

use crate::config::{self, GraphState};
use crate::runtime::context;

use parking_lot::Mutex;
use std::backtrace::Backtrace;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};

static GRAPH: OnceLock<QueueGraph> = OnceLock::new();

/// Identifier of a node in the [`QueueGraph`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId {
    index: u32,
    generation: u32,
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}.{}", self.index, self.generation)
    }
}

/// What a graph node stands for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum NodeKind {
    Queue,
    Semaphore,
    Group,
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            NodeKind::Queue => "queue",
            NodeKind::Semaphore => "semaphore",
            NodeKind::Group => "group",
        })
    }
}

#[derive(Default)]
struct Edge {
    count: usize,
    sites: Vec<(u64, Arc<Backtrace>)>,
}

struct Node {
    kind: NodeKind,
    label: Option<String>,
    outgoing: HashMap<NodeId, Edge>,
    incoming: HashSet<NodeId>,
}

struct Slot {
    generation: u32,
    node: Option<Node>,
}

// Generational arena of nodes. Freed slots are reused with a bumped
// generation.
#[derive(Default)]
struct Arena {
    slots: Vec<Slot>,
    free: Vec<u32>,
    epoch: u64,
    next_ticket: u64,
}

impl Arena {
    fn insert(&mut self, node: Node) -> NodeId {
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.generation = slot.generation.wrapping_add(1);
            slot.node = Some(node);
            NodeId {
                index,
                generation: slot.generation,
            }
        } else {
            let index = self.slots.len() as u32;
            self.slots.push(Slot {
                generation: 0,
                node: Some(node),
            });
            NodeId {
                index,
                generation: 0,
            }
        }
    }

    fn remove(&mut self, id: NodeId) -> Option<Node> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        let node = slot.node.take()?;
        self.free.push(id.index);
        Some(node)
    }

    fn get(&self, id: NodeId) -> Option<&Node> {
        self.slots
            .get(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.node.as_ref())
    }

    fn get_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.node.as_mut())
    }

    fn nodes(&self) -> impl Iterator<Item = (NodeId, &Node)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.node.as_ref().map(|node| {
                (
                    NodeId {
                        index: index as u32,
                        generation: slot.generation,
                    },
                    node,
                )
            })
        })
    }
}

/// An in-flight edge. Dropping it releases one reference on the edge.
#[must_use = "the edge is removed as soon as the guard is dropped"]
#[derive(Debug)]
pub(crate) struct EdgeGuard {
    from: NodeId,
    to: NodeId,
    epoch: u64,
    ticket: u64,
}

impl Drop for EdgeGuard {
    fn drop(&mut self) {
        QueueGraph::shared().remove_edge(self);
    }
}

/// One node of a reported cycle.
#[derive(Clone, Debug)]
pub struct CycleNode {
    pub id: NodeId,
    pub kind: NodeKind,
    pub label: Option<String>,
    /// Where the edge to the next node was created, when backtraces are on.
    pub backtrace: Option<Arc<Backtrace>>,
}

/// A cycle of wait relationships, each node waiting for the next one and
/// the last one waiting for the first.
#[derive(Clone, Debug)]
pub struct Cycle {
    pub nodes: Vec<CycleNode>,
}

impl Cycle {
    /// Checks if a node labelled `label` takes part in the cycle.
    pub fn contains_label(&self, label: &str) -> bool {
        self.nodes
            .iter()
            .any(|node| node.label.as_deref() == Some(label))
    }

    fn render(&self, with_labels: bool) -> String {
        let mut out = String::new();
        let first = self.nodes.first();
        for node in self.nodes.iter().chain(first) {
            if !out.is_empty() {
                out.push_str(" -> ");
            }
            let _ = write!(out, "{} {}", node.kind, node.id);
            if with_labels {
                if let Some(label) = &node.label {
                    let _ = write!(out, " '{}'", label);
                }
            }
        }
        out
    }
}

impl fmt::Display for Cycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render(true))
    }
}

// Copy of the graph taken under the lock for traversal outside it.
struct Snapshot {
    adjacency: Vec<(NodeId, Vec<NodeId>)>,
    info: HashMap<NodeId, (NodeKind, Option<String>)>,
    sites: HashMap<(NodeId, NodeId), Arc<Backtrace>>,
}

/// The process-wide queue dependency graph.
pub struct QueueGraph {
    state: AtomicU8,
    check_on_sync: AtomicBool,
    arena: Mutex<Arena>,
}

impl QueueGraph {
    /// Returns the shared graph, created with the configured state.
    pub fn shared() -> &'static QueueGraph {
        GRAPH.get_or_init(|| {
            let config = config::get();
            QueueGraph {
                state: AtomicU8::new(config.queue_graph.as_u8()),
                check_on_sync: AtomicBool::new(config.check_cycles_on_sync),
                arena: Mutex::new(Arena::default()),
            }
        })
    }

    /// Current bookkeeping state.
    pub fn state(&self) -> GraphState {
        GraphState::from_u8(self.state.load(Ordering::Relaxed))
    }

    /// Changes the bookkeeping state. Edges already recorded are kept.
    pub fn set_state(&self, state: GraphState) {
        let previous = self.state.swap(state.as_u8(), Ordering::Relaxed);
        if previous != state.as_u8() {
            tracing::debug!(?state, "queue graph state changed");
        }
    }

    /// Runs a cycle check every time an edge is added.
    pub fn set_check_cycles_on_sync(&self, enabled: bool) {
        self.check_on_sync.store(enabled, Ordering::Relaxed);
    }

    pub(crate) fn register(&self, kind: NodeKind, label: Option<&str>) -> NodeId {
        self.arena.lock().insert(Node {
            kind,
            label: label.map(str::to_owned),
            outgoing: HashMap::new(),
            incoming: HashSet::new(),
        })
    }

    /// Removes a node together with every edge touching it.
    pub(crate) fn unregister(&self, id: NodeId) {
        let mut arena = self.arena.lock();
        let Some(node) = arena.remove(id) else {
            return;
        };
        for to in node.outgoing.keys() {
            if let Some(target) = arena.get_mut(*to) {
                target.incoming.remove(&id);
            }
        }
        for from in &node.incoming {
            if let Some(source) = arena.get_mut(*from) {
                source.outgoing.remove(&id);
            }
        }
    }

    /// Records that `from` waits for `to` until the guard drops.
    ///
    /// Returns `None` when the graph is off or the edge would be a self loop.
    pub(crate) fn add_edge(&self, from: NodeId, to: NodeId) -> Option<EdgeGuard> {
        let state = self.state();
        if state == GraphState::Off || from == to {
            return None;
        }

        let guard = {
            let mut arena = self.arena.lock();
            if arena.get(from).is_none() || arena.get(to).is_none() {
                return None;
            }

            let ticket = arena.next_ticket;
            arena.next_ticket += 1;
            let epoch = arena.epoch;

            let site = (state == GraphState::WithBacktrace).then(|| Arc::new(Backtrace::force_capture()));
            if let Some(node) = arena.get_mut(from) {
                let edge = node.outgoing.entry(to).or_default();
                edge.count += 1;
                if let Some(site) = site {
                    edge.sites.push((ticket, site));
                }
            }
            if let Some(node) = arena.get_mut(to) {
                node.incoming.insert(from);
            }

            EdgeGuard {
                from,
                to,
                epoch,
                ticket,
            }
        };

        tracing::trace!(%from, %to, "edge added");
        if self.check_on_sync.load(Ordering::Relaxed) {
            self.check_tree_structure(true);
        }
        Some(guard)
    }

    /// Records that the innermost current queue of this thread waits for `to`.
    pub(crate) fn add_edge_from_current(&self, to: NodeId) -> Option<EdgeGuard> {
        if self.state() == GraphState::Off {
            return None;
        }
        let from = context::innermost_id()?;
        self.add_edge(from, to)
    }

    fn remove_edge(&self, guard: &EdgeGuard) {
        let mut arena = self.arena.lock();
        if arena.epoch != guard.epoch {
            return;
        }

        let Some(node) = arena.get_mut(guard.from) else {
            return;
        };
        let emptied = match node.outgoing.get_mut(&guard.to) {
            Some(edge) => {
                edge.count = edge.count.saturating_sub(1);
                edge.sites.retain(|(ticket, _)| *ticket != guard.ticket);
                edge.count == 0
            }
            None => false,
        };
        if emptied {
            node.outgoing.remove(&guard.to);
            if let Some(target) = arena.get_mut(guard.to) {
                target.incoming.remove(&guard.from);
            }
        }
    }

    /// Reference count of the edge `from -> to`, zero if absent.
    pub fn edge_count(&self, from: NodeId, to: NodeId) -> usize {
        self.arena
            .lock()
            .get(from)
            .and_then(|node| node.outgoing.get(&to))
            .map_or(0, |edge| edge.count)
    }

    /// Total number of edge references currently recorded.
    pub fn total_edges(&self) -> usize {
        self.arena
            .lock()
            .nodes()
            .flat_map(|(_, node)| node.outgoing.values())
            .map(|edge| edge.count)
            .sum()
    }

    /// Drops every recorded edge. Nodes stay registered; guards of edges
    /// created before the reset become no-ops.
    pub fn reset(&self) {
        let mut arena = self.arena.lock();
        arena.epoch += 1;
        for slot in arena.slots.iter_mut() {
            if let Some(node) = slot.node.as_mut() {
                node.outgoing.clear();
                node.incoming.clear();
            }
        }
        tracing::debug!("queue graph reset");
    }

    fn snapshot(&self) -> Snapshot {
        let arena = self.arena.lock();
        let mut snapshot = Snapshot {
            adjacency: Vec::new(),
            info: HashMap::new(),
            sites: HashMap::new(),
        };

        for (id, node) in arena.nodes() {
            snapshot.info.insert(id, (node.kind, node.label.clone()));
            if node.outgoing.is_empty() {
                continue;
            }
            let mut targets: Vec<NodeId> = node.outgoing.keys().copied().collect();
            targets.sort();
            for (to, edge) in &node.outgoing {
                if let Some((_, site)) = edge.sites.first() {
                    snapshot.sites.insert((id, *to), site.clone());
                }
            }
            snapshot.adjacency.push((id, targets));
        }
        snapshot.adjacency.sort_by_key(|(id, _)| *id);
        snapshot
    }

    /// Finds every distinct cycle in the graph.
    pub fn find_cycles(&self) -> Vec<Cycle> {
        let snapshot = self.snapshot();
        let adjacency: HashMap<NodeId, &[NodeId]> = snapshot
            .adjacency
            .iter()
            .map(|(id, targets)| (*id, targets.as_slice()))
            .collect();

        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Active,
            Done,
        }

        let mut marks: HashMap<NodeId, Mark> = HashMap::new();
        let mut seen: HashSet<Vec<NodeId>> = HashSet::new();
        let mut cycles = Vec::new();

        for (start, _) in &snapshot.adjacency {
            if marks.contains_key(start) {
                continue;
            }
            marks.insert(*start, Mark::Active);
            let mut stack: Vec<(NodeId, usize)> = vec![(*start, 0)];

            while let Some((node, next)) = stack.last().copied() {
                let targets = adjacency.get(&node).copied().unwrap_or(&[]);
                if next >= targets.len() {
                    marks.insert(node, Mark::Done);
                    stack.pop();
                    continue;
                }
                if let Some(top) = stack.last_mut() {
                    top.1 += 1;
                }

                let target = targets[next];
                match marks.get(&target) {
                    None => {
                        marks.insert(target, Mark::Active);
                        stack.push((target, 0));
                    }
                    Some(Mark::Active) => {
                        let begin = stack
                            .iter()
                            .position(|(id, _)| *id == target)
                            .unwrap_or(0);
                        let members: Vec<NodeId> = stack[begin..].iter().map(|(id, _)| *id).collect();
                        if seen.insert(canonical(&members)) {
                            cycles.push(self.describe(&snapshot, &members));
                        }
                    }
                    Some(Mark::Done) => {}
                }
            }
        }

        cycles
    }

    fn describe(&self, snapshot: &Snapshot, members: &[NodeId]) -> Cycle {
        let nodes = members
            .iter()
            .enumerate()
            .map(|(i, id)| {
                let next = members[(i + 1) % members.len()];
                let (kind, label) = snapshot
                    .info
                    .get(id)
                    .cloned()
                    .unwrap_or((NodeKind::Queue, None));
                CycleNode {
                    id: *id,
                    kind,
                    label,
                    backtrace: snapshot.sites.get(&(*id, next)).cloned(),
                }
            })
            .collect();
        Cycle { nodes }
    }

    /// Checks that the graph is free of cycles.
    ///
    /// With `log` set, every cycle found is reported through `tracing::warn!`.
    ///
    /// # Returns
    /// `true` if no cycle exists.
    pub fn check_tree_structure(&self, log: bool) -> bool {
        let cycles = self.find_cycles();
        if log {
            let state = self.state();
            for cycle in &cycles {
                tracing::warn!(
                    "queue dependency cycle, threads involved are deadlocked: {}",
                    cycle.render(state >= GraphState::WithLabels)
                );
                if state == GraphState::WithBacktrace {
                    for node in &cycle.nodes {
                        if let Some(backtrace) = &node.backtrace {
                            tracing::warn!("wait of {} {} created at:\n{}", node.kind, node.id, backtrace);
                        }
                    }
                }
            }
        }
        cycles.is_empty()
    }

    /// Renders every node that currently waits for another node.
    pub fn dump(&self) -> String {
        let snapshot = self.snapshot();
        let mut out = String::new();

        let name = |id: &NodeId| match snapshot.info.get(id) {
            Some((kind, Some(label))) => format!("{} {} '{}'", kind, id, label),
            Some((kind, None)) => format!("{} {}", kind, id),
            None => format!("{}", id),
        };

        for (from, targets) in &snapshot.adjacency {
            let _ = write!(out, "{} ->", name(from));
            for to in targets {
                let _ = write!(out, " {}", name(to));
            }
            out.push('\n');
        }
        if out.is_empty() {
            out.push_str("no edges\n");
        }
        out
    }
}

// Rotation of a cycle starting at its smallest id.
fn canonical(members: &[NodeId]) -> Vec<NodeId> {
    let start = members
        .iter()
        .enumerate()
        .min_by_key(|(_, id)| **id)
        .map_or(0, |(i, _)| i);
    members[start..].iter().chain(&members[..start]).copied().collect()
}
