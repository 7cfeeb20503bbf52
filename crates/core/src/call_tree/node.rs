use std::collections::{HashMap, HashSet};
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::call_tree::CallSite;
use crate::model::{Function, FunctionDebugInfo, ThreadId};
use crate::shared_str::SharedStr;

pub type NodeId = u64;

/// Identity of a node instance, used for "already counted" sets.
pub(crate) type NodePtr = *const CallTreeNode;

pub(crate) fn node_ptr(node: &Arc<CallTreeNode>) -> NodePtr {
    Arc::as_ptr(node)
}

/// Execution context a node was first observed in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum NodeKind {
    #[default]
    Unset = 0,
    NativeUser = 1,
    NativeKernel = 2,
    Managed = 3,
}

impl NodeKind {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::NativeUser,
            2 => Self::NativeKernel,
            3 => Self::Managed,
            _ => Self::Unset,
        }
    }
}

/// Inclusive and exclusive weight observed on one thread.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ThreadWeight {
    pub weight: Duration,
    pub exclusive_weight: Duration,
}

pub(crate) fn accumulate_thread_weight(
    map: &mut HashMap<ThreadId, ThreadWeight>,
    thread_id: ThreadId,
    weight: Duration,
    exclusive_weight: Duration,
) {
    let entry = map.entry(thread_id).or_default();
    entry.weight += weight;
    entry.exclusive_weight += exclusive_weight;
}

fn to_nanos(d: Duration) -> u64 {
    u64::try_from(d.as_nanos()).unwrap_or(u64::MAX)
}

/// Mutable per-node state, guarded by the node's own lock.
#[derive(Default)]
struct NodeState {
    children: Vec<Arc<CallTreeNode>>,
    /// Non-owning; empty for roots and for synthetic aggregate nodes.
    caller: Weak<CallTreeNode>,
    call_sites: HashMap<u64, CallSite>,
    thread_weights: HashMap<ThreadId, ThreadWeight>,
}

/// One (function, call path) instance in a [`crate::CallTree`].
///
/// Weights are lock-free accumulators; children, the caller link, call sites
/// and thread weights sit behind a per-node mutex so ingestion workers only
/// contend when they touch the same node.
pub struct CallTreeNode {
    id: NodeId,
    function: Function,
    debug_info: Option<FunctionDebugInfo>,
    kind: AtomicU8,
    weight: AtomicU64,
    exclusive_weight: AtomicU64,
    state: Mutex<NodeState>,
}

impl CallTreeNode {
    pub(crate) fn new(
        id: NodeId,
        function: Function,
        debug_info: Option<FunctionDebugInfo>,
        caller: Weak<CallTreeNode>,
    ) -> Self {
        Self {
            id,
            function,
            debug_info,
            kind: AtomicU8::new(NodeKind::Unset as u8),
            weight: AtomicU64::new(0),
            exclusive_weight: AtomicU64::new(0),
            state: Mutex::new(NodeState {
                caller,
                ..NodeState::default()
            }),
        }
    }

    /// A node with no place in any tree, used for combined child/caller lists.
    pub(crate) fn detached(
        id: NodeId,
        function: Function,
        debug_info: Option<FunctionDebugInfo>,
        kind: NodeKind,
    ) -> Self {
        let node = Self::new(id, function, debug_info, Weak::new());
        node.kind.store(kind as u8, Ordering::Relaxed);
        node
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn function(&self) -> &Function {
        &self.function
    }

    pub fn function_name(&self) -> &SharedStr {
        self.function.name()
    }

    pub fn module_name(&self) -> &SharedStr {
        self.function.module()
    }

    pub fn debug_info(&self) -> Option<&FunctionDebugInfo> {
        self.debug_info.as_ref()
    }

    pub fn kind(&self) -> NodeKind {
        NodeKind::from_u8(self.kind.load(Ordering::Relaxed))
    }

    /// Sticky first write: later classifications are ignored.
    pub fn set_kind_if_unset(&self, kind: NodeKind) -> bool {
        self.kind
            .compare_exchange(
                NodeKind::Unset as u8,
                kind as u8,
                Ordering::Relaxed,
                Ordering::Relaxed,
            )
            .is_ok()
    }

    pub fn weight(&self) -> Duration {
        Duration::from_nanos(self.weight.load(Ordering::Relaxed))
    }

    pub fn exclusive_weight(&self) -> Duration {
        Duration::from_nanos(self.exclusive_weight.load(Ordering::Relaxed))
    }

    pub fn accumulate_weight(&self, weight: Duration) {
        self.weight.fetch_add(to_nanos(weight), Ordering::Relaxed);
    }

    pub fn accumulate_exclusive_weight(&self, weight: Duration) {
        self.exclusive_weight
            .fetch_add(to_nanos(weight), Ordering::Relaxed);
    }

    /// Per-thread breakdown; does not touch the node totals.
    pub fn accumulate_thread_weight(
        &self,
        weight: Duration,
        exclusive_weight: Duration,
        thread_id: ThreadId,
    ) {
        let mut state = self.state.lock();
        accumulate_thread_weight(&mut state.thread_weights, thread_id, weight, exclusive_weight);
    }

    /// Get or create the child for `function` under this node.
    ///
    /// `next_id` is only called when a new node is created. Returns the child
    /// and whether it was created by this call.
    pub fn add_child(
        self: &Arc<Self>,
        function: &Function,
        debug_info: Option<&FunctionDebugInfo>,
        next_id: impl FnOnce() -> NodeId,
    ) -> (Arc<CallTreeNode>, bool) {
        let mut state = self.state.lock();
        if let Some(existing) = state.children.iter().find(|c| c.function == *function) {
            return (Arc::clone(existing), false);
        }

        let child = Arc::new(CallTreeNode::new(
            next_id(),
            function.clone(),
            debug_info.cloned(),
            Arc::downgrade(self),
        ));
        state.children.push(Arc::clone(&child));
        (child, true)
    }

    /// Credit `weight` to `target`'s function at the call instruction `offset`.
    pub fn add_call_site(&self, target: &Arc<CallTreeNode>, offset: u64, weight: Duration) {
        let mut state = self.state.lock();
        state
            .call_sites
            .entry(offset)
            .or_insert_with(|| CallSite::new(offset))
            .add_target(target, weight);
    }

    pub fn children(&self) -> Vec<Arc<CallTreeNode>> {
        self.state.lock().children.clone()
    }

    pub fn child_count(&self) -> usize {
        self.state.lock().children.len()
    }

    pub fn has_children(&self) -> bool {
        self.child_count() > 0
    }

    pub fn find_child(&self, function: &Function) -> Option<Arc<CallTreeNode>> {
        self.state
            .lock()
            .children
            .iter()
            .find(|c| c.function == *function)
            .cloned()
    }

    pub fn has_child(&self, node: &Arc<CallTreeNode>) -> bool {
        self.state.lock().children.iter().any(|c| Arc::ptr_eq(c, node))
    }

    pub fn caller(&self) -> Option<Arc<CallTreeNode>> {
        self.state.lock().caller.upgrade()
    }

    pub fn has_caller(&self) -> bool {
        self.caller().is_some()
    }

    pub(crate) fn set_caller(&self, caller: &Arc<CallTreeNode>) {
        self.state.lock().caller = Arc::downgrade(caller);
    }

    /// Callers from the immediate parent up to the root.
    pub fn ancestors(&self) -> impl Iterator<Item = Arc<CallTreeNode>> {
        std::iter::successors(self.caller(), |node| node.caller())
    }

    pub fn call_sites(&self) -> HashMap<u64, CallSite> {
        self.state.lock().call_sites.clone()
    }

    pub fn has_call_sites(&self) -> bool {
        !self.state.lock().call_sites.is_empty()
    }

    pub fn thread_weights(&self) -> HashMap<ThreadId, ThreadWeight> {
        self.state.lock().thread_weights.clone()
    }

    pub fn has_thread_weights(&self) -> bool {
        !self.state.lock().thread_weights.is_empty()
    }

    pub fn sorted_by_weight_thread_weights(&self) -> Vec<(ThreadId, ThreadWeight)> {
        let mut list: Vec<_> = self.thread_weights().into_iter().collect();
        list.sort_by(|a, b| b.1.weight.cmp(&a.1.weight).then(a.0.cmp(&b.0)));
        list
    }

    pub fn sorted_by_id_thread_weights(&self) -> Vec<(ThreadId, ThreadWeight)> {
        let mut list: Vec<_> = self.thread_weights().into_iter().collect();
        list.sort_by_key(|(thread_id, _)| *thread_id);
        list
    }

    /// Summed (inclusive, exclusive) weight of the direct children.
    pub fn children_weight(&self) -> (Duration, Duration) {
        let state = self.state.lock();
        state.children.iter().fold(
            (Duration::ZERO, Duration::ZERO),
            |(weight, exclusive), child| {
                (weight + child.weight(), exclusive + child.exclusive_weight())
            },
        )
    }

    /// `weight` as a fraction of this node's inclusive weight.
    pub fn scale_weight(&self, weight: Duration) -> f64 {
        let total = self.weight();
        if total.is_zero() {
            return 0.0;
        }
        weight.as_secs_f64() / total.as_secs_f64()
    }

    /// Fold `other` (a node from another tree for the same call path) into
    /// this one. Matching children are merged, the rest are adopted.
    ///
    /// Every node whose data was folded in is recorded in `absorbed`, so the
    /// tree-level merge can keep it out of the function index.
    pub(crate) fn merge_with(self: &Arc<Self>, other: &Arc<Self>, absorbed: &mut HashSet<NodePtr>) {
        let mut pending = vec![(Arc::clone(self), Arc::clone(other))];

        while let Some((target, source)) = pending.pop() {
            absorbed.insert(node_ptr(&source));
            target.accumulate_weight(source.weight());
            target.accumulate_exclusive_weight(source.exclusive_weight());
            target.set_kind_if_unset(source.kind());

            let (children, call_sites, thread_weights) = {
                let state = source.state.lock();
                (
                    state.children.clone(),
                    state.call_sites.clone(),
                    state.thread_weights.clone(),
                )
            };

            for child in children {
                match target.find_child(&child.function) {
                    Some(existing) => pending.push((existing, child)),
                    None => {
                        child.set_caller(&target);
                        target.state.lock().children.push(child);
                    }
                }
            }

            // Point merged call-site targets at this tree's children.
            for (offset, site) in call_sites {
                let retargeted = site.retarget(|function| target.find_child(function));
                let mut state = target.state.lock();
                match state.call_sites.get_mut(&offset) {
                    Some(existing) => existing.merge_with(&retargeted),
                    None => {
                        state.call_sites.insert(offset, retargeted);
                    }
                }
            }

            let mut state = target.state.lock();
            for (thread_id, tw) in thread_weights {
                accumulate_thread_weight(
                    &mut state.thread_weights,
                    thread_id,
                    tw.weight,
                    tw.exclusive_weight,
                );
            }
        }
    }

    /// Indented structural dump of this node and its subtree.
    pub(crate) fn print(self: &Arc<Self>, out: &mut String, level: usize) {
        let mut stack = vec![(Arc::clone(self), level)];

        while let Some((node, level)) = stack.pop() {
            let indent = " ".repeat(level * 4);
            let rva = node.debug_info.as_ref().map_or(0, |d| d.rva);
            let children = node.children();
            let _ = writeln!(out, "{indent}{}, RVA {rva:#x}, Id {}", node.function, node.id);
            let _ = writeln!(out, "{indent}    weight {}", node.weight().as_secs_f64() * 1000.0);
            let _ = writeln!(
                out,
                "{indent}    exc weight {}",
                node.exclusive_weight().as_secs_f64() * 1000.0
            );
            let _ = writeln!(out, "{indent}    callees: {}", children.len());

            // Reversed so the first child is printed first.
            for child in children.into_iter().rev() {
                stack.push((child, level + 1));
            }
        }
    }
}

impl std::fmt::Debug for CallTreeNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallTreeNode")
            .field("id", &self.id)
            .field("function", &self.function)
            .field("kind", &self.kind())
            .field("weight", &self.weight())
            .field("exclusive_weight", &self.exclusive_weight())
            .finish_non_exhaustive()
    }
}

impl std::fmt::Display for CallTreeNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let rva = self.debug_info.as_ref().map_or(0, |d| d.rva);
        let state = self.state.lock();
        write!(
            f,
            "{}, RVA {rva:#x}, Id {}, weight {:?}, exc weight {:?}, children {}, call sites {}",
            self.function,
            self.id,
            self.weight(),
            self.exclusive_weight(),
            state.children.len(),
            state.call_sites.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn root(name: &str) -> Arc<CallTreeNode> {
        Arc::new(CallTreeNode::new(1, Function::new(name, "app"), None, Weak::new()))
    }

    #[test]
    fn add_child_is_get_or_create() {
        let parent = root("main");
        let f = Function::new("work", "app");
        let (a, created_a) = parent.add_child(&f, None, || 2);
        let (b, created_b) = parent.add_child(&f, None, || 3);
        assert!(created_a);
        assert!(!created_b);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.id(), 2);
        assert_eq!(parent.child_count(), 1);
        assert!(a.caller().is_some_and(|c| Arc::ptr_eq(&c, &parent)));
    }

    #[test]
    fn kind_is_sticky() {
        let node = root("main");
        assert!(node.set_kind_if_unset(NodeKind::Managed));
        assert!(!node.set_kind_if_unset(NodeKind::NativeKernel));
        assert_eq!(node.kind(), NodeKind::Managed);
    }

    #[test]
    fn thread_weights_sorted_by_weight() {
        let node = root("main");
        node.accumulate_thread_weight(Duration::from_millis(7), Duration::ZERO, 1);
        node.accumulate_thread_weight(Duration::from_millis(13), Duration::ZERO, 2);
        let sorted = node.sorted_by_weight_thread_weights();
        assert_eq!(sorted[0].0, 2);
        assert_eq!(sorted[0].1.weight, Duration::from_millis(13));
        assert_eq!(sorted[1].0, 1);
        assert_eq!(node.sorted_by_id_thread_weights()[0].0, 1);
    }

    #[test]
    fn call_sites_merge_targets_by_function() {
        let parent = root("main");
        let f = Function::new("callee", "app");
        let (child, _) = parent.add_child(&f, None, || 2);
        parent.add_call_site(&child, 0x40, Duration::from_millis(3));
        parent.add_call_site(&child, 0x40, Duration::from_millis(4));
        let sites = parent.call_sites();
        let site = &sites[&0x40];
        assert!(site.has_single_target());
        assert_eq!(site.weight(), Duration::from_millis(7));
    }

    #[test]
    fn scale_weight_handles_zero_total() {
        let node = root("main");
        assert_eq!(node.scale_weight(Duration::from_millis(5)), 0.0);
        node.accumulate_weight(Duration::from_millis(20));
        assert!((node.scale_weight(Duration::from_millis(5)) - 0.25).abs() < 1e-9);
    }

    #[test]
    fn merge_adopts_missing_children_and_sums_common_ones() {
        let a = root("main");
        let b = root("main");
        let shared = Function::new("shared", "app");
        let only_b = Function::new("only_b", "app");

        let (a_shared, _) = a.add_child(&shared, None, || 10);
        a_shared.accumulate_weight(Duration::from_millis(4));
        let (b_shared, _) = b.add_child(&shared, None, || 20);
        b_shared.accumulate_weight(Duration::from_millis(6));
        let (b_only, _) = b.add_child(&only_b, None, || 21);
        b_only.accumulate_weight(Duration::from_millis(1));

        let mut absorbed = HashSet::new();
        a.merge_with(&b, &mut absorbed);

        assert_eq!(a.child_count(), 2);
        assert_eq!(a_shared.weight(), Duration::from_millis(10));
        assert!(absorbed.contains(&node_ptr(&b_shared)));
        assert!(!absorbed.contains(&node_ptr(&b_only)));
        let adopted = a.find_child(&only_b);
        assert!(adopted.is_some_and(|n| n.caller().is_some_and(|c| Arc::ptr_eq(&c, &a))));
    }
}
