use std::cmp::Reverse;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use crate::call_tree::node::{NodePtr, accumulate_thread_weight, node_ptr};
use crate::call_tree::{CallSite, CallTreeNode, GroupNode, NodeKind, NodeView};
use crate::model::Function;

/// Knobs for [`combine_nodes`].
#[derive(Debug, Clone)]
pub struct CombineOptions {
    /// Also union children, callers, call sites and thread weights.
    pub combine_lists: bool,
    /// Only combine instances that sit below this node (or group of nodes).
    pub parent: Option<NodeView>,
}

impl Default for CombineOptions {
    fn default() -> Self {
        Self {
            combine_lists: true,
            parent: None,
        }
    }
}

impl CombineOptions {
    pub fn weights_only() -> Self {
        Self {
            combine_lists: false,
            parent: None,
        }
    }

    pub fn under(parent: NodeView) -> Self {
        Self {
            combine_lists: true,
            parent: Some(parent),
        }
    }
}

/// Synthetic per-function aggregate for combined child/caller lists.
#[derive(Default)]
struct FunctionUnion {
    order: Vec<Arc<CallTreeNode>>,
    index: HashMap<Function, usize>,
}

impl FunctionUnion {
    fn add(&mut self, node: &CallTreeNode) {
        let slot = match self.index.get(node.function()) {
            Some(&slot) => slot,
            None => {
                self.order.push(Arc::new(CallTreeNode::detached(
                    node.id(),
                    node.function().clone(),
                    node.debug_info().cloned(),
                    node.kind(),
                )));
                self.index.insert(node.function().clone(), self.order.len() - 1);
                self.order.len() - 1
            }
        };
        let entry = &self.order[slot];
        entry.accumulate_weight(node.weight());
        entry.accumulate_exclusive_weight(node.exclusive_weight());
    }
}

/// True when an instance of the recursion already counted `node`'s
/// inclusive time: some strict ancestor was handled.
fn parent_was_handled(node: &NodeView, handled: &HashSet<NodePtr>) -> bool {
    match node {
        NodeView::Real(node) => node.ancestors().any(|a| handled.contains(&node_ptr(&a))),
        NodeView::Group(_) => false,
    }
}

fn is_descendant_of(node: &NodeView, parents: &HashSet<NodePtr>) -> bool {
    match node {
        NodeView::Real(node) => node.ancestors().any(|a| parents.contains(&node_ptr(&a))),
        NodeView::Group(_) => false,
    }
}

fn depth(node: &NodeView) -> usize {
    match node {
        NodeView::Real(node) => node.ancestors().count(),
        NodeView::Group(_) => 0,
    }
}

/// Heaviest first; equal weights keep ancestors ahead of their descendants.
pub(crate) fn sort_outermost_first(nodes: &mut [NodeView]) {
    nodes.sort_by_cached_key(|node| (Reverse(node.weight()), depth(node)));
}

/// Combine instances of one function into a single view without counting
/// recursive inclusive time twice.
///
/// Instances are processed heaviest first, so the outermost instance of a
/// recursion is counted and any instance below an already-counted one only
/// contributes exclusive time.
pub fn combine_nodes(nodes: &[NodeView], options: &CombineOptions) -> NodeView {
    match nodes {
        [] => return NodeView::from(GroupNode::default()),
        [single] => return single.clone(),
        _ => {}
    }

    let mut sorted = nodes.to_vec();
    sort_outermost_first(&mut sorted);

    let parents: Option<HashSet<NodePtr>> = options.parent.as_ref().map(|parent| {
        parent
            .real_instances()
            .iter()
            .map(node_ptr)
            .collect()
    });

    let mut handled: HashSet<NodePtr> = HashSet::new();
    let mut instances = Vec::with_capacity(sorted.len());
    let mut weight = Duration::ZERO;
    let mut exclusive_weight = Duration::ZERO;
    let mut kind = NodeKind::Unset;
    let mut children = FunctionUnion::default();
    let mut callers = FunctionUnion::default();
    let mut call_sites: HashMap<u64, CallSite> = HashMap::new();
    let mut thread_weights = HashMap::new();

    for node in &sorted {
        if let Some(parents) = &parents
            && !is_descendant_of(node, parents)
        {
            continue;
        }

        let count_weight = !parent_was_handled(node, &handled);
        if count_weight {
            weight += node.weight();
            if let NodeView::Real(real) = node {
                handled.insert(node_ptr(real));
            }
        }

        exclusive_weight += node.exclusive_weight();
        if kind == NodeKind::Unset {
            kind = node.kind();
        }
        instances.push(node.clone());

        if !options.combine_lists {
            continue;
        }

        for (thread_id, tw) in node.thread_weights() {
            let inclusive = if count_weight { tw.weight } else { Duration::ZERO };
            accumulate_thread_weight(&mut thread_weights, thread_id, inclusive, tw.exclusive_weight);
        }

        for child in node.children() {
            children.add(&child);
        }

        for caller in node.callers() {
            callers.add(&caller);
        }

        for (offset, site) in node.call_sites() {
            call_sites
                .entry(offset)
                .or_insert_with(|| CallSite::new(offset))
                .merge_with(&site);
        }
    }

    let first = &sorted[0];
    NodeView::from(GroupNode {
        function: first.function().cloned(),
        debug_info: first.debug_info().cloned(),
        kind,
        weight,
        exclusive_weight,
        instances,
        children: children.order,
        callers: callers.order,
        call_sites,
        thread_weights,
    })
}
