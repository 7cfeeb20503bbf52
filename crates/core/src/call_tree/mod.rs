//! The call tree: ingestion, per-function instance index, and queries.

mod call_site;
mod combine;
mod group;
mod node;
mod report;

use std::collections::{HashMap, HashSet};
use std::fmt::Write as _;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use log::{debug, error, warn};
use parking_lot::RwLock;

pub use call_site::{CallSite, CallSiteTarget};
pub use combine::{CombineOptions, combine_nodes};
pub use group::{GroupNode, NodeView};
pub use node::{CallTreeNode, NodeId, NodeKind, ThreadWeight};
pub use report::{FunctionSummary, ModuleProfileInfo, TopFunctionsAndModules, top_functions_and_modules};

use crate::model::{FrameInfo, Function, ProfileSample, ResolvedStack, StackSample};
use node::{NodePtr, node_ptr};

/// Weighted call tree built from sampled stacks.
///
/// `update_call_tree` takes `&self` and may be called from many threads at
/// once; roots and the function index are sharded maps and every node has
/// its own lock.
pub struct CallTree {
    root_nodes: DashMap<Function, Arc<CallTreeNode>>,
    func_to_nodes: DashMap<Function, Vec<Arc<CallTreeNode>>>,
    /// Built on the first `find_node`, dropped whenever nodes are added.
    node_index: RwLock<Option<HashMap<NodeId, Arc<CallTreeNode>>>>,
    next_node_id: AtomicU64,
}

impl CallTree {
    pub fn new() -> Self {
        Self::with_start_id(0)
    }

    /// Trees that will be merged later should use disjoint id ranges so the
    /// id index stays unambiguous.
    pub fn with_start_id(start_id: NodeId) -> Self {
        Self {
            root_nodes: DashMap::new(),
            func_to_nodes: DashMap::new(),
            node_index: RwLock::new(None),
            next_node_id: AtomicU64::new(start_id),
        }
    }

    /// Roots in creation order.
    pub fn root_nodes(&self) -> Vec<Arc<CallTreeNode>> {
        let mut roots: Vec<_> = self.root_nodes.iter().map(|r| Arc::clone(r.value())).collect();
        roots.sort_by_key(|n| n.id());
        roots
    }

    pub fn total_root_nodes_weight(&self) -> Duration {
        self.root_nodes.iter().map(|r| r.value().weight()).sum()
    }

    pub fn find_root_node(&self, function: &Function) -> Option<Arc<CallTreeNode>> {
        self.root_nodes.get(function).map(|r| Arc::clone(r.value()))
    }

    /// Every function with at least one instance, sorted.
    pub fn functions(&self) -> Vec<Function> {
        let mut functions: Vec<_> = self.func_to_nodes.iter().map(|e| e.key().clone()).collect();
        functions.sort();
        functions
    }

    /// Number of node instances in the tree.
    pub fn node_count(&self) -> usize {
        self.func_to_nodes.iter().map(|e| e.value().len()).sum()
    }

    pub fn ingest(&self, sample: &StackSample) {
        self.update_call_tree(&sample.sample, &sample.stack);
    }

    /// Fold one sample into the tree.
    ///
    /// Frames are walked root to leaf. Every node on the path gets the
    /// sample's weight as inclusive time; only the innermost usable frame gets
    /// exclusive time. Frames without an address or debug info are skipped.
    pub fn update_call_tree(&self, sample: &ProfileSample, stack: &ResolvedStack) {
        let weight = sample.weight;
        let thread_id = stack.context.thread_id;
        let mut prev: Option<(Arc<CallTreeNode>, &FrameInfo)> = None;

        for frame in stack.frames.iter().rev() {
            if !frame.is_usable() {
                continue;
            }

            let node = match &prev {
                None => self.add_root_node(frame),
                Some((prev_node, prev_frame)) => {
                    let node = self.add_child_node(prev_node, frame);
                    prev_node.add_call_site(&node, prev_frame.frame_offset, weight);
                    node
                }
            };

            node.accumulate_weight(weight);
            node.accumulate_thread_weight(weight, Duration::ZERO, thread_id);
            node.set_kind_if_unset(frame.node_kind());
            prev = Some((node, frame));
        }

        if let Some((leaf, _)) = prev {
            leaf.accumulate_exclusive_weight(weight);
            leaf.accumulate_thread_weight(Duration::ZERO, weight, thread_id);
        }
    }

    fn allocate_id(&self) -> NodeId {
        self.next_node_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn add_root_node(&self, frame: &FrameInfo) -> Arc<CallTreeNode> {
        if let Some(existing) = self.root_nodes.get(&frame.function) {
            return Arc::clone(existing.value());
        }

        let mut created = false;
        let node = Arc::clone(
            self.root_nodes
                .entry(frame.function.clone())
                .or_insert_with(|| {
                    created = true;
                    Arc::new(CallTreeNode::new(
                        self.allocate_id(),
                        frame.function.clone(),
                        frame.debug_info.clone(),
                        std::sync::Weak::new(),
                    ))
                })
                .value(),
        );

        if created {
            self.register_node(&node);
        }
        node
    }

    fn add_child_node(&self, parent: &Arc<CallTreeNode>, frame: &FrameInfo) -> Arc<CallTreeNode> {
        let (child, created) =
            parent.add_child(&frame.function, frame.debug_info.as_ref(), || self.allocate_id());
        if created {
            self.register_node(&child);
        }
        child
    }

    fn register_node(&self, node: &Arc<CallTreeNode>) {
        self.func_to_nodes
            .entry(node.function().clone())
            .or_default()
            .push(Arc::clone(node));
        self.invalidate_node_index();
    }

    fn invalidate_node_index(&self) {
        let built = self.node_index.read().is_some();
        if built {
            *self.node_index.write() = None;
        }
    }

    fn build_node_index(&self) -> HashMap<NodeId, Arc<CallTreeNode>> {
        let mut index = HashMap::with_capacity(self.node_count());
        for entry in self.func_to_nodes.iter() {
            for node in entry.value() {
                if let Some(previous) = index.insert(node.id(), Arc::clone(node)) {
                    warn!(
                        "node id {} shared by {} and {}; keeping the latter",
                        node.id(),
                        previous.function(),
                        node.function()
                    );
                }
            }
        }
        debug!("built call tree node index with {} entries", index.len());
        index
    }

    pub fn find_node(&self, id: NodeId) -> Option<Arc<CallTreeNode>> {
        if let Some(index) = self.node_index.read().as_ref() {
            return index.get(&id).cloned();
        }

        let mut guard = self.node_index.write();
        let index = guard.get_or_insert_with(|| self.build_node_index());
        index.get(&id).cloned()
    }

    /// Locate the node in this tree whose call path (by function, up to the
    /// root) matches `query`, typically a node from another tree built for
    /// the same program.
    pub fn find_matching_node(&self, query: &NodeView) -> Option<Arc<CallTreeNode>> {
        let NodeView::Real(query) = query else {
            return None;
        };

        let Some(candidates) = self.func_to_nodes.get(query.function()) else {
            warn!("no instances of {} in this call tree", query.function());
            return None;
        };

        candidates
            .value()
            .iter()
            .find(|node| Arc::ptr_eq(node, query) || same_call_path(node, query))
            .cloned()
    }

    /// Every instance of `function` anywhere in the tree, in creation order.
    pub fn get_call_tree_nodes(&self, function: &Function) -> Vec<Arc<CallTreeNode>> {
        self.func_to_nodes
            .get(function)
            .map(|nodes| nodes.value().clone())
            .unwrap_or_default()
    }

    /// Instances of `function`, heaviest first.
    pub fn get_sorted_call_tree_nodes(&self, function: &Function) -> Vec<Arc<CallTreeNode>> {
        let mut nodes = self.get_call_tree_nodes(function);
        nodes.sort_by(|a, b| b.weight().cmp(&a.weight()));
        nodes
    }

    /// All instances of `function` combined into one view, optionally only
    /// those below `parent`.
    pub fn get_combined_call_tree_node(
        &self,
        function: &Function,
        parent: Option<&NodeView>,
    ) -> NodeView {
        let nodes: Vec<NodeView> = self
            .get_sorted_call_tree_nodes(function)
            .into_iter()
            .map(NodeView::Real)
            .collect();
        let options = CombineOptions {
            combine_lists: true,
            parent: parent.cloned(),
        };
        combine_nodes(&nodes, &options)
    }

    pub fn combined_call_tree_node_weight(&self, function: &Function) -> Duration {
        let nodes: Vec<NodeView> = self
            .get_call_tree_nodes(function)
            .into_iter()
            .map(NodeView::Real)
            .collect();
        combine_nodes(&nodes, &CombineOptions::weights_only()).weight()
    }

    pub fn combined_call_tree_nodes(nodes: &[NodeView], combine_lists: bool) -> NodeView {
        let options = CombineOptions {
            combine_lists,
            parent: None,
        };
        combine_nodes(nodes, &options)
    }

    pub fn combined_call_tree_nodes_weight(nodes: &[NodeView]) -> Duration {
        combine_nodes(nodes, &CombineOptions::weights_only()).weight()
    }

    /// Callers from the immediate parent up to the root. Empty for a group of
    /// several instances, which has no single backtrace.
    pub fn get_backtrace(&self, node: &NodeView) -> Vec<Arc<CallTreeNode>> {
        match node {
            NodeView::Real(node) => node.ancestors().collect(),
            NodeView::Group(group) => match group.instances() {
                [single] => self.get_backtrace(single),
                _ => Vec::new(),
            },
        }
    }

    pub fn get_top_functions_and_modules(&self, node: &NodeView) -> TopFunctionsAndModules {
        top_functions_and_modules(node)
    }

    pub fn top_functions(&self, node: &NodeView) -> Vec<NodeView> {
        top_functions_and_modules(node).functions
    }

    pub fn top_modules(&self, node: &NodeView) -> Vec<ModuleProfileInfo> {
        top_functions_and_modules(node).modules
    }

    /// Fold `other` into this tree. Common roots are merged child by child,
    /// other roots and subtrees are adopted as-is. Nothing is removed.
    pub fn merge_with(&mut self, other: CallTree) {
        let CallTree {
            root_nodes,
            func_to_nodes,
            next_node_id,
            ..
        } = other;

        let mut absorbed: HashSet<NodePtr> = HashSet::new();
        let mut other_roots: Vec<_> = root_nodes.into_iter().collect();
        other_roots.sort_by_key(|(_, node)| node.id());

        for (function, root) in other_roots {
            match self.find_root_node(&function) {
                Some(existing) => existing.merge_with(&root, &mut absorbed),
                None => {
                    self.root_nodes.insert(function, root);
                }
            }
        }

        let existing: HashSet<NodePtr> = self
            .func_to_nodes
            .iter()
            .flat_map(|e| e.value().iter().map(node_ptr).collect::<Vec<_>>())
            .collect();

        let mut adopted = 0usize;
        for (function, nodes) in func_to_nodes {
            let mut list = self.func_to_nodes.entry(function).or_default();
            for node in nodes {
                let ptr = node_ptr(&node);
                if !absorbed.contains(&ptr) && !existing.contains(&ptr) {
                    list.push(node);
                    adopted += 1;
                }
            }
        }

        self.next_node_id
            .fetch_max(next_node_id.into_inner(), Ordering::Relaxed);
        *self.node_index.get_mut() = None;
        debug!(
            "merged call tree: {} nodes folded in, {} adopted",
            absorbed.len(),
            adopted
        );
    }

    /// Indented text dump for diagnostics. Not a stable format.
    pub fn print(&self) -> String {
        let mut out = String::new();
        for root in self.root_nodes() {
            out.push_str("Call tree root node\n");
            out.push_str("-----------------------\n");
            root.print(&mut out, 0);
        }
        out
    }

    /// Debug check that no node is reachable twice from a root.
    ///
    /// A cycle means `add_child` or caller-link maintenance is broken; it is
    /// logged and asserted, and `false` is returned in release builds.
    pub fn verify_cycles(&self) -> bool {
        let mut visited: HashSet<NodePtr> = HashSet::new();

        for root in self.root_nodes() {
            visited.clear();
            let mut stack = vec![root];
            while let Some(node) = stack.pop() {
                if !visited.insert(node_ptr(&node)) {
                    error!("found cycle in call tree at node {node}");
                    debug_assert!(false, "cycle in call tree at node {}", node.id());
                    return false;
                }
                stack.extend(node.children());
            }
        }
        true
    }

    /// Every instance of a function called `name` (any module), heaviest
    /// first, with totals and optionally each instance's stack.
    pub fn print_node_instances(&self, name: &str, print_stack: bool) -> String {
        let mut list = self.collect_node_instances(name);
        list.sort_by(|a, b| b.weight().cmp(&a.weight()));

        let weight: Duration = list.iter().map(|n| n.weight()).sum();
        let exclusive: Duration = list.iter().map(|n| n.exclusive_weight()).sum();

        let mut out = String::new();
        let _ = writeln!(out, "Instances for {name}: {}", list.len());
        let _ = writeln!(
            out,
            " - Total weight: {weight:?}, excl weight: {exclusive:?}"
        );

        for node in &list {
            let _ = writeln!(
                out,
                " - Weight: {:?}, excl weight: {:?}, children: {}",
                node.weight(),
                node.exclusive_weight(),
                node.child_count()
            );
            if print_stack {
                let _ = writeln!(out, "  - Stack:");
                let _ = writeln!(out, "     0: {}", node.function_name());
                for (index, caller) in node.ancestors().enumerate() {
                    let _ = writeln!(out, "     {}: {}", index + 1, caller.function_name());
                }
                let _ = writeln!(out, "  ------------------------------");
            }
        }
        out
    }

    fn collect_node_instances(&self, name: &str) -> Vec<Arc<CallTreeNode>> {
        let mut list = Vec::new();
        let mut stack = self.root_nodes();
        while let Some(node) = stack.pop() {
            if node.function_name() == name {
                list.push(Arc::clone(&node));
            }
            stack.extend(node.children());
        }
        list
    }
}

/// Both caller chains name the same functions and reach a root together.
fn same_call_path(a: &Arc<CallTreeNode>, b: &Arc<CallTreeNode>) -> bool {
    let mut a = Some(Arc::clone(a));
    let mut b = Some(Arc::clone(b));
    loop {
        match (a, b) {
            (None, None) => return true,
            (Some(na), Some(nb)) if na.function() == nb.function() => {
                a = na.caller();
                b = nb.caller();
            }
            _ => return false,
        }
    }
}

impl Default for CallTree {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CallTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Root nodes: {}, Weight: {:?}",
            self.root_nodes.len(),
            self.total_root_nodes_weight()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ProfileContext, ResolvedStack};

    fn frame(name: &str, offset: u64) -> FrameInfo {
        FrameInfo::new(Function::new(name, "app"), offset)
    }

    /// Build a sample from a root-first path.
    fn sample(path: &[&str], ms: u64, thread_id: u32) -> (ProfileSample, ResolvedStack) {
        let frames = path
            .iter()
            .enumerate()
            .rev()
            .map(|(depth, name)| frame(name, 0x100 + depth as u64))
            .collect();
        (
            ProfileSample::with_weight(Duration::from_millis(ms)),
            ResolvedStack::new(
                frames,
                ProfileContext {
                    process_id: 1,
                    thread_id,
                },
            ),
        )
    }

    fn ingest(tree: &CallTree, path: &[&str], ms: u64) {
        let (s, stack) = sample(path, ms, 1);
        tree.update_call_tree(&s, &stack);
    }

    #[test]
    fn leaf_gets_exclusive_weight_only() {
        let tree = CallTree::new();
        ingest(&tree, &["main", "work", "leaf"], 10);

        let main = tree.find_root_node(&Function::new("main", "app")).unwrap();
        assert_eq!(main.weight(), Duration::from_millis(10));
        assert_eq!(main.exclusive_weight(), Duration::ZERO);

        let leaf = tree.get_call_tree_nodes(&Function::new("leaf", "app"));
        assert_eq!(leaf.len(), 1);
        assert_eq!(leaf[0].exclusive_weight(), Duration::from_millis(10));
        assert_eq!(leaf[0].kind(), NodeKind::NativeUser);
        assert_eq!(tree.node_count(), 3);
    }

    #[test]
    fn unusable_frames_are_skipped() {
        let tree = CallTree::new();
        let stack = ResolvedStack::new(
            vec![frame("leaf", 0x10), frame("junk", 0), frame("main", 0x20)],
            ProfileContext::default(),
        );
        tree.update_call_tree(&ProfileSample::with_weight(Duration::from_millis(3)), &stack);

        let main = tree.root_nodes();
        assert_eq!(main.len(), 1);
        let children = main[0].children();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].function_name(), "leaf");
        assert!(tree.get_call_tree_nodes(&Function::new("junk", "app")).is_empty());
    }

    #[test]
    fn stack_without_usable_frames_changes_nothing() {
        let tree = CallTree::new();
        let stack = ResolvedStack::new(vec![frame("junk", 0)], ProfileContext::default());
        tree.update_call_tree(&ProfileSample::with_weight(Duration::from_millis(3)), &stack);
        assert!(tree.root_nodes().is_empty());
        assert_eq!(tree.node_count(), 0);
    }

    #[test]
    fn call_sites_use_the_callers_return_offset() {
        let tree = CallTree::new();
        ingest(&tree, &["main", "work"], 4);
        let roots = tree.root_nodes();
        let sites = roots[0].call_sites();
        // "main" is at depth 0, so its frame offset is 0x100.
        let site = &sites[&0x100];
        assert_eq!(site.weight(), Duration::from_millis(4));
        assert_eq!(site.targets()[0].node.function_name(), "work");
    }

    #[test]
    fn find_node_sees_nodes_added_after_index_was_built() {
        let tree = CallTree::new();
        ingest(&tree, &["main"], 1);
        let main_id = tree.root_nodes()[0].id();
        assert!(tree.find_node(main_id).is_some());

        ingest(&tree, &["main", "late"], 1);
        let late = tree.get_call_tree_nodes(&Function::new("late", "app"));
        assert!(tree.find_node(late[0].id()).is_some_and(|n| Arc::ptr_eq(&n, &late[0])));
        assert!(tree.find_node(9999).is_none());
    }

    #[test]
    fn group_of_one_has_a_backtrace() {
        let tree = CallTree::new();
        ingest(&tree, &["main", "work"], 1);
        let work = NodeView::Real(tree.get_call_tree_nodes(&Function::new("work", "app"))[0].clone());
        let group = NodeView::from(GroupNode {
            function: work.function().cloned(),
            instances: vec![work.clone()],
            ..GroupNode::default()
        });
        let trace = tree.get_backtrace(&group);
        assert_eq!(trace.len(), 1);
        assert_eq!(trace[0].function_name(), "main");
    }

    #[test]
    fn print_lists_every_root() {
        let tree = CallTree::new();
        ingest(&tree, &["main", "work"], 2);
        ingest(&tree, &["thread_start"], 1);
        let text = tree.print();
        assert_eq!(text.matches("Call tree root node").count(), 2);
        assert!(text.contains("app!work"));
        assert!(text.contains("    callees: 1"));
        assert_eq!(tree.to_string(), "Root nodes: 2, Weight: 3ms");
    }

    #[test]
    fn print_node_instances_includes_stacks() {
        let tree = CallTree::new();
        ingest(&tree, &["main", "f", "f"], 2);
        let text = tree.print_node_instances("f", true);
        assert!(text.starts_with("Instances for f: 2"));
        assert!(text.contains("     2: main"));
    }

    #[test]
    fn verify_cycles_accepts_a_tree() {
        let tree = CallTree::new();
        ingest(&tree, &["main", "a", "b"], 1);
        ingest(&tree, &["main", "b", "a"], 1);
        assert!(tree.verify_cycles());
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "cycle in call tree")]
    fn verify_cycles_asserts_on_a_cycle() {
        let tree = CallTree::new();
        ingest(&tree, &["main", "a"], 1);
        let root = tree.root_nodes()[0].clone();
        let a = root.children()[0].clone();
        // Corrupt the tree: make the root a child of its own child.
        let _ = a.add_child(root.function(), None, || 0);
        let looped = a.children()[0].clone();
        looped.merge_with(&root, &mut HashSet::new());
        tree.verify_cycles();
    }
}
