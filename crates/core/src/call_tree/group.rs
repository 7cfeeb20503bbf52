use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::call_tree::{CallSite, CallTreeNode, NodeKind, ThreadWeight};
use crate::model::{Function, FunctionDebugInfo, ThreadId};

/// Read-only combined view over several instances of one function.
///
/// Children and callers are synthetic nodes (one per distinct function,
/// weights summed) that do not belong to any tree.
#[derive(Debug, Default)]
pub struct GroupNode {
    pub(crate) function: Option<Function>,
    pub(crate) debug_info: Option<FunctionDebugInfo>,
    pub(crate) kind: NodeKind,
    pub(crate) weight: Duration,
    pub(crate) exclusive_weight: Duration,
    pub(crate) instances: Vec<NodeView>,
    pub(crate) children: Vec<Arc<CallTreeNode>>,
    pub(crate) callers: Vec<Arc<CallTreeNode>>,
    pub(crate) call_sites: HashMap<u64, CallSite>,
    pub(crate) thread_weights: HashMap<ThreadId, ThreadWeight>,
}

impl GroupNode {
    pub fn instances(&self) -> &[NodeView] {
        &self.instances
    }

    pub fn children(&self) -> &[Arc<CallTreeNode>] {
        &self.children
    }

    pub fn callers(&self) -> &[Arc<CallTreeNode>] {
        &self.callers
    }

    pub fn call_sites(&self) -> &HashMap<u64, CallSite> {
        &self.call_sites
    }

    pub fn thread_weights(&self) -> &HashMap<ThreadId, ThreadWeight> {
        &self.thread_weights
    }
}

/// Anything that answers node queries: a real tree node or a combined group.
#[derive(Debug, Clone)]
pub enum NodeView {
    Real(Arc<CallTreeNode>),
    Group(Arc<GroupNode>),
}

impl From<Arc<CallTreeNode>> for NodeView {
    fn from(node: Arc<CallTreeNode>) -> Self {
        Self::Real(node)
    }
}

impl From<GroupNode> for NodeView {
    fn from(group: GroupNode) -> Self {
        Self::Group(Arc::new(group))
    }
}

impl NodeView {
    pub fn is_group(&self) -> bool {
        matches!(self, Self::Group(_))
    }

    pub fn as_real(&self) -> Option<&Arc<CallTreeNode>> {
        match self {
            Self::Real(node) => Some(node),
            Self::Group(_) => None,
        }
    }

    pub fn as_group(&self) -> Option<&Arc<GroupNode>> {
        match self {
            Self::Real(_) => None,
            Self::Group(group) => Some(group),
        }
    }

    /// `None` only for the empty group produced by combining nothing.
    pub fn function(&self) -> Option<&Function> {
        match self {
            Self::Real(node) => Some(node.function()),
            Self::Group(group) => group.function.as_ref(),
        }
    }

    pub fn debug_info(&self) -> Option<&FunctionDebugInfo> {
        match self {
            Self::Real(node) => node.debug_info(),
            Self::Group(group) => group.debug_info.as_ref(),
        }
    }

    pub fn kind(&self) -> NodeKind {
        match self {
            Self::Real(node) => node.kind(),
            Self::Group(group) => group.kind,
        }
    }

    pub fn weight(&self) -> Duration {
        match self {
            Self::Real(node) => node.weight(),
            Self::Group(group) => group.weight,
        }
    }

    pub fn exclusive_weight(&self) -> Duration {
        match self {
            Self::Real(node) => node.exclusive_weight(),
            Self::Group(group) => group.exclusive_weight,
        }
    }

    /// The tracked instances: the node itself for a real node.
    pub fn instances(&self) -> Vec<NodeView> {
        match self {
            Self::Real(_) => vec![self.clone()],
            Self::Group(group) => group.instances.clone(),
        }
    }

    pub fn instance_count(&self) -> usize {
        match self {
            Self::Real(_) => 1,
            Self::Group(group) => group.instances.len(),
        }
    }

    /// Every real node behind this view, flattening nested groups.
    pub fn real_instances(&self) -> Vec<Arc<CallTreeNode>> {
        let mut out = Vec::new();
        let mut pending = vec![self.clone()];
        while let Some(view) = pending.pop() {
            match view {
                Self::Real(node) => out.push(node),
                Self::Group(group) => pending.extend(group.instances.iter().rev().cloned()),
            }
        }
        out
    }

    pub fn children(&self) -> Vec<Arc<CallTreeNode>> {
        match self {
            Self::Real(node) => node.children(),
            Self::Group(group) => group.children.clone(),
        }
    }

    pub fn callers(&self) -> Vec<Arc<CallTreeNode>> {
        match self {
            Self::Real(node) => node.caller().into_iter().collect(),
            Self::Group(group) => group.callers.clone(),
        }
    }

    pub fn call_sites(&self) -> HashMap<u64, CallSite> {
        match self {
            Self::Real(node) => node.call_sites(),
            Self::Group(group) => group.call_sites.clone(),
        }
    }

    pub fn thread_weights(&self) -> HashMap<ThreadId, ThreadWeight> {
        match self {
            Self::Real(node) => node.thread_weights(),
            Self::Group(group) => group.thread_weights.clone(),
        }
    }

    /// `weight` as a fraction of this view's inclusive weight.
    pub fn scale_weight(&self, weight: Duration) -> f64 {
        let total = self.weight();
        if total.is_zero() {
            return 0.0;
        }
        weight.as_secs_f64() / total.as_secs_f64()
    }

    /// Same underlying node or group allocation.
    pub fn ptr_eq(&self, other: &NodeView) -> bool {
        match (self, other) {
            (Self::Real(a), Self::Real(b)) => Arc::ptr_eq(a, b),
            (Self::Group(a), Self::Group(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Weak;

    use super::*;

    #[test]
    fn nested_groups_flatten_to_real_nodes() {
        let f = Function::new("F", "app");
        let a = Arc::new(CallTreeNode::new(1, f.clone(), None, Weak::new()));
        let b = Arc::new(CallTreeNode::new(2, f.clone(), None, Weak::new()));
        let inner = NodeView::from(GroupNode {
            function: Some(f.clone()),
            instances: vec![NodeView::Real(Arc::clone(&b))],
            ..GroupNode::default()
        });
        let outer = NodeView::from(GroupNode {
            function: Some(f),
            instances: vec![NodeView::Real(Arc::clone(&a)), inner],
            ..GroupNode::default()
        });

        let real = outer.real_instances();
        assert_eq!(real.len(), 2);
        assert!(Arc::ptr_eq(&real[0], &a));
        assert!(Arc::ptr_eq(&real[1], &b));
        assert_eq!(outer.instance_count(), 2);
        assert!(outer.is_group());
    }

    #[test]
    fn empty_group_has_no_function() {
        let empty = NodeView::from(GroupNode::default());
        assert!(empty.function().is_none());
        assert_eq!(empty.weight(), Duration::ZERO);
        assert_eq!(empty.scale_weight(Duration::from_millis(1)), 0.0);
    }
}
