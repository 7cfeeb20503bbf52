use std::sync::Arc;
use std::time::Duration;

use crate::call_tree::CallTreeNode;
use crate::model::Function;

#[derive(Debug, Clone)]
pub struct CallSiteTarget {
    pub node: Arc<CallTreeNode>,
    pub weight: Duration,
}

/// Targets observed at one call instruction, for indirect-call statistics.
///
/// Targets are kept unique by function: several node instances of the same
/// callee share one entry.
#[derive(Debug, Clone)]
pub struct CallSite {
    offset: u64,
    weight: Duration,
    targets: Vec<CallSiteTarget>,
}

impl CallSite {
    pub fn new(offset: u64) -> Self {
        Self {
            offset,
            weight: Duration::ZERO,
            targets: Vec::new(),
        }
    }

    /// Caller-relative offset of the call instruction.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Sum over all targets.
    pub fn weight(&self) -> Duration {
        self.weight
    }

    pub fn targets(&self) -> &[CallSiteTarget] {
        &self.targets
    }

    pub fn has_single_target(&self) -> bool {
        self.targets.len() == 1
    }

    pub fn sorted_targets(&self) -> Vec<&CallSiteTarget> {
        let mut sorted: Vec<_> = self.targets.iter().collect();
        sorted.sort_by(|a, b| b.weight.cmp(&a.weight));
        sorted
    }

    pub fn add_target(&mut self, node: &Arc<CallTreeNode>, weight: Duration) {
        self.weight += weight;
        match self
            .targets
            .iter_mut()
            .find(|t| t.node.function() == node.function())
        {
            Some(target) => target.weight += weight,
            None => self.targets.push(CallSiteTarget {
                node: Arc::clone(node),
                weight,
            }),
        }
    }

    pub fn merge_with(&mut self, other: &CallSite) {
        for target in &other.targets {
            self.add_target(&target.node, target.weight);
        }
    }

    /// Copy of this call site with each target swapped for `lookup(function)`
    /// where the lookup finds a replacement.
    pub(crate) fn retarget(
        &self,
        lookup: impl Fn(&Function) -> Option<Arc<CallTreeNode>>,
    ) -> CallSite {
        let targets = self
            .targets
            .iter()
            .map(|t| CallSiteTarget {
                node: lookup(t.node.function()).unwrap_or_else(|| Arc::clone(&t.node)),
                weight: t.weight,
            })
            .collect();
        CallSite {
            offset: self.offset,
            weight: self.weight,
            targets,
        }
    }

    /// `weight` as a fraction of this call site's total.
    pub fn scale_weight(&self, weight: Duration) -> f64 {
        if self.weight.is_zero() {
            return 0.0;
        }
        weight.as_secs_f64() / self.weight.as_secs_f64()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Weak;

    use super::*;

    fn node(id: u64, name: &str) -> Arc<CallTreeNode> {
        Arc::new(CallTreeNode::new(id, Function::new(name, "app"), None, Weak::new()))
    }

    #[test]
    fn targets_are_deduplicated_by_function() {
        let mut site = CallSite::new(0x1c);
        let first = node(1, "Dispatch");
        let second_instance = node(2, "Dispatch");
        let other = node(3, "Fallback");

        site.add_target(&first, Duration::from_millis(5));
        site.add_target(&second_instance, Duration::from_millis(5));
        site.add_target(&other, Duration::from_millis(20));

        assert_eq!(site.targets().len(), 2);
        assert_eq!(site.weight(), Duration::from_millis(30));
        let sorted = site.sorted_targets();
        assert_eq!(sorted[0].node.function_name(), "Fallback");
        assert_eq!(sorted[1].weight, Duration::from_millis(10));
        assert!((site.scale_weight(Duration::from_millis(15)) - 0.5).abs() < 1e-9);
    }

    #[test]
    fn merge_sums_matching_targets() {
        let target = node(1, "Callee");
        let mut a = CallSite::new(8);
        a.add_target(&target, Duration::from_millis(2));
        let mut b = CallSite::new(8);
        b.add_target(&node(9, "Callee"), Duration::from_millis(3));

        a.merge_with(&b);
        assert!(a.has_single_target());
        assert_eq!(a.weight(), Duration::from_millis(5));
        assert!(Arc::ptr_eq(&a.targets()[0].node, &target));
    }
}
