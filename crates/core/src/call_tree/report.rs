use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::call_tree::combine::{CombineOptions, combine_nodes, sort_outermost_first};
use crate::call_tree::node::{NodePtr, node_ptr};
use crate::call_tree::{CallTreeNode, NodeKind, NodeView};
use crate::model::Function;
use crate::shared_str::SharedStr;

/// Durations as fractional milliseconds in reports.
mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(d.as_nanos() as f64 / 1_000_000.0)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let ms = f64::deserialize(deserializer)?;
        Ok(Duration::from_secs_f64(ms.max(0.0) / 1000.0))
    }
}

/// Exclusive time attributed to one module below a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleProfileInfo {
    pub name: SharedStr,
    #[serde(rename = "weight_ms", with = "millis")]
    pub weight: Duration,
    /// Share of the queried node's inclusive weight.
    pub percentage: f64,
    pub functions: Vec<Function>,
}

impl ModuleProfileInfo {
    pub fn new(name: SharedStr) -> Self {
        Self {
            name,
            weight: Duration::ZERO,
            percentage: 0.0,
            functions: Vec::new(),
        }
    }
}

/// Flat, serializable row for one combined function.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionSummary {
    pub function: Function,
    pub kind: NodeKind,
    #[serde(rename = "weight_ms", with = "millis")]
    pub weight: Duration,
    #[serde(rename = "exclusive_weight_ms", with = "millis")]
    pub exclusive_weight: Duration,
    pub instances: usize,
}

impl FunctionSummary {
    pub fn from_view(view: &NodeView) -> Option<Self> {
        Some(Self {
            function: view.function()?.clone(),
            kind: view.kind(),
            weight: view.weight(),
            exclusive_weight: view.exclusive_weight(),
            instances: view.instance_count(),
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct TopFunctionsAndModules {
    /// Sorted by exclusive weight, descending.
    pub functions: Vec<NodeView>,
    /// Sorted by weight, descending.
    pub modules: Vec<ModuleProfileInfo>,
}

impl TopFunctionsAndModules {
    pub fn function_summaries(&self) -> Vec<FunctionSummary> {
        self.functions
            .iter()
            .filter_map(FunctionSummary::from_view)
            .collect()
    }
}

#[derive(Default)]
struct Collector {
    functions: Vec<(Function, Vec<NodeView>)>,
    function_slots: HashMap<Function, usize>,
    modules: HashMap<SharedStr, (ModuleProfileInfo, HashSet<Function>)>,
    visited: HashSet<NodePtr>,
}

impl Collector {
    fn collect(&mut self, start: &Arc<CallTreeNode>) {
        let mut stack = vec![Arc::clone(start)];

        while let Some(node) = stack.pop() {
            // Overlapping start instances would otherwise count a subtree twice.
            if !self.visited.insert(node_ptr(&node)) {
                continue;
            }

            let function = node.function().clone();
            let slot = match self.function_slots.get(&function) {
                Some(&slot) => slot,
                None => {
                    self.functions.push((function.clone(), Vec::new()));
                    self.function_slots
                        .insert(function.clone(), self.functions.len() - 1);
                    self.functions.len() - 1
                }
            };
            self.functions[slot].1.push(NodeView::Real(Arc::clone(&node)));

            let (module, seen) = self
                .modules
                .entry(node.module_name().clone())
                .or_insert_with(|| (ModuleProfileInfo::new(node.module_name().clone()), HashSet::new()));
            module.weight += node.exclusive_weight();
            if seen.insert(function.clone()) {
                module.functions.push(function);
            }

            stack.extend(node.children().into_iter().rev());
        }
    }
}

/// Per-function and per-module totals for the subtree under `node`.
///
/// Every instance of a function below `node` is combined with the same
/// recursion rules as [`combine_nodes`]; module weights sum exclusive time
/// and their percentages are relative to `node`'s inclusive weight.
pub fn top_functions_and_modules(node: &NodeView) -> TopFunctionsAndModules {
    let mut starts = node.instances();
    sort_outermost_first(&mut starts);

    let mut collector = Collector::default();
    for start in &starts {
        for real in start.real_instances() {
            collector.collect(&real);
        }
    }

    let options = CombineOptions::weights_only();
    let mut functions: Vec<NodeView> = collector
        .functions
        .iter()
        .map(|(_, instances)| combine_nodes(instances, &options))
        .collect();
    functions.sort_by(|a, b| b.exclusive_weight().cmp(&a.exclusive_weight()));

    let mut modules: Vec<ModuleProfileInfo> = collector
        .modules
        .into_values()
        .map(|(mut module, _)| {
            module.percentage = node.scale_weight(module.weight);
            module
        })
        .collect();
    modules.sort_by(|a, b| b.weight.cmp(&a.weight).then_with(|| a.name.cmp(&b.name)));

    TopFunctionsAndModules { functions, modules }
}

#[cfg(test)]
mod tests {
    use std::sync::Weak;

    use super::*;

    #[test]
    fn modules_sum_exclusive_time_and_scale_to_root() {
        let main = Arc::new(CallTreeNode::new(0, Function::new("main", "app"), None, Weak::new()));
        main.accumulate_weight(Duration::from_millis(40));
        let (a, _) = main.add_child(&Function::new("read", "io.dll"), None, || 1);
        a.accumulate_weight(Duration::from_millis(10));
        a.accumulate_exclusive_weight(Duration::from_millis(10));
        let (b, _) = main.add_child(&Function::new("hash", "crypto.dll"), None, || 2);
        b.accumulate_weight(Duration::from_millis(30));
        b.accumulate_exclusive_weight(Duration::from_millis(30));

        let report = top_functions_and_modules(&NodeView::Real(main));
        let names: Vec<_> = report.modules.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, ["crypto.dll", "io.dll", "app"]);
        assert!((report.modules[0].percentage - 0.75).abs() < 1e-9);
        assert_eq!(report.functions[0].function().map(|f| f.name().as_str()), Some("hash"));
    }

    #[test]
    fn summary_serializes_weights_as_millis() {
        let summary = FunctionSummary {
            function: Function::new("f", "m"),
            kind: NodeKind::NativeUser,
            weight: Duration::from_micros(1500),
            exclusive_weight: Duration::ZERO,
            instances: 1,
        };
        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["weight_ms"], 1.5);
        assert_eq!(json["kind"], "NativeUser");
    }
}
