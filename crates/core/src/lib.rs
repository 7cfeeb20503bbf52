//! Weighted call-tree aggregation for sampled profiles.
//!
//! Samples arrive as `(ProfileSample, ResolvedStack)` pairs, usually from
//! several worker threads at once. [`CallTree::update_call_tree`] folds each
//! one into a shared tree of per-call-path nodes, and the query side
//! ([`CallTree::get_combined_call_tree_node`],
//! [`CallTree::get_top_functions_and_modules`], [`CallTree::get_backtrace`],
//! [`CallTree::merge_with`]) reports over it without double counting
//! recursive instances.
//!
//! ```text
//!   sampler ──▶ (sample, stack) ──▶ CallTree ──▶ NodeView (real | group)
//!                                      │
//!                                      └──▶ top functions / modules, backtraces
//! ```

pub mod call_tree;
pub mod model;
pub mod parsers;
pub mod shared_str;

pub use call_tree::{
    CallSite, CallSiteTarget, CallTree, CallTreeNode, CombineOptions, FunctionSummary, GroupNode,
    ModuleProfileInfo, NodeId, NodeKind, NodeView, ThreadWeight, TopFunctionsAndModules,
};
pub use model::{
    FrameInfo, Function, FunctionDebugInfo, FunctionTable, ProfileContext, ProfileSample,
    ResolvedStack, StackSample, ThreadId,
};
pub use shared_str::SharedStr;
