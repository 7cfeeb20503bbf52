use std::io::Write;
use std::time::Duration;

use anyhow::Result;
use serde::Serialize;

use calltree_core::{CallTree, FunctionSummary, ModuleProfileInfo, NodeView};

#[derive(Serialize)]
struct JsonReport {
    roots: usize,
    nodes: usize,
    total_weight_ms: f64,
    functions: Vec<FunctionSummary>,
    modules: Vec<ModuleProfileInfo>,
}

fn millis(d: Duration) -> f64 {
    d.as_nanos() as f64 / 1_000_000.0
}

/// All roots as one view, so reports cover the whole tree.
fn whole_tree(tree: &CallTree) -> NodeView {
    let roots: Vec<NodeView> = tree.root_nodes().into_iter().map(NodeView::Real).collect();
    CallTree::combined_call_tree_nodes(&roots, false)
}

pub fn write_json_report(out: &mut impl Write, tree: &CallTree, top: usize) -> Result<()> {
    let report = tree.get_top_functions_and_modules(&whole_tree(tree));
    let mut functions = report.function_summaries();
    functions.truncate(top);

    let json = JsonReport {
        roots: tree.root_nodes().len(),
        nodes: tree.node_count(),
        total_weight_ms: millis(tree.total_root_nodes_weight()),
        functions,
        modules: report.modules,
    };
    serde_json::to_writer_pretty(&mut *out, &json)?;
    writeln!(out)?;
    Ok(())
}

pub fn write_text_report(out: &mut impl Write, tree: &CallTree, top: usize) -> Result<()> {
    let report = tree.get_top_functions_and_modules(&whole_tree(tree));

    writeln!(
        out,
        "Total weight: {:.3} ms ({} roots, {} nodes)",
        millis(tree.total_root_nodes_weight()),
        tree.root_nodes().len(),
        tree.node_count()
    )?;

    writeln!(out, "\nTop functions (by exclusive time):")?;
    writeln!(out, "{:>12} {:>12} {:>6}  function", "excl ms", "incl ms", "inst")?;
    for summary in report.function_summaries().into_iter().take(top) {
        writeln!(
            out,
            "{:>12.3} {:>12.3} {:>6}  {}",
            millis(summary.exclusive_weight),
            millis(summary.weight),
            summary.instances,
            summary.function
        )?;
    }

    writeln!(out, "\nModules:")?;
    for module in &report.modules {
        writeln!(
            out,
            "{:>12.3} {:>7.2}%  {} ({} functions)",
            millis(module.weight),
            module.percentage * 100.0,
            module.name,
            module.functions.len()
        )?;
    }
    Ok(())
}

/// Instances of every function matching `name` (`module!name` or bare name).
pub fn write_function(
    out: &mut impl Write,
    tree: &CallTree,
    name: &str,
    print_stacks: bool,
) -> Result<()> {
    let (module, bare) = match name.split_once('!') {
        Some((module, bare)) => (Some(module), bare),
        None => (None, name),
    };
    let matches: Vec<_> = tree
        .functions()
        .into_iter()
        .filter(|f| f.name() == bare && module.is_none_or(|m| f.module() == m))
        .collect();

    if matches.is_empty() {
        writeln!(out, "No instances of {name}")?;
        return Ok(());
    }

    write!(out, "{}", tree.print_node_instances(bare, print_stacks))?;
    for function in &matches {
        let combined = tree.get_combined_call_tree_node(function, None);
        writeln!(
            out,
            "Combined {function}: weight {:.3} ms, excl weight {:.3} ms, {} instances",
            millis(combined.weight()),
            millis(combined.exclusive_weight()),
            combined.instance_count()
        )?;

        let callers: Vec<String> = combined
            .callers()
            .iter()
            .map(|c| format!("{} ({:.3} ms)", c.function(), millis(c.weight())))
            .collect();
        if !callers.is_empty() {
            writeln!(out, "  callers: {}", callers.join(", "))?;
        }
        let callees: Vec<String> = combined
            .children()
            .iter()
            .map(|c| format!("{} ({:.3} ms)", c.function(), millis(c.weight())))
            .collect();
        if !callees.is_empty() {
            writeln!(out, "  callees: {}", callees.join(", "))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use calltree_core::{FrameInfo, Function, ProfileContext, ProfileSample, ResolvedStack};

    fn tree() -> CallTree {
        let tree = CallTree::new();
        for (path, ms) in [(["main", "work"], 3), (["main", "idle"], 1)] {
            let frames = path
                .iter()
                .enumerate()
                .rev()
                .map(|(depth, name)| FrameInfo::new(Function::new(*name, "app"), depth as u64 + 1))
                .collect();
            tree.update_call_tree(
                &ProfileSample::with_weight(Duration::from_millis(ms)),
                &ResolvedStack::new(frames, ProfileContext::default()),
            );
        }
        tree
    }

    #[test]
    fn text_report_lists_functions_and_modules() {
        let mut buf = Vec::new();
        write_text_report(&mut buf, &tree(), 10).unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert!(text.starts_with("Total weight: 4.000 ms (1 roots, 3 nodes)"));
        assert!(text.contains("app!work"));
        assert!(text.contains("100.00%  app (3 functions)"));
    }

    #[test]
    fn json_report_truncates_functions() {
        let mut buf = Vec::new();
        write_json_report(&mut buf, &tree(), 1).unwrap();
        let json: serde_json::Value = serde_json::from_slice(&buf).unwrap();
        assert_eq!(json["functions"].as_array().unwrap().len(), 1);
        assert_eq!(json["functions"][0]["function"]["name"], "work");
        assert_eq!(json["total_weight_ms"], 4.0);
    }

    #[test]
    fn function_view_accepts_module_prefix() {
        let mut buf = Vec::new();
        write_function(&mut buf, &tree(), "app!work", true).unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert!(text.contains("Instances for work: 1"));
        assert!(text.contains("Combined app!work: weight 3.000 ms"));

        let mut buf = Vec::new();
        write_function(&mut buf, &tree(), "other!work", false).unwrap();
        assert_eq!(String::from_utf8(buf).unwrap(), "No instances of other!work\n");
    }
}
