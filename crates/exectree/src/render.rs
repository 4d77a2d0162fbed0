//! Graphviz DOT rendering of trees.

use std::collections::{HashMap, HashSet};
use std::fmt::Write as _;
use std::sync::Arc;

use uuid::Uuid;

use crate::dependency::ExecDependency;
use crate::job::{ExecJob, JobBody};
use crate::tree::ExecTree;

const GRAPH_BGCOLOR: &str = "black";
const GRAPH_FONTCOLOR: &str = "deepskyblue";
const CLUSTER_COLOR: &str = "deepskyblue";
const FONT: &str = "sans-serif";

pub(crate) fn dot_graph(tree: &ExecTree, arborescent: bool) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "digraph exectree {{");
    let _ = writeln!(out, "  bgcolor={};", quote(GRAPH_BGCOLOR));
    let _ = writeln!(out, "  fontcolor={};", quote(GRAPH_FONTCOLOR));
    let _ = writeln!(out, "  fontname={};", quote(FONT));
    if has_subtree_job(tree) {
        let _ = writeln!(out, "  compound=true;");
    }
    render_body(tree, arborescent, 1, &mut out);
    render_legend(tree, 1, &mut out);
    let _ = writeln!(out, "}}");
    out
}

fn has_subtree_job(tree: &ExecTree) -> bool {
    tree.jobs()
        .iter()
        .any(|job| matches!(job.body(), JobBody::Subtree(_)))
}

fn render_body(tree: &ExecTree, arborescent: bool, depth: usize, out: &mut String) {
    let indent = "  ".repeat(depth);
    for job in tree.jobs() {
        match job.body() {
            JobBody::Subtree(subtree) => render_cluster(&job, &subtree, depth, out),
            _ => render_node(&job, &indent, out),
        }
    }

    let grand = if arborescent {
        Some(grand_ancestors(tree))
    } else {
        None
    };
    for dep in tree.deps() {
        if let Some(grand) = &grand {
            let implied = grand
                .get(&dep.child().uuid())
                .is_some_and(|ancestors| ancestors.contains(&dep.parent().uuid()));
            if implied {
                continue;
            }
        }
        render_dep(&dep, &indent, out);
    }
}

fn render_node(job: &Arc<ExecJob>, indent: &str, out: &mut String) {
    let mut attrs = Vec::new();
    if job.progress() >= 0 {
        attrs.push(format!(
            "label={}",
            quote_raw(&format!("{}\\n{}", job.name(), job.progress()))
        ));
    }
    attrs.push("style=\"filled\"".to_string());
    attrs.push(format!("fillcolor={}", quote(job.state().color())));
    attrs.push(format!("color={}", quote(&job.tcolor())));
    attrs.push("penwidth=\"3\"".to_string());
    attrs.push(format!("fontname={}", quote(FONT)));
    let href = job.href();
    if !href.is_empty() {
        attrs.push(format!("href={}", quote(&href)));
    }
    let _ = writeln!(out, "{indent}{} [{}];", quote(job.name()), attrs.join(", "));
}

fn render_cluster(host: &Arc<ExecJob>, subtree: &Arc<ExecTree>, depth: usize, out: &mut String) {
    let indent = "  ".repeat(depth);
    let label = match subtree.iterator() {
        Some(iterator) => format!("{} {}/{}", host.name(), iterator.run(), iterator.len()),
        None => host.name().to_string(),
    };
    let _ = writeln!(out, "{indent}subgraph {} {{", quote(&cluster_name(subtree)));
    let _ = writeln!(out, "{indent}  label={};", quote(&label));
    let _ = writeln!(out, "{indent}  color={};", quote(CLUSTER_COLOR));
    let _ = writeln!(out, "{indent}  fontname={};", quote(FONT));
    // Nested bodies always render flat; elision applies to the top graph.
    render_body(subtree, false, depth + 1, out);
    let _ = writeln!(out, "{indent}}}");
}

fn render_dep(dep: &Arc<ExecDependency>, indent: &str, out: &mut String) {
    let color = if dep.is_defined() {
        dep.dcolor().to_string()
    } else {
        dep.ucolor().to_string()
    };
    let parent_subtree = dep.parent().subtree();
    let child_subtree = dep.child().subtree();

    match (&parent_subtree, &child_subtree) {
        (Some(parent_tree), Some(child_tree)) => {
            for leaf in parent_tree.leaves() {
                for stem in child_tree.stems() {
                    render_edge(
                        leaf.name(),
                        stem.name(),
                        &color,
                        Some(&cluster_name(parent_tree)),
                        Some(&cluster_name(child_tree)),
                        indent,
                        out,
                    );
                }
            }
        }
        (Some(parent_tree), None) => {
            for leaf in parent_tree.leaves() {
                render_edge(
                    leaf.name(),
                    dep.child().name(),
                    &color,
                    Some(&cluster_name(parent_tree)),
                    None,
                    indent,
                    out,
                );
            }
        }
        (None, Some(child_tree)) => {
            for stem in child_tree.stems() {
                render_edge(
                    dep.parent().name(),
                    stem.name(),
                    &color,
                    None,
                    Some(&cluster_name(child_tree)),
                    indent,
                    out,
                );
            }
        }
        (None, None) => {
            render_edge(
                dep.parent().name(),
                dep.child().name(),
                &color,
                None,
                None,
                indent,
                out,
            );
        }
    }
}

fn render_edge(
    from: &str,
    to: &str,
    color: &str,
    ltail: Option<&str>,
    lhead: Option<&str>,
    indent: &str,
    out: &mut String,
) {
    let mut attrs = vec![format!("color={}", quote(color))];
    if let Some(ltail) = ltail {
        attrs.push(format!("ltail={}", quote(ltail)));
    }
    if let Some(lhead) = lhead {
        attrs.push(format!("lhead={}", quote(lhead)));
    }
    let _ = writeln!(
        out,
        "{indent}{} -> {} [{}];",
        quote(from),
        quote(to),
        attrs.join(", ")
    );
}

fn render_legend(tree: &ExecTree, depth: usize, out: &mut String) {
    let legend = tree.legend();
    if legend.is_empty() {
        return;
    }
    let indent = "  ".repeat(depth);
    let mut label = String::new();
    for (name, value) in &legend {
        let _ = write!(label, "{name}:\\t{value}\\n");
    }
    let _ = writeln!(out, "{indent}subgraph \"legend\" {{");
    let _ = writeln!(out, "{indent}  rank=\"sink\";");
    let _ = writeln!(
        out,
        "{indent}  \"legend\" [shape=\"box\", margin=\"0\", label={}, color={}, fontcolor={}, fontname={}];",
        quote_raw(&label),
        quote(CLUSTER_COLOR),
        quote(GRAPH_FONTCOLOR),
        quote(FONT)
    );
    let _ = writeln!(out, "{indent}}}");
}

/// Grand-ancestors per job: every ancestor reachable through a parent, i.e.
/// nodes whose direct edge to the job is transitively implied.
fn grand_ancestors(tree: &ExecTree) -> HashMap<Uuid, HashSet<Uuid>> {
    fn ancestors(job: &Arc<ExecJob>, memo: &mut HashMap<Uuid, HashSet<Uuid>>) -> HashSet<Uuid> {
        if let Some(found) = memo.get(&job.uuid()) {
            return found.clone();
        }
        // Seed the memo so a cycle terminates instead of recursing forever.
        memo.insert(job.uuid(), HashSet::new());
        let mut all = HashSet::new();
        for parent in job.parents() {
            all.insert(parent.uuid());
            all.extend(ancestors(&parent, memo));
        }
        memo.insert(job.uuid(), all.clone());
        all
    }

    let mut memo = HashMap::new();
    let mut grand = HashMap::new();
    for job in tree.jobs() {
        let mut implied = HashSet::new();
        for parent in job.parents() {
            implied.extend(ancestors(&parent, &mut memo));
        }
        grand.insert(job.uuid(), implied);
    }
    grand
}

fn cluster_name(tree: &ExecTree) -> String {
    format!("cluster_{}", tree.name().replace(' ', "_"))
}

fn quote(value: &str) -> String {
    quote_raw(&value.replace('\\', "\\\\"))
}

/// Quotes without escaping backslashes, for labels that carry `\n`/`\t`
/// escapes meant for graphviz.
fn quote_raw(value: &str) -> String {
    format!("\"{}\"", value.replace('"', "\\\""))
}
