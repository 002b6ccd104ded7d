//! Tree-shaped views of a [`CpuProfile`]: the flame graph, the hierarchical
//! call tree, and folded stacks.

use std::fmt::Display;

use itertools::Itertools;

use crate::schema::{CpuProfile, FlameGraphNode, Milliseconds};

fn percentage_of(part: f64, whole: f64) -> f64 {
    if whole > 0.0 { part / whole * 100.0 } else { 0.0 }
}

/// Builds the flame graph of a profile: a synthetic root whose children are
/// the sampled leaf call sites, hottest first.
pub fn build_flame_graph(profile: &CpuProfile) -> FlameGraphNode {
    let children = profile
        .hot_nodes()
        .into_iter()
        .map(|node| FlameGraphNode {
            name: node.label(),
            value: node.hit_count,
            children: Vec::new(),
            self_time: node.self_time,
            total_time: node.total_time,
            percentage: percentage_of(node.total_time, profile.duration),
        })
        .collect();

    FlameGraphNode {
        name: "root".to_string(),
        value: profile.samples.len() as u64,
        children,
        self_time: 0.0,
        total_time: profile.duration,
        percentage: 100.0,
    }
}

/// Serializes every sample's stack as `outer;inner;leaf <count>`, one line
/// per distinct stack.
pub fn folded_stacks(profile: &CpuProfile) -> String {
    profile
        .sample_stacks
        .iter()
        .counts()
        .into_iter()
        .map(|(&stack_idx, count)| {
            let path = profile
                .stack_table
                .frames(stack_idx)
                .into_iter()
                .filter_map(|id| profile.node(id))
                .map(|node| node.function_name.replace(';', ","))
                .join(";");
            (path, count)
        })
        .sorted()
        .map(|(path, count)| format!("{path} {count}\n"))
        .collect()
}

#[derive(Debug, Default)]
pub struct CallTree<'p> {
    pub children: Vec<Node<'p>>,
}

#[derive(Debug)]
pub struct Node<'p> {
    pub name: &'p str,
    /// Samples where this node was the leaf.
    pub count: u64,
    /// Samples that passed through this node.
    pub subtotal: u64,
    pub subtree: CallTree<'p>,
}

impl<'p> CallTree<'p> {
    pub fn from_profile(profile: &'p CpuProfile) -> Self {
        let mut tree = CallTree::default();

        for &stack_idx in &profile.sample_stacks {
            let mut frames = profile
                .stack_table
                .frames(stack_idx)
                .into_iter()
                .filter_map(|id| profile.node(id))
                .peekable();

            let mut tree = &mut tree;
            while let Some(frame) = frames.next() {
                let name = frame.function_name.as_str();

                let subtree_index = match tree.children.iter().position(|n| n.name == name) {
                    Some(subtree_index) => subtree_index,
                    None => {
                        tree.children.push(Node {
                            name,
                            count: 0,
                            subtotal: 0,
                            subtree: Default::default(),
                        });
                        tree.children.len() - 1
                    }
                };

                let subtree = &mut tree.children[subtree_index];
                subtree.subtotal += 1;
                if frames.peek().is_none() {
                    subtree.count += 1;
                }

                tree = &mut subtree.subtree;
            }
        }

        tree.sort();
        tree
    }

    fn sort(&mut self) {
        self.children
            .sort_by(|a, b| b.subtotal.cmp(&a.subtotal).then_with(|| a.name.cmp(b.name)));
        for child in &mut self.children {
            child.subtree.sort();
        }
    }

    pub fn total(&self) -> u64 {
        self.children.iter().map(|n| n.subtotal).sum()
    }

    /// Removes subtrees below `limit` percent of all samples, folding their
    /// samples into the parent's self count.
    pub fn prune(&mut self, limit: f64) {
        let total = self.total();
        self.prune_inner(total, limit);
    }

    /// Returns the number of samples removed at this level.
    fn prune_inner(&mut self, total: u64, limit: f64) -> u64 {
        let mut folded = 0;
        self.children.retain_mut(|node| {
            if percentage_of(node.subtotal as f64, total as f64) < limit {
                folded += node.subtotal;
                false
            } else {
                node.count += node.subtree.prune_inner(total, limit);
                true
            }
        });
        folded
    }

    /// Hierarchical flame graph; times are sample counts scaled by the
    /// sampling interval.
    pub fn to_flame_graph(
        &self,
        sample_interval: Milliseconds,
        duration: Milliseconds,
    ) -> FlameGraphNode {
        fn convert(node: &Node, interval: Milliseconds, duration: Milliseconds) -> FlameGraphNode {
            let total_time = node.subtotal as f64 * interval;
            FlameGraphNode {
                name: node.name.to_string(),
                value: node.subtotal,
                children: node
                    .subtree
                    .children
                    .iter()
                    .map(|child| convert(child, interval, duration))
                    .collect(),
                self_time: node.count as f64 * interval,
                total_time,
                percentage: percentage_of(total_time, duration),
            }
        }

        FlameGraphNode {
            name: "root".to_string(),
            value: self.total(),
            children: self
                .children
                .iter()
                .map(|child| convert(child, sample_interval, duration))
                .collect(),
            self_time: 0.0,
            total_time: duration,
            percentage: 100.0,
        }
    }
}

/// Renders the tree as a table:
///
/// ```text
/// │ RATIO │  TOTAL  │  SELF   │ TREE
/// │       │         │         │
/// │ 100.0 │ 46      │ 5       │ main
/// │ 89.1  │ 41      │ 5       │ └─ handle_request
/// │ 56.5  │ 26      │ 17      │    ├─ parse
/// │ 19.6  │ 9       │ 9       │    │  └─ tokenize
/// │ 21.7  │ 10      │ 10      │    └─ respond
/// ```
impl Display for CallTree<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fn inner(
            f: &mut std::fmt::Formatter<'_>,
            node: &Node<'_>,
            total: u64,
            prefix: &str,
            marker: &str,
        ) -> std::fmt::Result {
            writeln!(
                f,
                "│ {:<5.1} │ {:<7} │ {:<7} │ {}{}{}",
                percentage_of(node.subtotal as f64, total as f64),
                node.subtotal,
                node.count,
                prefix,
                marker,
                node.name
            )?;

            let new_prefix = match marker {
                "" => prefix.to_string(),
                "├─ " => format!("{prefix}│  "),
                _ => format!("{prefix}   "),
            };

            let mut children = node.subtree.children.iter().peekable();
            while let Some(child) = children.next() {
                let marker = if children.peek().is_none() { "└─ " } else { "├─ " };
                inner(f, child, total, &new_prefix, marker)?;
            }

            Ok(())
        }

        writeln!(f, "│ RATIO │  TOTAL  │  SELF   │ TREE")?;
        writeln!(f, "│       │         │         │")?;

        let total = self.total();
        for node in &self.children {
            inner(f, node, total, "", "")?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions_sorted::assert_eq_sorted;

    use super::*;
    use crate::{
        cpu::{StackSample, build_cpu_profile},
        stack::CallFrame,
    };

    fn profile(stacks: &[&[&str]]) -> CpuProfile {
        let samples = stacks
            .iter()
            .enumerate()
            .map(|(idx, names)| StackSample {
                timestamp: (idx + 1) as f64 * 10.0,
                frames: names
                    .iter()
                    .map(|name| CallFrame::new(*name, "app.rs", 7, 1, 0.0))
                    .collect(),
            })
            .collect::<Vec<_>>();
        build_cpu_profile(0.0, stacks.len() as f64 * 10.0, 10.0, &samples)
    }

    #[test]
    fn flame_graph_root_covers_every_sample() {
        let profile = profile(&[
            &["main", "parse"],
            &["main", "parse"],
            &["main", "render"],
            &["main"],
        ]);

        let graph = build_flame_graph(&profile);

        assert_eq!(graph.name, "root");
        assert_eq!(graph.value, 4);
        assert_eq!(graph.percentage, 100.0);

        let children = graph
            .children
            .iter()
            .map(|child| (child.name.as_str(), child.value, child.percentage))
            .collect::<Vec<_>>();
        assert_eq!(
            children,
            vec![
                ("main (app.rs:7)", 1, 100.0),
                ("parse (app.rs:7)", 2, 50.0),
                ("render (app.rs:7)", 1, 25.0),
            ]
        );
        assert!(graph.children.iter().map(|c| c.value).sum::<u64>() <= graph.value);
    }

    #[test]
    fn flame_graph_of_an_empty_profile() {
        let graph = build_flame_graph(&profile(&[]));

        assert_eq!(graph.value, 0);
        assert_eq!(graph.percentage, 100.0);
        assert!(graph.children.is_empty());
    }

    #[test]
    fn folded_stacks_count_identical_paths() {
        let profile = profile(&[&["main", "parse"], &["main", "render"], &["main", "parse"]]);

        assert_eq!(
            folded_stacks(&profile),
            "main;parse 2\nmain;render 1\n".to_string()
        );
    }

    #[test]
    fn call_tree_aggregates_paths() {
        let profile = profile(&[
            &["main", "parse", "tokenize"],
            &["main", "parse"],
            &["main", "render"],
            &["main", "parse", "tokenize"],
        ]);

        let tree = CallTree::from_profile(&profile);

        assert_eq!(tree.total(), 4);
        let main = &tree.children[0];
        assert_eq!((main.name, main.subtotal, main.count), ("main", 4, 0));

        let callees = main
            .subtree
            .children
            .iter()
            .map(|node| (node.name, node.subtotal, node.count))
            .collect::<Vec<_>>();
        assert_eq!(callees, vec![("parse", 3, 1), ("render", 1, 1)]);
    }

    #[test]
    fn pruning_drops_cold_subtrees() {
        let profile = profile(&[
            &["main", "parse"],
            &["main", "parse"],
            &["main", "parse"],
            &["main", "render"],
        ]);

        let mut tree = CallTree::from_profile(&profile);
        tree.prune(30.0);

        assert_eq!(tree.children[0].count, 1);
        let names = tree.children[0]
            .subtree
            .children
            .iter()
            .map(|node| node.name)
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["parse"]);
    }

    #[test]
    fn hierarchical_flame_graph_mirrors_the_tree() {
        let profile = profile(&[&["main", "parse"], &["main"]]);

        let graph = CallTree::from_profile(&profile).to_flame_graph(10.0, profile.duration);

        assert_eq!(graph.value, 2);
        let main = &graph.children[0];
        assert_eq!(main.total_time, 20.0);
        assert_eq!(main.self_time, 10.0);
        assert_eq!(main.percentage, 100.0);
        assert_eq!(main.children[0].name, "parse");
        assert_eq!(main.children[0].percentage, 50.0);
    }

    #[test]
    fn display_draws_the_tree() {
        let profile = profile(&[&["main", "parse"], &["main", "render"], &["main", "parse"]]);

        let rendered = CallTree::from_profile(&profile).to_string();

        assert_eq_sorted!(
            rendered.lines().collect::<Vec<_>>(),
            vec![
                "│ RATIO │  TOTAL  │  SELF   │ TREE",
                "│       │         │         │",
                "│ 100.0 │ 3       │ 0       │ main",
                "│ 66.7  │ 2       │ 2       │ ├─ parse",
                "│ 33.3  │ 1       │ 1       │ └─ render",
            ]
        );
    }
}
