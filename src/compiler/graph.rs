//! Compiled task graph

use crate::config::{ConfigMap, RetryPolicy};
use serde::{Deserialize, Serialize};
use std::fmt::Write;

/// One node of a compiled graph
///
/// Nodes live in the graph's arena and refer to each other by index only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskNode {
    pub index: usize,
    pub name: String,
    /// Path from the root, e.g. `+etl+load+a`
    pub full_name: String,
    pub parent: Option<usize>,
    /// Regular children in declared order, then the on-error child
    pub children: Vec<usize>,
    pub error_child: Option<usize>,
    /// `None` for groups
    pub operator: Option<String>,
    /// Unrendered config
    pub config: ConfigMap,
    pub retry: RetryPolicy,
    pub parallel: bool,
    /// Set on an on-error branch root and all of its descendants
    pub is_error_branch: bool,
    pub site: String,
    /// Operator tasks guaranteed to succeed before this one runs, farthest first
    pub upstream: Vec<usize>,
    /// On-error branch that catches a permanent failure of this node
    pub error_handler: Option<usize>,
}

impl TaskNode {
    pub fn is_group(&self) -> bool {
        self.operator.is_none()
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    /// Children excluding the on-error child
    pub fn regular_children(&self) -> impl Iterator<Item = usize> + '_ {
        self.children
            .iter()
            .copied()
            .filter(move |c| Some(*c) != self.error_child)
    }
}

/// Immutable result of compiling one workflow revision
///
/// Index order is a pre-order walk of the definition tree, so every
/// parent precedes its children.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompiledTaskGraph {
    pub workflow: String,
    pub revision: String,
    pub site: String,
    /// Declared variables, the base of `vars.*` at render time
    pub variables: ConfigMap,
    pub nodes: Vec<TaskNode>,
}

impl CompiledTaskGraph {
    pub const ROOT: usize = 0;

    pub fn root(&self) -> &TaskNode {
        &self.nodes[Self::ROOT]
    }

    pub fn node(&self, index: usize) -> Option<&TaskNode> {
        self.nodes.get(index)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn find(&self, full_name: &str) -> Option<&TaskNode> {
        self.nodes.iter().find(|n| n.full_name == full_name)
    }

    /// Ancestors of `index`, nearest first, excluding the node itself
    pub fn ancestors(&self, index: usize) -> impl Iterator<Item = usize> + '_ {
        std::iter::successors(self.nodes.get(index).and_then(|n| n.parent), move |i| {
            self.nodes[*i].parent
        })
    }

    /// Whether `ancestor` is a proper ancestor of `index`
    pub fn is_ancestor(&self, ancestor: usize, index: usize) -> bool {
        self.ancestors(index).any(|a| a == ancestor)
    }

    /// Nodes that are dispatched to agents
    pub fn operator_tasks(&self) -> impl Iterator<Item = &TaskNode> {
        self.nodes.iter().filter(|n| !n.is_group())
    }

    /// Indented tree listing, one node per line
    pub fn render_tree(&self) -> String {
        let mut out = String::new();
        for node in &self.nodes {
            let depth = self.ancestors(node.index).count();
            let kind = match &node.operator {
                Some(op) => op.clone(),
                None if node.parallel => "group, parallel".into(),
                None => "group".into(),
            };
            let marker = if node.is_error_branch && node.parent.is_some_and(|p| {
                self.nodes[p].error_child == Some(node.index)
            }) {
                "on_error "
            } else {
                ""
            };
            let _ = writeln!(
                out,
                "{:>3} {}{}{} ({})",
                node.index,
                "  ".repeat(depth),
                marker,
                node.name,
                kind
            );
        }
        out
    }
}
