//! Report-time tree pruning
//!
//! Full calling context trees are dominated by framework plumbing. The
//! pruning pass copies each tree keeping only nodes a reader cares about:
//! leaves (where GPU samples hang), framework operator calls, and the
//! interpreted frames that outline a training step. Runs of single-child
//! operator calls collapse into one node.

use crate::cct::{Cct, CctStore, NodeId};
use crate::config::{Backend, Config};
use crate::unwind::FrameKind;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, warn};

static TORCH_OP_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"at::_ops::(\S+)::call(\S+)").expect("static regex compiles"));
static TF_OP_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\S+)Op(Kernel)?.+::Compute").expect("static regex compiles"));

/// Operator-name prefix stripped when collapsing torch call chains.
const TORCH_OP_PREFIX: &str = "at::_ops::";

/// Why a node survives pruning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CriticalKind {
    Operator,
    Leaf,
    PyForward,
    PyBackward,
    PyLoss,
    NotCritical,
}

/// The pruning pass with its compiled operator matchers.
pub struct Pruner {
    /// Replaces both built-in operator regexes when configured
    op_override: Option<Regex>,
    /// Collapsing only applies to the torch-style operator chains
    collapse_ops: bool,
    entry_file: String,
}

impl Pruner {
    pub fn new(config: &Config) -> Self {
        let op_override = config.op_regex.as_deref().and_then(|pattern| {
            let compiled = Regex::new(pattern);
            if compiled.is_err() {
                warn!(pattern, "invalid operator regex override, using built-ins");
            }
            compiled.ok()
        });
        let collapse_ops = op_override.is_none() && config.backend == Backend::Torch;
        Self {
            op_override,
            collapse_ops,
            entry_file: config.entry_file.clone(),
        }
    }

    /// Operator test: the override when configured, otherwise both built-in
    /// regexes. Every node is checked against both frameworks' patterns.
    fn matches_operator(&self, func_name: &str) -> bool {
        match &self.op_override {
            Some(regex) => regex.is_match(func_name),
            None => TORCH_OP_REGEX.is_match(func_name) || TF_OP_REGEX.is_match(func_name),
        }
    }

    /// Classify one node of `cct`.
    pub fn classify(&self, cct: &Cct, id: NodeId) -> CriticalKind {
        let Some(node) = cct.node(id) else {
            return CriticalKind::NotCritical;
        };

        if node.kind == FrameKind::Interpreted && !node.func_name.contains("python3") {
            if node.func_name.contains("backward") {
                return CriticalKind::PyBackward;
            }
            if node.func_name.contains(&self.entry_file) && node.func_name.contains("loss") {
                return CriticalKind::PyLoss;
            }
            if node.func_name.contains("forward") {
                return CriticalKind::PyForward;
            }
        }

        if self.matches_operator(&node.func_name) {
            return CriticalKind::Operator;
        }

        if node.is_leaf() {
            return CriticalKind::Leaf;
        }

        CriticalKind::NotCritical
    }

    /// Copy `old` keeping critical nodes only. Node ids are preserved, so
    /// PC-sample tags remain valid against the pruned tree.
    pub fn prune_tree(&self, old: &Cct) -> Cct {
        let mut pruned = Cct::new();
        let Some(old_root) = old.root_id() else {
            return pruned;
        };
        let root_copy = old.node(old_root).expect("root exists").copy_without_relations();
        pruned.set_root(root_copy);
        self.prune_children(&mut pruned, old, old_root, old_root);
        pruned
    }

    fn prune_children(&self, pruned: &mut Cct, old: &Cct, pruned_at: NodeId, old_at: NodeId) {
        let children: Vec<NodeId> = old.node(old_at).map_or_else(Vec::new, |n| n.children.clone());
        let only_child = children.len() == 1;

        for child in children {
            if self.classify(old, child) == CriticalKind::NotCritical {
                // Skip the node but lift its critical descendants.
                self.prune_children(pruned, old, pruned_at, child);
                continue;
            }

            // A single-child torch op under a torch op collapses into its
            // parent instead of adding a chain link. Other operator kinds
            // never collapse.
            let parent_is_torch_op = pruned
                .node(pruned_at)
                .is_some_and(|n| TORCH_OP_REGEX.is_match(&n.func_name));
            let child_is_torch_op = old
                .node(child)
                .is_some_and(|n| TORCH_OP_REGEX.is_match(&n.func_name));
            if only_child && self.collapse_ops && parent_is_torch_op && child_is_torch_op {
                let suffix = old
                    .node(child)
                    .map(|n| {
                        n.func_name
                            .strip_prefix(TORCH_OP_PREFIX)
                            .unwrap_or(&n.func_name)
                            .to_string()
                    })
                    .unwrap_or_default();
                if let Some(parent) = pruned.node_mut(pruned_at) {
                    parent.func_name.push_str("::");
                    parent.func_name.push_str(&suffix);
                }
                self.prune_children(pruned, old, pruned_at, child);
                continue;
            }

            let copy = old.node(child).expect("child listed").copy_without_relations();
            let copy_id = copy.id;
            // Collapsed paths can surface duplicate pcs under one parent.
            pruned.insert_child(pruned_at, copy, true);
            self.prune_children(pruned, old, copy_id, child);
        }
    }

    /// Prune every tree in the store, in stable thread order.
    pub fn prune_all(&self, store: &CctStore) -> Vec<(i32, Cct)> {
        store.with_all(|ccts| {
            let mut tids: Vec<i32> = ccts.keys().copied().collect();
            tids.sort_unstable();
            let pruned: Vec<(i32, Cct)> = tids
                .into_iter()
                .map(|tid| (tid, self.prune_tree(&ccts[&tid])))
                .collect();
            debug!(trees = pruned.len(), "ccts pruned");
            pruned
        })
    }
}
