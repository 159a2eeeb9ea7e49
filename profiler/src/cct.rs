//! Per-thread calling context trees
//!
//! Nodes are owned by their tree's id index and refer to each other by id
//! only, so no reference cycles exist. One tree per OS thread that has ever
//! launched a kernel or been sampled; trees live until process exit.

use crate::unwind::FrameKind;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

pub type NodeId = u64;

/// Outcome of a tree insertion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertStatus {
    Success,
    /// The child id is already present under this parent
    DupId,
    /// Another child of this parent has the same pc
    DupPc,
    /// The tree already has a root
    DupRoot,
    /// The parent id does not exist in this tree
    ParentNotFound,
}

/// One calling-context node.
#[derive(Debug, Clone)]
pub struct CctNode {
    pub id: NodeId,
    pub pc: u64,
    pub offset: u64,
    /// 0 for the root
    pub parent_id: NodeId,
    pub parent_pc: u64,
    pub kind: FrameKind,
    pub func_name: String,
    /// Child ids in insertion order (reports depend on this determinism)
    pub children: Vec<NodeId>,
    /// pc → child id
    pub pc_index: HashMap<u64, NodeId>,
    /// Child ids, for duplicate detection and id-based traversal
    pub id_index: HashSet<NodeId>,
}

impl CctNode {
    pub fn new(id: NodeId, pc: u64, offset: u64, kind: FrameKind, func_name: String) -> Self {
        Self {
            id,
            pc,
            offset,
            parent_id: 0,
            parent_pc: 0,
            kind,
            func_name,
            children: Vec::new(),
            pc_index: HashMap::new(),
            id_index: HashSet::new(),
        }
    }

    /// Copy identity fields only; relations are rebuilt by the receiving tree.
    pub fn copy_without_relations(&self) -> Self {
        Self::new(self.id, self.pc, self.offset, self.kind, self.func_name.clone())
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }
}

/// One per-thread tree.
#[derive(Debug, Default)]
pub struct Cct {
    root: Option<NodeId>,
    nodes: HashMap<NodeId, CctNode>,
}

impl Cct {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn root_id(&self) -> Option<NodeId> {
        self.root
    }

    pub fn node(&self, id: NodeId) -> Option<&CctNode> {
        self.nodes.get(&id)
    }

    pub fn node_mut(&mut self, id: NodeId) -> Option<&mut CctNode> {
        self.nodes.get_mut(&id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &CctNode> {
        self.nodes.values()
    }

    pub fn set_root(&mut self, node: CctNode) -> InsertStatus {
        if self.root.is_some() {
            return InsertStatus::DupRoot;
        }
        self.root = Some(node.id);
        self.nodes.insert(node.id, node);
        InsertStatus::Success
    }

    /// Insert `child` under `parent_id`, updating both child indexes.
    ///
    /// `allow_dup_pc` is only used by the pruning copy, where collapsed
    /// operator chains can surface pc collisions.
    pub fn insert_child(
        &mut self,
        parent_id: NodeId,
        mut child: CctNode,
        allow_dup_pc: bool,
    ) -> InsertStatus {
        let Some(parent) = self.nodes.get_mut(&parent_id) else {
            return InsertStatus::ParentNotFound;
        };
        if parent.id_index.contains(&child.id) {
            return InsertStatus::DupId;
        }
        if !allow_dup_pc && parent.pc_index.contains_key(&child.pc) {
            return InsertStatus::DupPc;
        }

        child.parent_id = parent.id;
        child.parent_pc = parent.pc;
        parent.children.push(child.id);
        parent.id_index.insert(child.id);
        parent.pc_index.insert(child.pc, child.id);
        self.nodes.insert(child.id, child);
        InsertStatus::Success
    }

    pub fn child_by_pc(&self, parent_id: NodeId, pc: u64) -> Option<NodeId> {
        self.nodes.get(&parent_id)?.pc_index.get(&pc).copied()
    }
}

/// Process-wide store: one tree per thread plus the id allocator.
pub struct CctStore {
    ccts: Mutex<HashMap<i32, Cct>>,
    next_id: Mutex<NodeId>,
}

impl Default for CctStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CctStore {
    pub fn new() -> Self {
        Self {
            ccts: Mutex::new(HashMap::new()),
            next_id: Mutex::new(1),
        }
    }

    /// Allocate a process-wide unique, monotonically increasing node id.
    pub fn allocate_id(&self) -> NodeId {
        let mut next = self.next_id.lock().unwrap();
        let id = *next;
        *next += 1;
        id
    }

    /// Run `f` against the tree for `tid`, creating it (with its synthetic
    /// root) on first use. The root's name encodes the owning thread.
    pub fn with_cct<R>(&self, tid: i32, f: impl FnOnce(&mut Cct) -> R) -> R {
        let mut ccts = self.ccts.lock().unwrap();
        if !ccts.contains_key(&tid) {
            let id = self.allocate_id();
            let mut root = CctNode::new(
                id,
                0,
                0,
                FrameKind::Native,
                format!("thread:{}::id:{}", tid, id),
            );
            root.parent_id = 0;
            let mut cct = Cct::new();
            cct.set_root(root);
            ccts.insert(tid, cct);
        }
        f(ccts.get_mut(&tid).expect("cct just ensured"))
    }

    /// Root id for `tid`, creating the tree on first use.
    pub fn root_of(&self, tid: i32) -> NodeId {
        self.with_cct(tid, |cct| cct.root_id().expect("root set at creation"))
    }

    /// Run `f` against every tree (report assembly and pruning).
    pub fn with_all<R>(&self, f: impl FnOnce(&HashMap<i32, Cct>) -> R) -> R {
        let ccts = self.ccts.lock().unwrap();
        f(&ccts)
    }
}
