//! Calling-context attribution
//!
//! Turns an unwound stack into tree updates: shared prefixes merge onto
//! existing nodes, unseen suffixes become new nodes, and the deepest node
//! becomes the thread's active node: the id every GPU PC record pulled by
//! that thread is tagged with until the next attribution.

use crate::cct::{CctStore, CctNode, NodeId};
use crate::config::Config;
use crate::courier::Courier;
use crate::sys;
use crate::unwind::{CallStackStatus, Frame, FrameKind, Unwinder};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Active-node bookkeeping, shared with the PC-consumer tagging path.
///
/// One lock guards both maps: the stack-pointer cache is only meaningful
/// together with the active id it shortcuts to.
#[derive(Default)]
pub struct ActiveNodeTable {
    inner: Mutex<ActiveState>,
}

#[derive(Default)]
struct ActiveState {
    by_thread: HashMap<i32, NodeId>,
    sp_cache: HashMap<u64, NodeId>,
}

impl ActiveNodeTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_active(&self, tid: i32, id: NodeId) {
        self.inner.lock().unwrap().by_thread.insert(tid, id);
    }

    /// Set the active node and remember the stack pointer that produced it.
    pub fn set_active_and_cache(&self, tid: i32, id: NodeId, sp: u64) {
        let mut state = self.inner.lock().unwrap();
        state.by_thread.insert(tid, id);
        state.sp_cache.insert(sp, id);
    }

    /// Snapshot of the thread's active node (tagging path).
    pub fn active_of(&self, tid: i32) -> Option<NodeId> {
        self.inner.lock().unwrap().by_thread.get(&tid).copied()
    }

    pub fn lookup_sp(&self, sp: u64) -> Option<NodeId> {
        self.inner.lock().unwrap().sp_cache.get(&sp).copied()
    }
}

/// The attribution engine (unwinder + store + active-node table).
pub struct AttributionEngine {
    config: Arc<Config>,
    store: Arc<CctStore>,
    active: Arc<ActiveNodeTable>,
    unwinder: Unwinder,
    courier: Option<Arc<Courier>>,
}

impl AttributionEngine {
    pub fn new(
        config: Arc<Config>,
        store: Arc<CctStore>,
        active: Arc<ActiveNodeTable>,
        unwinder: Unwinder,
        courier: Option<Arc<Courier>>,
    ) -> Self {
        Self {
            config,
            store,
            active,
            unwinder,
            courier,
        }
    }

    pub fn store(&self) -> &Arc<CctStore> {
        &self.store
    }

    pub fn active(&self) -> &Arc<ActiveNodeTable> {
        &self.active
    }

    /// Attribute the calling thread: ensure its tree, unwind, merge, and
    /// move the active node to the deepest attributed frame.
    pub fn attribute_current_thread(&self, verbose: bool) {
        let tid = sys::current_tid();
        let root = self.store.root_of(tid);

        // Overhead-baseline mode: everything lands on the thread root.
        if self.config.fake_unwind {
            self.active.set_active(tid, root);
            if verbose {
                debug!(tid, root, "fake unwind, active node set to thread root");
            }
            return;
        }

        let sp = sys::current_sp();
        if self.config.check_sp {
            if let Some(id) = self.active.lookup_sp(sp) {
                self.active.set_active(tid, id);
                if verbose {
                    debug!(tid, sp, id, "sp already unwound, active node restored");
                }
                return;
            }
        }

        let (mut frames, status) = self.unwinder.unwind(verbose);

        // Worker threads without interpreter frames borrow the main
        // thread's interpreter context as an outer prefix.
        if status == CallStackStatus::NoInterp && self.config.do_interp_unwind {
            if let Some(courier) = &self.courier {
                let mut prefix = courier.request_main_frames();
                if !prefix.is_empty() {
                    prefix.extend(frames);
                    frames = prefix;
                }
            }
        }

        self.merge_frames(tid, &frames, Some(sp), true, verbose);
    }

    /// Fold an already-resolved native stack (CPU perf sample) into the
    /// tree of `tid`. Never touches the active node or the sp cache: a
    /// background sampler must not retag launches in flight on `tid`.
    pub fn attribute_sampled_stack(&self, tid: i32, pcs: &[u64], func_names: &[String]) {
        let mut frames = Vec::with_capacity(pcs.len());
        // Outermost-first; stop at the first unresolved or hidden frame.
        for i in (0..pcs.len().min(func_names.len())).rev() {
            if func_names[i].is_empty() || self.config.is_excluded(&func_names[i]) {
                break;
            }
            frames.push(Frame::native(pcs[i], 0, func_names[i].clone()));
        }
        if frames.is_empty() {
            return;
        }
        self.merge_frames(tid, &frames, None, false, false);
    }

    /// Merge `frames` (outermost-first) into the tree of `tid`.
    ///
    /// Matching children are reused (with the C2P upgrade applied when an
    /// interpreted frame lands on a native node), the unmatched suffix is
    /// inserted, and (when `update_active`) the deepest node becomes the
    /// thread's active node, with the stack pointer cached on insertion.
    pub(crate) fn merge_frames(
        &self,
        tid: i32,
        frames: &[Frame],
        sp: Option<u64>,
        update_active: bool,
        verbose: bool,
    ) {
        let deepest = self.store.with_cct(tid, |cct| {
            let mut current = cct.root_id().expect("root set at creation");
            let mut idx = 0;

            while idx < frames.len() {
                let frame = &frames[idx];
                let Some(child) = cct.child_by_pc(current, frame.pc) else {
                    break;
                };
                if frame.kind == FrameKind::Interpreted {
                    let node = cct.node_mut(child).expect("indexed child exists");
                    if node.kind == FrameKind::Native {
                        // C2P upgrade: the node was first seen through a raw
                        // eval-frame pc; adopt the interpreted identity.
                        node.kind = FrameKind::Interpreted;
                        node.func_name = interp_node_name(frame);
                        if verbose {
                            debug!(tid, id = node.id, "node upgraded to interpreted");
                        }
                    }
                }
                current = child;
                idx += 1;
            }

            for frame in &frames[idx..] {
                let id = self.store.allocate_id();
                let name = match frame.kind {
                    FrameKind::Native => frame.func_name.clone(),
                    FrameKind::Interpreted => interp_node_name(frame),
                };
                let node = CctNode::new(id, frame.pc, frame.offset, frame.kind, name);
                cct.insert_child(current, node, false);
                if verbose {
                    debug!(tid, id, pc = frame.pc, "node inserted");
                }
                current = id;
            }

            (current, idx == frames.len())
        });

        let (deepest, fully_matched) = deepest;
        if update_active {
            match (fully_matched, sp) {
                // A freshly inserted leaf also seeds the sp shortcut.
                (false, Some(sp)) => self.active.set_active_and_cache(tid, deepest, sp),
                _ => self.active.set_active(tid, deepest),
            }
            if verbose {
                debug!(tid, deepest, "active node updated");
            }
        }
    }
}

/// Node label for an interpreted frame: `<file>::<name>_<line>`.
fn interp_node_name(frame: &Frame) -> String {
    format!("{}::{}_{}", frame.file_name, frame.func_name, frame.offset)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> AttributionEngine {
        engine_with(Config::default())
    }

    fn engine_with(config: Config) -> AttributionEngine {
        let config = Arc::new(config);
        let store = Arc::new(CctStore::new());
        let active = Arc::new(ActiveNodeTable::new());
        let unwinder = Unwinder::new(config.clone(), None);
        AttributionEngine::new(config, store, active, unwinder, None)
    }

    fn native(pc: u64, name: &str) -> Frame {
        Frame::native(pc, 0x8, name.to_string())
    }

    fn interpreted(pc: u64, file: &str, func: &str, line: u64) -> Frame {
        Frame {
            pc,
            offset: line,
            func_name: func.to_string(),
            file_name: file.to_string(),
            kind: FrameKind::Interpreted,
        }
    }

    fn path_to_root(engine: &AttributionEngine, tid: i32, mut id: NodeId) -> Vec<NodeId> {
        engine.store.with_cct(tid, |cct| {
            let mut path = vec![id];
            while let Some(node) = cct.node(id) {
                if node.parent_id == 0 {
                    break;
                }
                id = node.parent_id;
                path.push(id);
            }
            path.reverse();
            path
        })
    }

    #[test]
    fn test_merge_inserts_full_chain() {
        let engine = engine();
        let frames = vec![native(0x10, "main"), native(0x20, "launch")];
        engine.merge_frames(7, &frames, Some(0xbeef), true, false);

        let active = engine.active.active_of(7).unwrap();
        let path = path_to_root(&engine, 7, active);
        assert_eq!(path.len(), 3); // root + 2 frames
        assert_eq!(engine.active.lookup_sp(0xbeef), Some(active));
    }

    #[test]
    fn test_repeat_stack_reuses_nodes_and_active() {
        let engine = engine();
        let frames = vec![native(0x10, "main"), native(0x20, "launch")];
        engine.merge_frames(7, &frames, Some(0x1000), true, false);
        let first = engine.active.active_of(7).unwrap();

        engine.merge_frames(7, &frames, Some(0x1000), true, false);
        let second = engine.active.active_of(7).unwrap();

        assert_eq!(first, second);
        engine.store.with_cct(7, |cct| assert_eq!(cct.len(), 3));
    }

    #[test]
    fn test_prefix_sharing() {
        let engine = engine();
        let a = vec![native(0x10, "main"), native(0x20, "site_a")];
        let b = vec![native(0x10, "main"), native(0x30, "site_b")];
        engine.merge_frames(7, &a, None, true, false);
        let leaf_a = engine.active.active_of(7).unwrap();
        engine.merge_frames(7, &b, None, true, false);
        let leaf_b = engine.active.active_of(7).unwrap();

        let path_a = path_to_root(&engine, 7, leaf_a);
        let path_b = path_to_root(&engine, 7, leaf_b);
        // Shared 1-frame prefix (plus root) resolves to the same nodes.
        assert_eq!(path_a[0], path_b[0]);
        assert_eq!(path_a[1], path_b[1]);
        assert_ne!(path_a[2], path_b[2]);
    }

    #[test]
    fn test_ids_monotonic_down_every_edge() {
        let engine = engine();
        let frames = vec![native(0x10, "a"), native(0x20, "b"), native(0x30, "c")];
        engine.merge_frames(3, &frames, None, true, false);

        engine.store.with_cct(3, |cct| {
            for node in cct.iter() {
                if node.parent_id != 0 {
                    assert!(node.parent_id < node.id);
                }
            }
        });
    }

    #[test]
    fn test_c2p_upgrade_is_idempotent() {
        let engine = engine();
        // First observation through the raw eval-frame pc.
        let native_first = vec![native(0x10, "main"), native(0x2a, "_PyEval_EvalFrameDefault")];
        engine.merge_frames(7, &native_first, None, true, false);
        let before = engine.store.with_cct(7, |cct| cct.len());

        // Same pc now arrives as an interpreted frame.
        let fused = vec![native(0x10, "main"), interpreted(0x2a, "main.py", "train::loss=f(x)", 4)];
        engine.merge_frames(7, &fused, None, true, false);
        let upgraded = engine.active.active_of(7).unwrap();
        engine.store.with_cct(7, |cct| {
            assert_eq!(cct.len(), before); // no new children
            let node = cct.node(upgraded).unwrap();
            assert_eq!(node.kind, FrameKind::Interpreted);
            assert_eq!(node.func_name, "main.py::train::loss=f(x)_4");
        });

        // A third pass must neither re-upgrade nor add children.
        engine.merge_frames(7, &fused, None, true, false);
        engine.store.with_cct(7, |cct| assert_eq!(cct.len(), before));
        assert_eq!(engine.active.active_of(7), Some(upgraded));
    }

    #[test]
    fn test_fake_unwind_pins_root() {
        let engine = engine_with(Config {
            fake_unwind: true,
            ..Default::default()
        });
        engine.attribute_current_thread(false);

        let tid = sys::current_tid();
        let root = engine.store.root_of(tid);
        assert_eq!(engine.active.active_of(tid), Some(root));
        engine.store.with_cct(tid, |cct| assert_eq!(cct.len(), 1));
    }

    #[test]
    fn test_sampled_stack_does_not_move_active() {
        let engine = engine();
        engine.merge_frames(7, &[native(0x10, "main")], None, true, false);
        let active = engine.active.active_of(7).unwrap();

        let pcs = vec![0x99, 0x10]; // innermost-first, as perf reports them
        let names = vec!["hot_loop".to_string(), "main".to_string()];
        engine.attribute_sampled_stack(7, &pcs, &names);

        assert_eq!(engine.active.active_of(7), Some(active));
        // But the tree did grow under main.
        engine.store.with_cct(7, |cct| assert_eq!(cct.len(), 3));
    }

    #[test]
    fn test_sampled_stack_stops_at_excluded_frame() {
        let engine = engine();
        let pcs = vec![0x30, 0x20, 0x10];
        let names = vec![
            "inner".to_string(),
            "cuptiLaunch".to_string(),
            "main".to_string(),
        ];
        engine.attribute_sampled_stack(5, &pcs, &names);

        // Only the outermost frame survives: the walk stops at the vendor
        // frame before reaching `inner`.
        engine.store.with_cct(5, |cct| assert_eq!(cct.len(), 2));
    }

    #[test]
    fn test_real_unwind_attributes_below_root() {
        let engine = engine();
        engine.attribute_current_thread(false);

        let tid = sys::current_tid();
        let active = engine.active.active_of(tid).unwrap();
        let root = engine.store.root_of(tid);
        assert_ne!(active, root);
    }
}
