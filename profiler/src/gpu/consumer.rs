//! GPU PC-sample consumption
//!
//! Producer side: the launching thread claims a ring slot, drains one block
//! from the driver into it, tags every record with its own active CCT node,
//! and hands the slot to the consumer over the queue. Consumer side: a
//! background loop appends blocks to the session's outgoing report in FIFO
//! order and frees the slots.

use crate::attribution::ActiveNodeTable;
use crate::gpu::context::ContextInfo;
use crate::gpu::driver::{driver_expect, PcSamplingDriver};
use crate::gpu::ring::PcRing;
use crate::sys;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use kernelscope_shared::PcSampleBlock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::debug;

/// One block handed from producer to consumer.
pub enum QueuedBlock {
    /// A filled ring slot
    Slot { index: usize, context_uid: u32 },

    /// A block drained outside the ring (post-disable provisioning flush)
    Owned {
        block: PcSampleBlock,
        context_uid: u32,
    },
}

/// Tag every record with the pulling thread's active node.
///
/// The snapshot is taken once per block under the active-node lock: all
/// records of one pull belong to the same launch context.
fn tag_block(block: &mut PcSampleBlock, active: &ActiveNodeTable) {
    let tid = sys::current_tid();
    let parent = active.active_of(tid).unwrap_or(0);
    for record in &mut block.records {
        record.parent_node_id = parent;
    }
}

/// Pull one block from the driver for `info` and enqueue it.
pub fn pull_block(
    driver: &dyn PcSamplingDriver,
    info: &ContextInfo,
    ring: &PcRing,
    active: &ActiveNodeTable,
    tx: &Sender<QueuedBlock>,
) {
    let index = ring.claim();
    ring.with_block(index, |block| {
        block.reset();
        driver_expect(driver.get_data(info.handle, block), "get_data");
        tag_block(block, active);
    });
    let _ = tx.send(QueuedBlock::Slot {
        index,
        context_uid: info.uid(),
    });
}

/// Drain `info` until the driver reports nothing pending.
pub fn drain_context(
    driver: &dyn PcSamplingDriver,
    info: &ContextInfo,
    ring: &PcRing,
    active: &ActiveNodeTable,
    tx: &Sender<QueuedBlock>,
) {
    while driver_expect(driver.pending(info.handle), "pending").any() {
        pull_block(driver, info, ring, active, tx);
    }
}

/// Post-disable flush: the driver may deposit late hardware records after
/// sampling is disabled. Drain them through the context's provisioning
/// buffer and enqueue an owned copy.
pub fn flush_provisioning(
    driver: &dyn PcSamplingDriver,
    info: &ContextInfo,
    active: &ActiveNodeTable,
    tx: &Sender<QueuedBlock>,
) {
    if !driver_expect(driver.pending(info.handle), "pending").any() {
        return;
    }
    let mut provisioning = info.provisioning.lock().unwrap();
    provisioning.reset();
    driver_expect(driver.get_data(info.handle, &mut provisioning), "get_data");
    tag_block(&mut provisioning, active);
    if !provisioning.is_empty() {
        debug!(
            context = info.uid(),
            records = provisioning.records.len(),
            "late records flushed after disable"
        );
        let _ = tx.send(QueuedBlock::Owned {
            block: provisioning.clone(),
            context_uid: info.uid(),
        });
    }
}

pub(crate) fn append(ring: &PcRing, sink: &Mutex<Vec<PcSampleBlock>>, queued: QueuedBlock) {
    match queued {
        QueuedBlock::Slot { index, context_uid } => {
            let block = ring.with_block(index, |block| block.clone());
            ring.release(index);
            debug!(context = context_uid, records = block.records.len(), "block consumed");
            sink.lock().unwrap().push(block);
        }
        QueuedBlock::Owned { block, context_uid } => {
            debug!(context = context_uid, records = block.records.len(), "owned block consumed");
            sink.lock().unwrap().push(block);
        }
    }
}

/// Consumer loop: runs until sampling stops, then drains what is queued and
/// exits. Blocks on the queue while sampling is active.
pub fn run_consumer(
    rx: Receiver<QueuedBlock>,
    ring: Arc<PcRing>,
    sink: Arc<Mutex<Vec<PcSampleBlock>>>,
    sampling_active: Arc<AtomicBool>,
) {
    debug!("pc consumer started");
    loop {
        let stopping = !sampling_active.load(Ordering::Acquire);
        while let Ok(queued) = rx.try_recv() {
            append(&ring, &sink, queued);
        }
        if stopping {
            break;
        }
        match rx.recv_timeout(Duration::from_millis(10)) {
            Ok(queued) => append(&ring, &sink, queued),
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    debug!("pc consumer drained and exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CollectionMode;
    use crate::gpu::driver::{SamplingConfig, StallReasonTable};
    use crate::gpu::mock::{sample_record, MockDriver};
    use std::thread;

    fn test_context(handle: u64) -> ContextInfo {
        ContextInfo::new(
            handle,
            StallReasonTable::default(),
            SamplingConfig {
                sampling_period: None,
                scratch_buf_size: None,
                hw_buf_size: None,
                stall_reason_indexes: vec![0],
                collection_mode: CollectionMode::Continuous,
                enable_start_stop: true,
            },
            8,
        )
    }

    #[test]
    fn test_pull_block_tags_with_active_node() {
        let driver = MockDriver::new();
        driver.enable(1).unwrap();
        driver.push_samples(1, vec![sample_record("k", 0x10, 3)]);

        let ring = PcRing::new(2, 8);
        let active = ActiveNodeTable::new();
        active.set_active(sys::current_tid(), 99);
        let (tx, rx) = crossbeam_channel::unbounded();

        let info = test_context(1);
        pull_block(&driver, &info, &ring, &active, &tx);

        match rx.try_recv().unwrap() {
            QueuedBlock::Slot { index, .. } => {
                ring.with_block(index, |block| {
                    assert_eq!(block.records.len(), 1);
                    assert_eq!(block.records[0].parent_node_id, 99);
                });
            }
            QueuedBlock::Owned { .. } => panic!("expected ring slot"),
        }
    }

    #[test]
    fn test_drain_context_empties_driver() {
        let driver = MockDriver::new();
        driver.enable(1).unwrap();
        let records: Vec<_> = (0..20).map(|i| sample_record("k", i, 1)).collect();
        driver.push_samples(1, records);

        let ring = PcRing::new(4, 8);
        let active = ActiveNodeTable::new();
        let (tx, rx) = crossbeam_channel::unbounded();
        let info = test_context(1);

        // Consume in lockstep so the 4-slot ring never fills.
        let sink = Mutex::new(Vec::new());
        drain_context(&driver, &info, &ring, &active, &tx);
        while let Ok(q) = rx.try_recv() {
            append(&ring, &sink, q);
        }

        assert_eq!(driver.queued_len(1), 0);
        let blocks = sink.into_inner().unwrap();
        let total: usize = blocks.iter().map(|b| b.records.len()).sum();
        assert_eq!(total, 20);
    }

    #[test]
    fn test_slow_consumer_observes_all_blocks_in_order() {
        // Ring of 2, 5 produced blocks, consumer sleeps per pop: the
        // producer must hit back-pressure yet nothing is lost or reordered.
        let ring = Arc::new(PcRing::new(2, 4));
        let (tx, rx) = crossbeam_channel::unbounded();

        let producer = {
            let ring = ring.clone();
            thread::spawn(move || {
                for i in 0..5u64 {
                    let index = ring.claim();
                    ring.with_block(index, |block| {
                        block.reset();
                        block.range_id = i;
                    });
                    tx.send(QueuedBlock::Slot {
                        index,
                        context_uid: 1,
                    })
                    .unwrap();
                }
            })
        };

        let sink = Mutex::new(Vec::new());
        for _ in 0..5 {
            let queued = rx.recv_timeout(Duration::from_secs(5)).unwrap();
            thread::sleep(Duration::from_millis(10));
            append(&ring, &sink, queued);
        }
        producer.join().unwrap();

        let order: Vec<u64> = sink
            .into_inner()
            .unwrap()
            .iter()
            .map(|b| b.range_id)
            .collect();
        assert_eq!(order, vec![0, 1, 2, 3, 4]);
        assert!(ring.backpressure_hit());
    }

    #[test]
    fn test_run_consumer_drains_on_stop() {
        let ring = Arc::new(PcRing::new(4, 4));
        let (tx, rx) = crossbeam_channel::unbounded();
        let sink = Arc::new(Mutex::new(Vec::new()));
        let sampling_active = Arc::new(AtomicBool::new(true));

        let consumer = {
            let (ring, sink, active) = (ring.clone(), sink.clone(), sampling_active.clone());
            thread::spawn(move || run_consumer(rx, ring, sink, active))
        };

        for i in 0..3u64 {
            let index = ring.claim();
            ring.with_block(index, |block| {
                block.reset();
                block.range_id = i;
            });
            tx.send(QueuedBlock::Slot {
                index,
                context_uid: 1,
            })
            .unwrap();
        }
        sampling_active.store(false, Ordering::Release);
        consumer.join().unwrap();

        assert_eq!(sink.lock().unwrap().len(), 3);
    }
}
