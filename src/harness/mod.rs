//! Correctness and utilization harness.
//!
//! Replays a parsed script against one allocator on a fresh segment, tracking every id's
//! payload, checking the payload bytes and the heap invariants between operations, and
//! measuring how tightly the allocator packs the segment.
//!
//! **Utilization** is `peak_live_payload / topmost_address_used`: the high-water mark of
//! requested bytes over the high-water byte offset any payload reached. An allocator that
//! places blocks low and recycles holes keeps the two close together.

use core::time::Duration;
use std::time::Instant;

use hashbrown::HashMap;
use log::{debug, error};

use crate::harness::script::Op;
use crate::mem::alloc::HeapAllocator;
use crate::mem::index::FreeIndex;
use crate::mem::rbtree::stack::RbStack;
use crate::mem::rbtree::topdown::RbTopdown;
use crate::mem::segment::Segment;
use crate::mem::seglist::SegList;
use crate::mem::{HeapAddr, ALIGNMENT};

pub mod script;

/// Which free index backs the allocator under test.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IndexKind {
    SegList,
    RbStack,
    RbTopdown,
}

impl core::str::FromStr for IndexKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "seglist" => Ok(Self::SegList),
            "rbstack" => Ok(Self::RbStack),
            "rbtopdown" => Ok(Self::RbTopdown),
            other => Err(format!(
                "unknown index {other:?}, expected seglist, rbstack or rbtopdown"
            )),
        }
    }
}

/// Harness knobs.
#[derive(Clone, Copy, Debug)]
pub struct RunConfig {
    /// Size of the backing segment.
    pub segment_bytes: usize,

    /// Skip the per-operation heap validation and payload checks. Used for timing runs.
    pub quiet: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            segment_bytes: 1 << 20,
            quiet: false,
        }
    }
}

/// Outcome of one script run.
#[derive(Clone, Debug)]
pub struct RunReport {
    pub ok: bool,
    pub failure: Option<String>,
    pub ops: usize,
    pub peak_live: usize,
    pub high_water: usize,
    pub utilization: f64,
    pub elapsed: Duration,
}

impl RunReport {
    fn failed(message: String) -> Self {
        error!(target: "harness", "{message}");

        Self {
            ok: false,
            failure: Some(message),
            ops: 0,
            peak_live: 0,
            high_water: 0,
            utilization: 0.0,
            elapsed: Duration::ZERO,
        }
    }
}

/// Live allocation owned by one script id.
struct Slot {
    payload: HeapAddr,
    size: usize,
}

unsafe fn fill_pattern(slot: &Slot, id: u32) {
    core::ptr::write_bytes(slot.payload.as_mut_ptr::<u8>(), (id & 0xFF) as u8, slot.size);
}

unsafe fn pattern_intact(slot: &Slot, id: u32, len: usize) -> bool {
    core::slice::from_raw_parts(slot.payload.as_ptr::<u8>(), len)
        .iter()
        .all(|&b| b == (id & 0xFF) as u8)
}

/// Replays `ops` against a fresh allocator built on the chosen index.
pub fn run_script<I: FreeIndex>(ops: &[Op], config: &RunConfig) -> RunReport {
    let segment = match Segment::map(config.segment_bytes) {
        Ok(segment) => segment,
        Err(err) => return RunReport::failed(format!("segment: {err}")),
    };

    let mut heap = match unsafe { HeapAllocator::<I>::init(segment.start(), config.segment_bytes) }
    {
        Ok(heap) => heap,
        Err(err) => return RunReport::failed(format!("init: {err}")),
    };

    let mut table: HashMap<u32, Slot> = HashMap::new();
    let mut live = 0usize;
    let mut peak_live = 0usize;
    let mut high_water = 0usize;

    let started = Instant::now();

    for (step, &op) in ops.iter().enumerate() {
        let outcome = unsafe {
            replay(
                &mut heap, &mut table, op, config.quiet, &mut live, &mut high_water,
            )
        };

        if let Err(message) = outcome {
            return RunReport::failed(format!("op {step} ({op:?}): {message}"));
        }

        peak_live = usize::max(peak_live, live);

        if !config.quiet && !heap.validate_heap() {
            return RunReport::failed(format!("op {step} ({op:?}): heap validation failed"));
        }
    }

    let elapsed = started.elapsed();

    let utilization = if high_water == 0 {
        1.0
    } else {
        peak_live as f64 / high_water as f64
    };

    debug!(
        target: "harness",
        "{} ops, peak {peak_live} bytes, top {high_water}, utilization {utilization:.3}",
        ops.len()
    );

    RunReport {
        ok: true,
        failure: None,
        ops: ops.len(),
        peak_live,
        high_water,
        utilization,
        elapsed,
    }
}

unsafe fn replay<I: FreeIndex>(
    heap: &mut HeapAllocator<I>,
    table: &mut HashMap<u32, Slot>,
    op: Op,
    quiet: bool,
    live: &mut usize,
    high_water: &mut usize,
) -> Result<(), String> {
    match op {
        Op::Malloc { id, size } => {
            if table.contains_key(&id) {
                return Err(format!("id {id} is already live"));
            }

            let payload = heap.malloc(size);
            if payload.is_null() {
                return Err(format!("malloc({size}) returned null"));
            }

            if !quiet {
                if !payload.is_aligned_with(ALIGNMENT) {
                    return Err(format!("misaligned payload {payload}"));
                }
                if payload < heap.client_start() || payload + size > heap.client_end() {
                    return Err(format!("payload {payload} outside the segment"));
                }
            }

            let slot = Slot { payload, size };
            fill_pattern(&slot, id);

            *live += size;
            *high_water = usize::max(*high_water, (payload + size) - heap.client_start());
            table.insert(id, slot);
        }

        Op::Realloc { id, size } => {
            let slot = table
                .get(&id)
                .ok_or_else(|| format!("realloc of unknown id {id}"))?;

            if !quiet && !pattern_intact(slot, id, slot.size) {
                return Err(format!("payload of id {id} corrupted before realloc"));
            }

            let old_size = slot.size;
            let payload = heap.realloc(slot.payload, size);
            if payload.is_null() {
                return Err(format!("realloc({size}) returned null"));
            }

            let moved = Slot { payload, size };

            if !quiet
                && !pattern_intact(&moved, id, usize::min(old_size, size))
            {
                return Err(format!("payload of id {id} lost across realloc"));
            }

            fill_pattern(&moved, id);

            *live = *live - old_size + size;
            *high_water = usize::max(*high_water, (payload + size) - heap.client_start());
            table.insert(id, moved);
        }

        Op::Free { id } => {
            let slot = table
                .remove(&id)
                .ok_or_else(|| format!("free of unknown id {id}"))?;

            if !quiet && !pattern_intact(&slot, id, slot.size) {
                return Err(format!("payload of id {id} corrupted before free"));
            }

            heap.free(slot.payload);
            *live -= slot.size;
        }
    }

    Ok(())
}

/// Runs `ops` on the allocator family selected at the command line.
pub fn run_script_on(kind: IndexKind, ops: &[Op], config: &RunConfig) -> RunReport {
    match kind {
        IndexKind::SegList => run_script::<SegList>(ops, config),
        IndexKind::RbStack => run_script::<RbStack>(ops, config),
        IndexKind::RbTopdown => run_script::<RbTopdown>(ops, config),
    }
}

#[cfg(test)]
mod tests {
    use super::script::parse_script;
    use super::*;

    const KINDS: [IndexKind; 3] = [IndexKind::SegList, IndexKind::RbStack, IndexKind::RbTopdown];

    #[test]
    fn runs_a_simple_trace_on_every_index() {
        let ops = parse_script(
            "a 0 100\n\
             a 1 2000\n\
             r 0 350\n\
             f 1\n\
             a 2 64\n\
             f 0\n\
             f 2\n",
        )
        .unwrap();

        for kind in KINDS {
            let report = run_script_on(kind, &ops, &RunConfig::default());
            assert!(report.ok, "{kind:?}: {:?}", report.failure);
            assert_eq!(report.ops, 7);
            assert!(report.utilization > 0.0 && report.utilization <= 1.0);
            assert!(report.peak_live >= 2100);
        }
    }

    #[test]
    fn quiet_mode_skips_checks_but_still_runs() {
        let ops = parse_script("a 0 512\nf 0\n").unwrap();
        let config = RunConfig {
            quiet: true,
            ..RunConfig::default()
        };

        for kind in KINDS {
            assert!(run_script_on(kind, &ops, &config).ok);
        }
    }

    #[test]
    fn bad_traces_fail_the_script() {
        let double_alloc = parse_script("a 0 64\na 0 64\n").unwrap();
        let unknown_free = parse_script("f 9\n").unwrap();
        let oversized = parse_script("a 0 9000000\n").unwrap();

        for kind in KINDS {
            let config = RunConfig {
                segment_bytes: 1 << 16,
                quiet: false,
            };

            assert!(!run_script_on(kind, &double_alloc, &config).ok);
            assert!(!run_script_on(kind, &unknown_free, &config).ok);

            let report = run_script_on(kind, &oversized, &config);
            assert!(!report.ok);
            assert!(report.failure.unwrap().contains("null"));
        }
    }

    #[test]
    fn utilization_reflects_packing() {
        // One long-lived allocation at the bottom, churn above it.
        let ops = parse_script(
            "a 0 4096\n\
             a 1 4096\n\
             f 1\n\
             a 2 4096\n\
             f 2\n\
             a 3 4096\n\
             f 3\n\
             f 0\n",
        )
        .unwrap();

        for kind in KINDS {
            let report = run_script_on(kind, &ops, &RunConfig::default());
            assert!(report.ok);
            // The churned ids all reuse the same hole: the top of the heap stays close to
            // the peak of live bytes.
            assert!(
                report.utilization > 0.9,
                "{kind:?} utilization {:.3}",
                report.utilization
            );
        }
    }
}
