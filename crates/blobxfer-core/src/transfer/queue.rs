//! Shared chunk work queue.
//!
//! A min-heap keyed by `(sequence, insertion order)`. Workers always take the
//! lowest outstanding sequence index, so for every object a chunk is handed
//! out only after all of its predecessors. Full-object IV chaining relies on
//! this.

use std::{
    cmp::Ordering,
    collections::BinaryHeap,
    sync::atomic::{AtomicU64, Ordering as AtomicOrdering},
};

use parking_lot::Mutex;

use super::instruction::ChunkInstruction;

struct QueueEntry {
    sequence: u64,
    insertion: u64,
    instruction: ChunkInstruction,
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.sequence == other.sequence && self.insertion == other.insertion
    }
}

impl Eq for QueueEntry {}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueEntry {
    // Reversed: BinaryHeap is a max-heap.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .sequence
            .cmp(&self.sequence)
            .then_with(|| other.insertion.cmp(&self.insertion))
    }
}

#[derive(Default)]
pub struct ChunkQueue {
    heap: Mutex<BinaryHeap<QueueEntry>>,
    next_insertion: AtomicU64,
}

impl ChunkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, instruction: ChunkInstruction) {
        let insertion = self.next_insertion.fetch_add(1, AtomicOrdering::Relaxed);
        self.heap.lock().push(QueueEntry {
            sequence: instruction.sequence,
            insertion,
            instruction,
        });
    }

    pub fn extend(&self, instructions: impl IntoIterator<Item = ChunkInstruction>) {
        let mut heap = self.heap.lock();
        for instruction in instructions {
            let insertion = self.next_insertion.fetch_add(1, AtomicOrdering::Relaxed);
            heap.push(QueueEntry {
                sequence: instruction.sequence,
                insertion,
                instruction,
            });
        }
    }

    pub fn pop(&self) -> Option<ChunkInstruction> {
        self.heap.lock().pop().map(|entry| entry.instruction)
    }

    pub fn len(&self) -> usize {
        self.heap.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.lock().is_empty()
    }
}
