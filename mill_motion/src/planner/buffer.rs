//! Planner block arena.
//!
//! Fixed pool of blocks addressed by index, linked into a ring by index
//! arithmetic. The block state word is the ownership token between the main
//! context (allocate/commit/reap) and the exec context (promote/finalize):
//! writers fill the block first, then publish with a release store; readers
//! acquire-load the state before touching the rest.

use std::sync::atomic::{AtomicU8, Ordering};

use mill_common::consts::{AXES, PLANNER_BUFFER_POOL_SIZE};
use mill_common::gcode::{CoordSystem, SpindleMode};
use mill_common::state::MachineState;

// ─── Block State and Move Type ──────────────────────────────────────

/// Ownership state of a planner block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BlockState {
    /// Available for allocation.
    Free = 0,
    /// Reserved by the main context, being filled.
    Write = 1,
    /// Committed and visible to the executor.
    Queued = 2,
    /// Being executed.
    Run = 3,
    /// Executor done; awaiting release by the main context.
    Final = 4,
}

impl BlockState {
    #[inline]
    const fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Write,
            2 => Self::Queued,
            3 => Self::Run,
            4 => Self::Final,
            _ => Self::Free,
        }
    }
}

/// Kind of work a block carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum MoveType {
    /// No-op placeholder.
    #[default]
    Null = 0,
    /// Jerk-limited straight move.
    Line = 1,
    /// Timed delay with no movement.
    Dwell = 2,
    /// Deferred modal command, executed in queue order.
    Command = 3,
}

/// Deferred commands carried by command-type blocks and dispatched in the
/// exec context, in strict FIFO order relative to motion blocks.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum QueuedCommand {
    /// Recompute the runtime work offset for the given coordinate system.
    SyncWorkOffsets(CoordSystem),
    /// M6 — make the tool current.
    ChangeTool(u8),
    /// T word — preselect a tool.
    SelectTool(u8),
    /// M7 / part of M9.
    MistCoolant(bool),
    /// M8 / M9 (off also clears mist).
    FloodCoolant(bool),
    /// M3/M4/M5.
    SpindleMode(SpindleMode),
    /// S word — pass-through to the model.
    SpindleSpeed(f64),
    /// M0/M1/M60/M2/M30 — halt the cycle with the given machine state.
    ProgramFinalize(MachineState),
}

// ─── Block ──────────────────────────────────────────────────────────

/// One node of the planner ring.
#[derive(Debug)]
pub struct Block {
    state: AtomicU8,

    pub move_type: MoveType,
    /// Back-planner may still tighten this block's velocities.
    pub replannable: bool,
    /// Back-planner has visited this block at least once.
    pub planned: bool,
    pub linenum: u32,

    /// Payload for command blocks.
    pub command: Option<QueuedCommand>,
    /// Payload for dwell blocks [s].
    pub seconds: f64,

    pub target: [f64; AXES],
    pub unit: [f64; AXES],
    pub work_offset: [f64; AXES],

    /// Planned move duration [min].
    pub time: f64,
    /// Rate-limited minimum duration [min].
    pub min_time: f64,
    /// Total line length [mm]. Always > 0 for line blocks.
    pub length: f64,

    pub head_length: f64,
    pub body_length: f64,
    pub tail_length: f64,

    pub entry_velocity: f64,
    pub cruise_velocity: f64,
    pub exit_velocity: f64,

    pub entry_vmax: f64,
    pub cruise_vmax: f64,
    pub exit_vmax: f64,
    /// Maximum velocity change supportable across this block's length.
    pub delta_vmax: f64,
    pub braking_velocity: f64,

    /// Along-path jerk limit [mm/min³].
    pub jerk: f64,
    /// 1/jerk, compute-once.
    pub recip_jerk: f64,
    /// ∛jerk, compute-once.
    pub cbrt_jerk: f64,
}

impl Block {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(BlockState::Free as u8),
            move_type: MoveType::Null,
            replannable: false,
            planned: false,
            linenum: 0,
            command: None,
            seconds: 0.0,
            target: [0.0; AXES],
            unit: [0.0; AXES],
            work_offset: [0.0; AXES],
            time: 0.0,
            min_time: 0.0,
            length: 0.0,
            head_length: 0.0,
            body_length: 0.0,
            tail_length: 0.0,
            entry_velocity: 0.0,
            cruise_velocity: 0.0,
            exit_velocity: 0.0,
            entry_vmax: 0.0,
            cruise_vmax: 0.0,
            exit_vmax: 0.0,
            delta_vmax: 0.0,
            braking_velocity: 0.0,
            jerk: 0.0,
            recip_jerk: 0.0,
            cbrt_jerk: 0.0,
        }
    }

    /// Current ownership state (acquire).
    #[inline]
    pub fn state(&self) -> BlockState {
        BlockState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Publish a new ownership state (release). The rest of the block must
    /// be written before this.
    #[inline]
    pub fn set_state(&self, state: BlockState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Reset all payload fields. State is managed separately.
    pub fn clear(&mut self) {
        let state = self.state.load(Ordering::Relaxed);
        *self = Self::new();
        self.state.store(state, Ordering::Relaxed);
    }
}

impl Default for Block {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Buffer Pool ────────────────────────────────────────────────────

/// Ring of planner blocks.
pub struct BufferPool {
    blocks: Box<[Block]>,
    /// Next slot to allocate.
    w: usize,
    /// Oldest occupied slot (run/reap head).
    r: usize,
    /// Free block count.
    available: usize,
}

impl BufferPool {
    pub fn new() -> Self {
        let blocks: Vec<Block> = (0..PLANNER_BUFFER_POOL_SIZE).map(|_| Block::new()).collect();
        Self {
            blocks: blocks.into_boxed_slice(),
            w: 0,
            r: 0,
            available: PLANNER_BUFFER_POOL_SIZE,
        }
    }

    #[inline]
    pub fn available(&self) -> usize {
        self.available
    }

    /// Returns true when every block is free.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.available == PLANNER_BUFFER_POOL_SIZE
    }

    /// Oldest occupied slot.
    #[inline]
    pub fn head_index(&self) -> usize {
        self.r
    }

    #[inline]
    pub fn next_index(&self, index: usize) -> usize {
        (index + 1) % PLANNER_BUFFER_POOL_SIZE
    }

    #[inline]
    pub fn prev_index(&self, index: usize) -> usize {
        (index + PLANNER_BUFFER_POOL_SIZE - 1) % PLANNER_BUFFER_POOL_SIZE
    }

    #[inline]
    pub fn block(&self, index: usize) -> &Block {
        &self.blocks[index]
    }

    #[inline]
    pub fn block_mut(&mut self, index: usize) -> &mut Block {
        &mut self.blocks[index]
    }

    /// Reserve the next free block for writing. Decrements availability.
    pub fn get_write(&mut self) -> Option<usize> {
        if self.available == 0 {
            return None;
        }
        let idx = self.w;
        if self.blocks[idx].state() != BlockState::Free {
            return None;
        }
        self.blocks[idx].clear();
        self.blocks[idx].set_state(BlockState::Write);
        self.w = self.next_index(idx);
        self.available -= 1;
        Some(idx)
    }

    /// Commit a written block: publish it to the executor.
    pub fn commit_write(&mut self, index: usize) {
        debug_assert_eq!(self.blocks[index].state(), BlockState::Write);
        self.blocks[index].set_state(BlockState::Queued);
    }

    /// Release finalized blocks at the head of the ring back to the pool.
    /// Called from the main context before each allocation round.
    pub fn reap_finalized(&mut self) {
        while self.available < PLANNER_BUFFER_POOL_SIZE {
            let idx = self.r;
            if self.blocks[idx].state() != BlockState::Final {
                break;
            }
            self.blocks[idx].clear();
            self.blocks[idx].set_state(BlockState::Free);
            self.r = self.next_index(idx);
            self.available += 1;
        }
    }

    /// First block the executor can work on: the oldest queued or running
    /// block, skipping blocks awaiting release.
    pub fn first_runnable(&self) -> Option<usize> {
        let occupied = PLANNER_BUFFER_POOL_SIZE - self.available;
        let mut idx = self.r;
        for _ in 0..occupied {
            match self.blocks[idx].state() {
                BlockState::Queued | BlockState::Run => return Some(idx),
                BlockState::Final => idx = self.next_index(idx),
                // Write slot (still being filled) ends the committed range.
                _ => return None,
            }
        }
        None
    }

    /// Newest committed block, if any.
    pub fn newest_committed(&self) -> Option<usize> {
        if self.available == PLANNER_BUFFER_POOL_SIZE {
            return None;
        }
        let idx = self.prev_index(self.w);
        match self.blocks[idx].state() {
            BlockState::Queued | BlockState::Run | BlockState::Final => Some(idx),
            _ => None,
        }
    }

    /// Drop every block and return the pool to its initial state.
    pub fn reset(&mut self) {
        for b in self.blocks.iter_mut() {
            b.clear();
            b.set_state(BlockState::Free);
        }
        self.w = 0;
        self.r = 0;
        self.available = PLANNER_BUFFER_POOL_SIZE;
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocation_lifecycle() {
        let mut pool = BufferPool::new();
        assert_eq!(pool.available(), PLANNER_BUFFER_POOL_SIZE);

        let idx = pool.get_write().unwrap();
        assert_eq!(pool.available(), PLANNER_BUFFER_POOL_SIZE - 1);
        assert_eq!(pool.block(idx).state(), BlockState::Write);
        assert!(pool.first_runnable().is_none());

        pool.commit_write(idx);
        assert_eq!(pool.first_runnable(), Some(idx));

        pool.block(idx).set_state(BlockState::Run);
        pool.block(idx).set_state(BlockState::Final);
        // Not reusable until the main context reaps it.
        assert!(pool.first_runnable().is_none());
        pool.reap_finalized();
        assert_eq!(pool.available(), PLANNER_BUFFER_POOL_SIZE);
        assert!(pool.is_empty());
    }

    #[test]
    fn pool_exhaustion() {
        let mut pool = BufferPool::new();
        for _ in 0..PLANNER_BUFFER_POOL_SIZE {
            let idx = pool.get_write().unwrap();
            pool.commit_write(idx);
        }
        assert!(pool.get_write().is_none());
        assert_eq!(pool.available(), 0);
    }

    #[test]
    fn runnable_skips_finalized() {
        let mut pool = BufferPool::new();
        let a = pool.get_write().unwrap();
        pool.commit_write(a);
        let b = pool.get_write().unwrap();
        pool.commit_write(b);

        pool.block(a).set_state(BlockState::Final);
        assert_eq!(pool.first_runnable(), Some(b));
        assert_eq!(pool.newest_committed(), Some(b));
    }

    #[test]
    fn reset_clears_everything() {
        let mut pool = BufferPool::new();
        for _ in 0..5 {
            let idx = pool.get_write().unwrap();
            pool.commit_write(idx);
        }
        pool.reset();
        assert!(pool.is_empty());
        assert!(pool.first_runnable().is_none());
        assert!(pool.newest_committed().is_none());
    }
}
