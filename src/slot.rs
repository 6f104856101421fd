//! Fixed, pool-sized array of tagged atomic words, and the Treiber idle stack
//! threaded through them.
//!
//! Each [`Slot`] is a single atomic word whose low two bits tag one of four
//! disjoint states (`Free`, `Associated`, `Spawning`, `Shutdown`); unassociated
//! slots form a lock-free LIFO idle stack whose top is recorded in the pool's
//! `idle_queue` word (see [`IdleQueue`]).
#![expect(unsafe_code, reason = "tagged-word state machine, CAS-validated transitions")]

use alloc::boxed::Box;
use core::ptr::NonNull;

use skein_os::sync::atomic::{AtomicUsize, Ordering};
use skein_os::Backoff;

use crate::worker::Thread;

const TAG_BITS: usize = 2;
const TAG_MASK: usize = (1 << TAG_BITS) - 1;

const TAG_FREE: usize = 0b00;
const TAG_ASSOCIATED: usize = 0b01;
const TAG_SHUTDOWN: usize = 0b10;
const TAG_SPAWNING: usize = 0b11;

/// A decoded view of a [`Slot`]'s atomic word.
///
/// `Shutdown`/`Spawning` do not carry the OS-thread handle in-word (a `JoinHandle`
/// is not pointer-representable in safe Rust); handles are tracked out of band in
/// [`Slots::handles`], indexed by slot index, matching the spirit of "handle
/// awaiting final join" without requiring unsafe handle-packing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum SlotState {
    /// Member of the idle stack; payload is the 1-based index of the next free
    /// slot (0 = end of list).
    Free { next: usize },
    /// A live worker occupies this slot.
    Associated { thread: NonNull<Thread> },
    /// Worker exited; its `JoinHandle` (if any) is in `Slots::handles`.
    Shutdown,
    /// A waker is in the middle of creating this worker.
    Spawning,
}

impl SlotState {
    fn encode(self) -> usize {
        match self {
            SlotState::Free { next } => (next << TAG_BITS) | TAG_FREE,
            SlotState::Associated { thread } => (thread.as_ptr() as usize) | TAG_ASSOCIATED,
            SlotState::Shutdown => TAG_SHUTDOWN,
            SlotState::Spawning => TAG_SPAWNING,
        }
    }

    fn decode(word: usize) -> SlotState {
        match word & TAG_MASK {
            TAG_FREE => SlotState::Free { next: word >> TAG_BITS },
            TAG_ASSOCIATED => {
                let ptr = (word & !TAG_MASK) as *mut Thread;
                SlotState::Associated {
                    // SAFETY: only ever written from `SlotState::encode` on a live
                    // `&Thread`, never null (a worker always outlives its own slot
                    // publication).
                    thread: unsafe { NonNull::new_unchecked(ptr) },
                }
            }
            TAG_SHUTDOWN => SlotState::Shutdown,
            TAG_SPAWNING => SlotState::Spawning,
            _ => unreachable!("two tag bits admit exactly four states"),
        }
    }
}

pub(crate) struct Slot(AtomicUsize);

impl Slot {
    fn new(state: SlotState) -> Self {
        Slot(AtomicUsize::new(state.encode()))
    }

    pub(crate) fn load(&self, order: Ordering) -> SlotState {
        SlotState::decode(self.0.load(order))
    }

    /// Unconditionally overwrites the slot. Valid only when the caller already
    /// has exclusive ownership of it (e.g. just popped it off the idle stack),
    /// since `encode`'s payload bits (like `Free`'s `next`) vary with history and
    /// make a hardcoded `compare_exchange` expectation unreliable.
    pub(crate) fn store(&self, state: SlotState, order: Ordering) {
        self.0.store(state.encode(), order);
    }

    /// Attempts `current -> new`. Returns `Ok(())` on success, `Err(actual)` with
    /// the observed state on failure.
    pub(crate) fn compare_exchange(
        &self,
        current: SlotState,
        new: SlotState,
        success: Ordering,
        failure: Ordering,
    ) -> Result<(), SlotState> {
        self.0
            .compare_exchange(current.encode(), new.encode(), success, failure)
            .map(|_| ())
            .map_err(SlotState::decode)
    }
}

/// The pool-sized array of slots plus the idle stack's head word.
///
/// At init, slots are linked `0 -> 1 -> ... -> len-1 -> none` and `idle_queue`
/// points at slot `len` (1-based), i.e. the whole array starts on the idle stack.
pub(crate) struct Slots {
    slots: Box<[Slot]>,
    idle: IdleQueue,
}

const INDEX_BITS: u32 = 32;
const INDEX_MASK: usize = (1 << INDEX_BITS) - 1;
const ABA_SHIFT: u32 = INDEX_BITS;
const ABA_BITS: u32 = 8;
const ABA_MASK: usize = ((1 << ABA_BITS) - 1) << ABA_SHIFT;
const FLAGS_SHIFT: u32 = ABA_SHIFT + ABA_BITS;

pub(crate) const IS_WAKING: usize = 1 << FLAGS_SHIFT;
pub(crate) const IS_NOTIFIED: usize = 1 << (FLAGS_SHIFT + 1);
pub(crate) const IS_SHUTDOWN: usize = 1 << (FLAGS_SHIFT + 2);

/// `[top-slot-index : 32 | aba-tag : 8 | flags : 4]`, packed into one `usize`.
///
/// `top-slot-index` is 1-based; 0 means the idle stack is empty. `IS_POLLING`
/// lives in the global queue's tail word instead.
pub(crate) struct IdleQueue(AtomicUsize);

impl IdleQueue {
    fn new(top: usize) -> Self {
        IdleQueue(AtomicUsize::new(top & INDEX_MASK))
    }

    pub(crate) fn load(&self, order: Ordering) -> usize {
        self.0.load(order)
    }

    pub(crate) fn compare_exchange(
        &self,
        current: usize,
        new: usize,
        success: Ordering,
        failure: Ordering,
    ) -> Result<usize, usize> {
        self.0.compare_exchange(current, new, success, failure)
    }

    pub(crate) fn fetch_or(&self, bits: usize, order: Ordering) -> usize {
        self.0.fetch_or(bits, order)
    }

    pub(crate) const fn top(word: usize) -> usize {
        word & INDEX_MASK
    }

    pub(crate) const fn aba(word: usize) -> usize {
        (word & ABA_MASK) >> ABA_SHIFT
    }

    pub(crate) const fn flags(word: usize) -> usize {
        word & !(INDEX_MASK | ABA_MASK)
    }

    pub(crate) const fn pack(top: usize, aba: usize, flags: usize) -> usize {
        (top & INDEX_MASK) | ((aba << ABA_SHIFT) & ABA_MASK) | (flags & !(INDEX_MASK | ABA_MASK))
    }

    pub(crate) const fn bump_aba(word: usize) -> usize {
        let aba = (Self::aba(word) + 1) & ((1 << ABA_BITS) - 1);
        Self::pack(Self::top(word), aba, Self::flags(word))
    }
}

impl Slots {
    pub(crate) fn new(len: usize) -> Self {
        // `idle.top` starts at `len` (1-based), i.e. slot `len - 1`; each slot's
        // `next` must be the 1-based index of the slot below it on the stack,
        // matching `push_idle`'s convention (`next: top` = the previous top).
        // So slot `i` links to slot `i - 1` (1-based index `i`), and slot `0`
        // terminates the chain.
        let slots: Box<[Slot]> = (0..len).map(|i| Slot::new(SlotState::Free { next: i })).collect();
        Slots {
            slots,
            idle: IdleQueue::new(len),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn get(&self, index: usize) -> &Slot {
        &self.slots[index]
    }

    pub(crate) fn idle(&self) -> &IdleQueue {
        &self.idle
    }

    /// Pops the top of the idle stack, if any, retrying on contention.
    ///
    /// Returns the popped slot's 0-based index and its decoded state (`Free` or
    /// `Associated` only), or reports that the stack was empty or shutdown had
    /// already been observed.
    pub(crate) fn pop_idle(&self) -> PopOutcome {
        let backoff = Backoff::new();
        loop {
            let word = self.idle.load(Ordering::Acquire);
            if IdleQueue::flags(word) & IS_SHUTDOWN != 0 {
                return PopOutcome::Shutdown;
            }
            let top = IdleQueue::top(word);
            if top == 0 {
                return PopOutcome::Empty(word);
            }
            let index = top - 1;
            let state = self.slots[index].load(Ordering::Acquire);
            let next_top = match state {
                SlotState::Free { next } => next,
                // Associated slots carry no `next` payload of their own (the word's
                // payload is the thread pointer); the stack link for a parked,
                // re-linked worker lives on its own `Thread::idle_next` field.
                SlotState::Associated { thread } => unsafe {
                    thread.as_ref().idle_next.load(Ordering::Relaxed)
                },
                SlotState::Spawning => {
                    backoff.snooze();
                    continue;
                }
                SlotState::Shutdown => unreachable!(
                    "poll observed Shutdown slot during idle-stack traversal"
                ),
            };
            let new_word = IdleQueue::pack(next_top, IdleQueue::aba(word) + 1, IdleQueue::flags(word));
            if self
                .idle
                .compare_exchange(word, new_word, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return PopOutcome::Popped { index, state };
            }
            backoff.spin();
        }
    }

    /// Pushes slot `index`, tagged `state` (`Free` or `Associated`), onto the idle
    /// stack, bumping the ABA tag.
    pub(crate) fn push_idle(&self, index: usize, state: SlotState) {
        let backoff = Backoff::new();
        loop {
            let word = self.idle.load(Ordering::Relaxed);
            let top = IdleQueue::top(word);
            let linked = match state {
                SlotState::Free { .. } => SlotState::Free { next: top },
                SlotState::Associated { thread } => {
                    // SAFETY: `thread` outlives its slot's membership in the idle
                    // stack; access is serialized by the `idle_queue` CAS sequencing.
                    unsafe { thread.as_ref().idle_next.store(top, Ordering::Relaxed) };
                    SlotState::Associated { thread }
                }
                _ => panic!("only Free or Associated slots may be linked onto the idle stack"),
            };
            self.slots[index].0.store(linked.encode(), Ordering::Release);

            let new_word = IdleQueue::bump_aba(IdleQueue::pack(index + 1, IdleQueue::aba(word), IdleQueue::flags(word)));
            if self
                .idle
                .compare_exchange(word, new_word, Ordering::Release, Ordering::Relaxed)
                .is_ok()
            {
                return;
            }
            backoff.spin();
        }
    }
}

pub(crate) enum PopOutcome {
    Popped { index: usize, state: SlotState },
    Empty(usize),
    Shutdown,
}

impl core::fmt::Debug for Slots {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Slots").field("len", &self.slots.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn free_round_trips_through_encode_decode() {
        let state = SlotState::Free { next: 17 };
        assert_eq!(SlotState::decode(state.encode()), state);
    }

    #[test]
    fn shutdown_and_spawning_carry_no_payload() {
        assert_eq!(SlotState::decode(SlotState::Shutdown.encode()), SlotState::Shutdown);
        assert_eq!(SlotState::decode(SlotState::Spawning.encode()), SlotState::Spawning);
    }

    #[test]
    fn all_slots_start_free_and_linked() {
        let slots = Slots::new(4);
        assert_eq!(slots.len(), 4);
        for i in 0..4 {
            assert_eq!(slots.get(i).load(Ordering::Relaxed), SlotState::Free { next: i });
        }
    }

    #[test]
    fn fresh_pool_s_idle_stack_yields_every_slot_exactly_once() {
        let slots = Slots::new(4);
        let mut popped = Vec::new();
        loop {
            match slots.pop_idle() {
                PopOutcome::Popped { index, .. } => popped.push(index),
                PopOutcome::Empty(_) => break,
                PopOutcome::Shutdown => panic!("freshly constructed stack cannot be shut down"),
            }
        }
        popped.sort_unstable();
        assert_eq!(popped, vec![0, 1, 2, 3], "every initial slot must be reachable from the idle stack");
    }

    #[test]
    fn idle_stack_is_lifo() {
        let slots = Slots::new(4);
        // Drain the initial stack so the indices below exercise push/pop, not
        // the constructor's own linkage.
        while matches!(slots.pop_idle(), PopOutcome::Popped { .. }) {}
        assert!(matches!(slots.pop_idle(), PopOutcome::Empty(_)));

        slots.push_idle(0, SlotState::Free { next: 0 });
        slots.push_idle(1, SlotState::Free { next: 0 });
        match slots.pop_idle() {
            PopOutcome::Popped { index, .. } => assert_eq!(index, 1),
            _ => panic!("expected a populated idle stack"),
        }
        match slots.pop_idle() {
            PopOutcome::Popped { index, .. } => assert_eq!(index, 0),
            _ => panic!("expected a populated idle stack"),
        }
        assert!(matches!(slots.pop_idle(), PopOutcome::Empty(_)));
    }

    #[test]
    fn store_overwrites_regardless_of_prior_payload() {
        let slots = Slots::new(1);
        let slot = slots.get(0);
        slot.store(SlotState::Spawning, Ordering::Release);
        assert_eq!(slot.load(Ordering::Acquire), SlotState::Spawning);
        slot.store(SlotState::Free { next: 9 }, Ordering::Release);
        assert_eq!(slot.load(Ordering::Acquire), SlotState::Free { next: 9 });
    }
}
