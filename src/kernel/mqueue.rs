/*
 * kernos - an RTOS core for small microcontrollers.
 *
 * SPDX-License-Identifier: MIT
 */

//! Message queues.
//!
//! Fixed-size message slots carved out of a caller-supplied buffer, with
//! a free-slot chain and one FIFO bucket per message priority (bucket
//! count set by [`OS_MQUEUE_PRIO_LEVELS`]; higher send priorities clamp
//! into the top bucket). A bucket bitmap makes "highest-priority, oldest
//! message" an O(1) lookup. Senders and receivers block on separate
//! priority-ordered wait lists.
//!
//! The buffer is partitioned at creation into the slot data, a per-slot
//! link array (free chain and bucket FIFOs share it; a slot is on
//! exactly one chain), and a per-slot priority array.

use crate::config::OS_MQUEUE_PRIO_LEVELS;
use crate::kernel::list::{self, prio_key, List};
use crate::kernel::thread::{self, Thread};
use crate::kernel::{clock, scheduler};
use crate::port;
use crate::trace;
use crate::types::*;

/// "No slot" chain terminator.
const NO_SLOT: MqSize = MQ_MAX_SIZE;

/// Words in the bucket-occupancy bitmap.
const MAP_WORDS: usize = (OS_MQUEUE_PRIO_LEVELS + 31) / 32;

const _: () = assert!(OS_MQUEUE_PRIO_LEVELS >= 1 && OS_MQUEUE_PRIO_LEVELS <= 256);

/// Creation attributes.
pub struct Attributes {
    pub name: &'static str,
}

impl Attributes {
    pub const fn new() -> Self {
        Attributes { name: "-" }
    }
}

impl Default for Attributes {
    fn default() -> Self {
        Self::new()
    }
}

/// Message queue control block.
pub struct MessageQueue {
    /// Slot payload area: `capacity * msg_size` bytes.
    pub(crate) data: *mut u8,
    /// Per-slot next index, threading the free chain and the buckets.
    pub(crate) links: *mut MqSize,
    /// Per-slot original send priority.
    pub(crate) prios: *mut MsgPriority,

    pub(crate) msg_size: MsgSize,
    pub(crate) capacity: MqSize,
    pub(crate) first_free: MqSize,
    pub(crate) used: MqSize,

    pub(crate) bucket_head: [MqSize; OS_MQUEUE_PRIO_LEVELS],
    pub(crate) bucket_tail: [MqSize; OS_MQUEUE_PRIO_LEVELS],
    pub(crate) bucket_map: [u32; MAP_WORDS],

    pub(crate) send_waiters: List,
    pub(crate) recv_waiters: List,

    pub(crate) created: bool,
    pub(crate) name: &'static str,
}

impl MessageQueue {
    pub const fn new() -> Self {
        MessageQueue {
            data: core::ptr::null_mut(),
            links: core::ptr::null_mut(),
            prios: core::ptr::null_mut(),
            msg_size: 0,
            capacity: 0,
            first_free: NO_SLOT,
            used: 0,
            bucket_head: [NO_SLOT; OS_MQUEUE_PRIO_LEVELS],
            bucket_tail: [NO_SLOT; OS_MQUEUE_PRIO_LEVELS],
            bucket_map: [0; MAP_WORDS],
            send_waiters: List::new(),
            recv_waiters: List::new(),
            created: false,
            name: "-",
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Messages currently queued.
    pub fn used(&self) -> usize {
        self.used as usize
    }

    pub fn capacity(&self) -> usize {
        self.capacity as usize
    }

    /// Slot payload size in bytes.
    pub fn msg_size(&self) -> usize {
        self.msg_size as usize
    }
}

impl Default for MessageQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Bytes of buffer needed for `capacity` slots of `msg_size` bytes.
pub const fn storage_size(capacity: usize, msg_size: usize) -> usize {
    capacity * msg_size + 2 * capacity
}

/// Initialize a message queue over a caller-supplied buffer.
///
/// The buffer must provide [`storage_size`] bytes; it is partitioned
/// into slot data, the link array, and the priority array.
///
/// # Safety
///
/// `q` must point to a valid control block not in use; `buf` must be
/// writable for `buf_len` bytes and unused by anything else.
pub unsafe fn create(
    q: *mut MessageQueue,
    attr: &Attributes,
    buf: *mut u8,
    buf_len: usize,
    capacity: MqSize,
    msg_size: MsgSize,
) -> Result<()> {
    check(!q.is_null() && !buf.is_null(), Error::Invalid)?;
    check(capacity > 0, Error::Invalid)?;
    check(
        msg_size > 0 && msg_size as usize <= crate::config::OS_MQUEUE_MAX_MSG_SIZE,
        Error::Invalid,
    )?;
    check(
        buf_len >= storage_size(capacity as usize, msg_size as usize),
        Error::Invalid,
    )?;

    *q = MessageQueue::new();
    let data_len = capacity as usize * msg_size as usize;
    (*q).data = buf;
    (*q).links = buf.add(data_len);
    (*q).prios = buf.add(data_len + capacity as usize);
    (*q).msg_size = msg_size;
    (*q).capacity = capacity;
    (*q).name = attr.name;

    // Thread every slot onto the free chain.
    for i in 0..capacity {
        *(*q).links.add(i as usize) = if i + 1 == capacity { NO_SLOT } else { i + 1 };
    }
    (*q).first_free = 0;
    (*q).created = true;
    Ok(())
}

// =============================================================================
// Bucket plumbing (all inside a critical section)
// =============================================================================

#[inline(always)]
fn bucket_of(prio: MsgPriority) -> usize {
    (prio as usize).min(OS_MQUEUE_PRIO_LEVELS - 1)
}

unsafe fn bucket_append(q: *mut MessageQueue, bucket: usize, idx: MqSize) {
    *(*q).links.add(idx as usize) = NO_SLOT;
    let tail = (*q).bucket_tail[bucket];
    if tail == NO_SLOT {
        (*q).bucket_head[bucket] = idx;
    } else {
        *(*q).links.add(tail as usize) = idx;
    }
    (*q).bucket_tail[bucket] = idx;
    (*q).bucket_map[bucket / 32] |= 1 << (bucket % 32);
}

unsafe fn bucket_pop(q: *mut MessageQueue, bucket: usize) -> MqSize {
    let idx = (*q).bucket_head[bucket];
    debug_assert!(idx != NO_SLOT);
    let next = *(*q).links.add(idx as usize);
    (*q).bucket_head[bucket] = next;
    if next == NO_SLOT {
        (*q).bucket_tail[bucket] = NO_SLOT;
        (*q).bucket_map[bucket / 32] &= !(1 << (bucket % 32));
    }
    idx
}

unsafe fn highest_bucket(q: *mut MessageQueue) -> Option<usize> {
    let mut w = MAP_WORDS;
    while w > 0 {
        w -= 1;
        let word = (*q).bucket_map[w];
        if word != 0 {
            return Some(w * 32 + (31 - word.leading_zeros() as usize));
        }
    }
    None
}

// =============================================================================
// Send / receive
// =============================================================================

/// Copy `len` bytes of `msg` into the queue at `prio`, blocking while
/// the queue is full. Zero `timeout` is the try form.
///
/// # Errors
///
/// `MessageTooLarge` when `len` exceeds the slot size.
///
/// # Safety
///
/// `q` must be a valid, created queue; `msg` readable for `len` bytes.
pub unsafe fn send(
    q: *mut MessageQueue,
    msg: *const u8,
    len: usize,
    prio: MsgPriority,
    timeout: Duration,
) -> Result<()> {
    check(!q.is_null() && !msg.is_null(), Error::Invalid)?;
    check(len > 0, Error::Invalid)?;
    let t = scheduler::current();
    if timeout != 0 {
        check(!port::in_handler_mode(), Error::NotPermitted)?;
        check(!t.is_null(), Error::NotPermitted)?;
        thread::consume_cancel(t)?;
    }

    let deadline = if timeout == 0 || timeout == WAIT_FOREVER {
        None
    } else {
        Some(clock::now().saturating_add(timeout as Timestamp))
    };

    loop {
        let s = port::irq_save();
        if !(*q).created {
            port::irq_restore(s);
            return Err(Error::Invalid);
        }
        if len > (*q).msg_size as usize {
            port::irq_restore(s);
            return Err(Error::MessageTooLarge);
        }
        if (*q).used < (*q).capacity {
            let idx = (*q).first_free;
            debug_assert!(idx != NO_SLOT);
            (*q).first_free = *(*q).links.add(idx as usize);

            let slot = (*q).data.add(idx as usize * (*q).msg_size as usize);
            core::ptr::copy_nonoverlapping(msg, slot, len);
            // Fixed-size slots: the unused tail reads as zero.
            core::ptr::write_bytes(slot.add(len), 0, (*q).msg_size as usize - len);
            *(*q).prios.add(idx as usize) = prio;

            bucket_append(q, bucket_of(prio), idx);
            (*q).used += 1;

            let head = (*q).recv_waiters.head();
            if !head.is_null() {
                let w = (*head).owner as *mut Thread;
                trace::sync_wake(q as usize, w as usize);
                thread::wake(w, None);
                scheduler::preempt();
            }
            port::irq_restore(s);
            return Ok(());
        }
        if timeout == 0 {
            port::irq_restore(s);
            return Err(Error::Again);
        }

        trace::sync_block(q as usize, t as usize);
        (*t).wake_err = None;
        (*t).wait_node.key = prio_key((*t).prio);
        (*t).wait_prio_ordered = true;
        (*q).send_waiters.insert_ordered(&mut (*t).wait_node);
        if let Some(d) = deadline {
            clock::arm(t, d);
        }
        (*t).state = ThreadState::Waiting;
        scheduler::block_current();
        port::irq_restore(s);

        let s = port::irq_save();
        list::unlink(&mut (*t).wait_node);
        clock::disarm(t);
        (*t).wait_prio_ordered = false;
        let err = (*t).wake_err.take();
        port::irq_restore(s);
        if let Some(e) = err {
            return Err(e);
        }
    }
}

/// Non-blocking send. Callable from handler mode.
///
/// # Safety
///
/// See [`send`].
pub unsafe fn try_send(q: *mut MessageQueue, msg: *const u8, len: usize, prio: MsgPriority) -> Result<()> {
    send(q, msg, len, prio, 0)
}

/// Take the highest-priority, oldest message into `out`, blocking while
/// the queue is empty. Writes the message's original priority through
/// `prio_out` when non-null. Returns the slot size. Zero `timeout` is
/// the try form.
///
/// # Errors
///
/// `MessageTooLarge` when `out_len` is smaller than the slot size.
///
/// # Safety
///
/// `q` must be a valid, created queue; `out` writable for `out_len`
/// bytes.
pub unsafe fn receive(
    q: *mut MessageQueue,
    out: *mut u8,
    out_len: usize,
    prio_out: *mut MsgPriority,
    timeout: Duration,
) -> Result<usize> {
    check(!q.is_null() && !out.is_null(), Error::Invalid)?;
    let t = scheduler::current();
    if timeout != 0 {
        check(!port::in_handler_mode(), Error::NotPermitted)?;
        check(!t.is_null(), Error::NotPermitted)?;
        thread::consume_cancel(t)?;
    }

    let deadline = if timeout == 0 || timeout == WAIT_FOREVER {
        None
    } else {
        Some(clock::now().saturating_add(timeout as Timestamp))
    };

    loop {
        let s = port::irq_save();
        if !(*q).created {
            port::irq_restore(s);
            return Err(Error::Invalid);
        }
        if out_len < (*q).msg_size as usize {
            port::irq_restore(s);
            return Err(Error::MessageTooLarge);
        }
        if (*q).used > 0 {
            let bucket = match highest_bucket(q) {
                Some(b) => b,
                None => {
                    // Occupancy disagrees with the buckets: the storage
                    // was trampled.
                    port::irq_restore(s);
                    check_invariant(false, Error::BadMessage)?;
                    return Err(Error::BadMessage);
                }
            };
            let idx = bucket_pop(q, bucket);
            let slot = (*q).data.add(idx as usize * (*q).msg_size as usize);
            core::ptr::copy_nonoverlapping(slot, out, (*q).msg_size as usize);
            if !prio_out.is_null() {
                *prio_out = *(*q).prios.add(idx as usize);
            }

            *(*q).links.add(idx as usize) = (*q).first_free;
            (*q).first_free = idx;
            (*q).used -= 1;

            let head = (*q).send_waiters.head();
            if !head.is_null() {
                let w = (*head).owner as *mut Thread;
                trace::sync_wake(q as usize, w as usize);
                thread::wake(w, None);
                scheduler::preempt();
            }
            let n = (*q).msg_size as usize;
            port::irq_restore(s);
            return Ok(n);
        }
        if timeout == 0 {
            port::irq_restore(s);
            return Err(Error::Again);
        }

        trace::sync_block(q as usize, t as usize);
        (*t).wake_err = None;
        (*t).wait_node.key = prio_key((*t).prio);
        (*t).wait_prio_ordered = true;
        (*q).recv_waiters.insert_ordered(&mut (*t).wait_node);
        if let Some(d) = deadline {
            clock::arm(t, d);
        }
        (*t).state = ThreadState::Waiting;
        scheduler::block_current();
        port::irq_restore(s);

        let s = port::irq_save();
        list::unlink(&mut (*t).wait_node);
        clock::disarm(t);
        (*t).wait_prio_ordered = false;
        let err = (*t).wake_err.take();
        port::irq_restore(s);
        if let Some(e) = err {
            return Err(e);
        }
    }
}

/// Non-blocking receive. Callable from handler mode.
///
/// # Safety
///
/// See [`receive`].
pub unsafe fn try_receive(
    q: *mut MessageQueue,
    out: *mut u8,
    out_len: usize,
    prio_out: *mut MsgPriority,
) -> Result<usize> {
    receive(q, out, out_len, prio_out, 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::test_support::fixture;

    const CAP: usize = 4;
    const MSG: usize = 4;

    unsafe fn make(buf: &mut [u8]) -> MessageQueue {
        let mut q = MessageQueue::new();
        create(
            &mut q,
            &Attributes::new(),
            buf.as_mut_ptr(),
            buf.len(),
            CAP as MqSize,
            MSG as MsgSize,
        )
        .unwrap();
        q
    }

    unsafe fn push(q: *mut MessageQueue, text: &str, prio: MsgPriority) {
        try_send(q, text.as_ptr(), text.len(), prio).unwrap();
    }

    unsafe fn pop(q: *mut MessageQueue) -> (u8, MsgPriority) {
        let mut out = [0u8; MSG];
        let mut prio = 0;
        let n = try_receive(q, out.as_mut_ptr(), out.len(), &mut prio).unwrap();
        assert_eq!(n, MSG);
        (out[0], prio)
    }

    #[test]
    fn create_checks_buffer_size() {
        let _k = fixture();
        unsafe {
            let mut small = [0u8; 4];
            let mut q = MessageQueue::new();
            assert_eq!(
                create(
                    &mut q,
                    &Attributes::new(),
                    small.as_mut_ptr(),
                    small.len(),
                    CAP as MqSize,
                    MSG as MsgSize,
                ),
                Err(Error::Invalid)
            );
        }
    }

    #[test]
    fn priority_then_fifo_ordering() {
        let _k = fixture();
        let mut buf = [0u8; storage_size(CAP, MSG)];
        unsafe {
            let mut q = make(&mut buf);
            push(&mut q, "a", 0);
            push(&mut q, "b", 1);
            push(&mut q, "c", 0);
            push(&mut q, "d", 2);
            assert_eq!(q.used(), 4);

            assert_eq!(pop(&mut q), (b'd', 2));
            assert_eq!(pop(&mut q), (b'b', 1));
            assert_eq!(pop(&mut q), (b'a', 0));
            assert_eq!(pop(&mut q), (b'c', 0));
            assert_eq!(q.used(), 0);
        }
    }

    #[test]
    fn full_queue_rejects_try_send() {
        let _k = fixture();
        let mut buf = [0u8; storage_size(CAP, MSG)];
        unsafe {
            let mut q = make(&mut buf);
            for _ in 0..CAP {
                push(&mut q, "x", 0);
            }
            assert_eq!(
                try_send(&mut q, b"y".as_ptr(), 1, 0),
                Err(Error::Again)
            );
            // Freeing one slot makes room again.
            pop(&mut q);
            assert_eq!(try_send(&mut q, b"y".as_ptr(), 1, 0), Ok(()));
        }
    }

    #[test]
    fn empty_queue_rejects_try_receive() {
        let _k = fixture();
        let mut buf = [0u8; storage_size(CAP, MSG)];
        unsafe {
            let mut q = make(&mut buf);
            let mut out = [0u8; MSG];
            assert_eq!(
                try_receive(&mut q, out.as_mut_ptr(), out.len(), core::ptr::null_mut()),
                Err(Error::Again)
            );
        }
    }

    #[test]
    fn oversized_messages_are_refused() {
        let _k = fixture();
        let mut buf = [0u8; storage_size(CAP, MSG)];
        unsafe {
            let mut q = make(&mut buf);
            let big = [0u8; MSG + 1];
            assert_eq!(
                try_send(&mut q, big.as_ptr(), big.len(), 0),
                Err(Error::MessageTooLarge)
            );

            push(&mut q, "a", 0);
            let mut small = [0u8; MSG - 1];
            assert_eq!(
                try_receive(&mut q, small.as_mut_ptr(), small.len(), core::ptr::null_mut()),
                Err(Error::MessageTooLarge)
            );
        }
    }

    #[test]
    fn over_range_priorities_clamp_but_report_original() {
        let _k = fixture();
        let mut buf = [0u8; storage_size(CAP, MSG)];
        unsafe {
            let mut q = make(&mut buf);
            push(&mut q, "a", 200); // clamps into the top bucket
            push(&mut q, "b", 255);
            // FIFO within the shared top bucket, original prio reported.
            assert_eq!(pop(&mut q), (b'a', 200));
            assert_eq!(pop(&mut q), (b'b', 255));
        }
    }

    #[test]
    fn slots_recycle_through_the_free_chain() {
        let _k = fixture();
        let mut buf = [0u8; storage_size(CAP, MSG)];
        unsafe {
            let mut q = make(&mut buf);
            for round in 0..3 {
                for i in 0..CAP {
                    let byte = [b'0' + (round * CAP + i) as u8];
                    try_send(&mut q, byte.as_ptr(), 1, 0).unwrap();
                }
                for i in 0..CAP {
                    let (b, _) = pop(&mut q);
                    assert_eq!(b, b'0' + (round * CAP + i) as u8);
                }
            }
        }
    }
}
