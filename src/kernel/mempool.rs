/*
 * kernos - an RTOS core for small microcontrollers.
 *
 * SPDX-License-Identifier: MIT
 */

//! Memory pools.
//!
//! A fixed-block allocator over a caller-supplied, word-aligned buffer.
//! Free blocks are threaded into a chain through their own first word,
//! so the pool needs no bookkeeping storage of its own. Freed blocks are
//! stamped in their second word, which lets `free` catch the common
//! double-free. Allocation can block; callers waiting for a block queue
//! FIFO.

use core::ffi::c_void;
use core::mem::size_of;
use core::ptr;

use crate::config::OS_MEMPOOL_FREE_STAMP;
use crate::kernel::list::{self, List};
use crate::kernel::thread::{self, Thread};
use crate::kernel::{clock, scheduler};
use crate::port;
use crate::trace;
use crate::types::*;

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

/// Memory pool control block.
pub struct MemoryPool {
    pub(crate) buf: *mut u8,
    pub(crate) block_size: usize,
    pub(crate) capacity: PoolSize,
    pub(crate) free_head: *mut usize,
    pub(crate) free_count: PoolSize,
    pub(crate) waiters: List,
    pub(crate) created: bool,
    pub(crate) name: &'static str,
}

impl MemoryPool {
    pub const fn new() -> Self {
        MemoryPool {
            buf: ptr::null_mut(),
            block_size: 0,
            capacity: 0,
            free_head: ptr::null_mut(),
            free_count: 0,
            waiters: List::new(),
            created: false,
            name: "-",
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn capacity(&self) -> usize {
        self.capacity as usize
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Blocks currently free.
    pub fn free_count(&self) -> usize {
        self.free_count as usize
    }
}

impl Default for MemoryPool {
    fn default() -> Self {
        Self::new()
    }
}

/// Initialize a pool of `blocks` blocks of `block_size` bytes each.
///
/// `block_size` must be a multiple of the word size and at least two
/// words (the free chain and the stamp live inside free blocks); `buf`
/// must be word-aligned and at least `blocks * block_size` bytes.
///
/// # Safety
///
/// `pool` must point to a valid control block not in use; `buf` must be
/// writable and unused by anything else.
pub unsafe fn create(
    pool: *mut MemoryPool,
    attr: &Attributes,
    buf: *mut u8,
    buf_len: usize,
    blocks: PoolSize,
    block_size: usize,
) -> Result<()> {
    check(!pool.is_null() && !buf.is_null(), Error::Invalid)?;
    check(
        blocks > 0 && blocks as usize <= crate::config::OS_MEMPOOL_MAX_BLOCKS,
        Error::Invalid,
    )?;
    check(
        block_size >= 2 * size_of::<usize>() && block_size % size_of::<usize>() == 0,
        Error::Invalid,
    )?;
    check(buf as usize % size_of::<usize>() == 0, Error::Invalid)?;
    check(buf_len >= blocks as usize * block_size, Error::Invalid)?;

    *pool = MemoryPool::new();
    (*pool).buf = buf;
    (*pool).block_size = block_size;
    (*pool).capacity = blocks;
    (*pool).name = attr.name;

    // Thread the blocks, last to first, stamping each as free.
    let mut head: *mut usize = ptr::null_mut();
    let mut i = blocks as usize;
    while i > 0 {
        i -= 1;
        let blk = buf.add(i * block_size) as *mut usize;
        *blk = head as usize;
        *blk.add(1) = OS_MEMPOOL_FREE_STAMP as usize;
        head = blk;
    }
    (*pool).free_head = head;
    (*pool).free_count = blocks;
    (*pool).created = true;
    Ok(())
}

/// Take a block, blocking while the pool is empty. Zero `timeout` is
/// the try form.
///
/// # Safety
///
/// `pool` must be a valid, created pool.
pub unsafe fn alloc(pool: *mut MemoryPool, timeout: Duration) -> Result<*mut c_void> {
    check(!pool.is_null(), Error::Invalid)?;
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
        if !(*pool).created {
            port::irq_restore(s);
            return Err(Error::Invalid);
        }
        let blk = (*pool).free_head;
        if !blk.is_null() {
            (*pool).free_head = *blk as *mut usize;
            *blk.add(1) = 0; // un-stamp
            (*pool).free_count -= 1;
            port::irq_restore(s);
            return Ok(blk as *mut c_void);
        }
        if timeout == 0 {
            port::irq_restore(s);
            return Err(Error::Again);
        }

        trace::sync_block(pool as usize, t as usize);
        (*t).wake_err = None;
        (*pool).waiters.push_back(&mut (*t).wait_node);
        if let Some(d) = deadline {
            clock::arm(t, d);
        }
        (*t).state = ThreadState::Waiting;
        scheduler::block_current();
        port::irq_restore(s);

        let s = port::irq_save();
        list::unlink(&mut (*t).wait_node);
        clock::disarm(t);
        let err = (*t).wake_err.take();
        port::irq_restore(s);
        if let Some(e) = err {
            return Err(e);
        }
    }
}

/// Non-blocking allocation. Callable from handler mode.
///
/// # Safety
///
/// `pool` must be a valid, created pool.
pub unsafe fn try_alloc(pool: *mut MemoryPool) -> Result<*mut c_void> {
    alloc(pool, 0)
}

/// Return a block to the pool and release one waiting allocator.
/// Callable from handler mode.
///
/// # Errors
///
/// `Invalid` - pointer outside the pool, misaligned, or already free
/// (caught by the stamp).
///
/// # Safety
///
/// `pool` must be a valid, created pool; `block` must not be used after
/// this call.
pub unsafe fn free(pool: *mut MemoryPool, block: *mut c_void) -> Result<()> {
    check(!pool.is_null() && !block.is_null(), Error::Invalid)?;

    let s = port::irq_save();
    if !(*pool).created {
        port::irq_restore(s);
        return Err(Error::Invalid);
    }

    let base = (*pool).buf as usize;
    let addr = block as usize;
    let span = (*pool).capacity as usize * (*pool).block_size;
    if addr < base || addr >= base + span || (addr - base) % (*pool).block_size != 0 {
        port::irq_restore(s);
        return Err(Error::Invalid);
    }

    let blk = block as *mut usize;
    if *blk.add(1) == OS_MEMPOOL_FREE_STAMP as usize {
        // Already on the free chain.
        port::irq_restore(s);
        return Err(Error::Invalid);
    }

    *blk = (*pool).free_head as usize;
    *blk.add(1) = OS_MEMPOOL_FREE_STAMP as usize;
    (*pool).free_head = blk;
    (*pool).free_count += 1;

    let head = (*pool).waiters.head();
    if !head.is_null() {
        let w = (*head).owner as *mut Thread;
        trace::sync_wake(pool as usize, w as usize);
        thread::wake(w, None);
        scheduler::preempt();
    }
    port::irq_restore(s);
    Ok(())
}
