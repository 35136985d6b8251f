//! # Small-Block Memory Allocator
//!
//! First-fit allocator over one flat arena, intended for small heaps (a few
//! KiB to a few hundred KiB) where a size-indexed free list is not worth its
//! RAM.
//!
//! ## Layout
//!
//! ```text
//! heap_ptr                                                     heap_end
//! │                                                               │
//! ▼                                                               ▼
//! ┌────────┬─────────┬────────┬──────────────┬────────┬─────┬────────┐
//! │ header │ payload │ header │   payload    │ header │ ... │ header │
//! │ used   │         │ free   │              │ used   │     │ used   │
//! └────────┴─────────┴────────┴──────────────┴────────┴─────┴────────┘
//!      ◄─── next/prev byte offsets link every block in address order ───►
//! ```
//!
//! Every block, free or used, starts with a header holding the pool magic
//! plus a used bit, and the byte offsets (relative to `heap_ptr`) of the
//! neighbouring blocks. `heap_end` is a permanently used sentinel closing
//! the chain. Two free blocks are never adjacent: `free` and shrinking
//! `realloc` coalesce immediately.
//!
//! `lfree` caches the lowest free block so allocation scans start past the
//! densely used bottom of the heap.

use core::marker::PhantomData;
use core::mem::size_of;
use core::ptr::NonNull;

use crate::config::{align_down, align_up, ALIGN_SIZE, MIN_BLOCK_SIZE};

const HEAP_MAGIC: u32 = 0x1ea0;

#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct Item {
    /// `HEAP_MAGIC << 1 | used`, or 0 for a header swallowed by coalescing.
    pool: u32,
    next: u32,
    prev: u32,
}

const SIZEOF_ITEM: usize = align_up(size_of::<Item>(), ALIGN_SIZE);
const MIN_SIZE_ALIGNED: usize = align_up(MIN_BLOCK_SIZE, ALIGN_SIZE);

const fn pool_word(used: bool) -> u32 {
    (HEAP_MAGIC << 1) | used as u32
}

/// Usage statistics of a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemInfo {
    /// Bytes available for blocks (headers included).
    pub total: usize,
    /// Bytes currently in use (headers included).
    pub used: usize,
    /// High-water mark of `used`.
    pub max_used: usize,
}

/// Small-block pool over a borrowed arena.
pub struct SmallMem<'a> {
    heap_ptr: NonNull<u8>,
    /// Usable bytes between `heap_ptr` and the `heap_end` header.
    mem_size_aligned: usize,
    /// Offset of the lowest known free block.
    lfree: usize,
    used: usize,
    max: usize,
    _arena: PhantomData<&'a mut [u8]>,
}

// Safety: SmallMem owns its arena exclusively for `'a`; all access goes
// through `&mut self`, and the kernel only touches it with interrupts masked.
unsafe impl Send for SmallMem<'_> {}

impl<'a> SmallMem<'a> {
    /// Build a pool over `arena`.
    ///
    /// Returns `None` when the aligned arena cannot hold the first block
    /// header and the `heap_end` sentinel.
    pub fn new(arena: &'a mut [u8]) -> Option<Self> {
        let start = arena.as_mut_ptr() as usize;
        let begin_align = align_up(start, ALIGN_SIZE);
        let end_align = align_down(start + arena.len(), ALIGN_SIZE);

        if end_align < begin_align || end_align - begin_align < 2 * SIZEOF_ITEM {
            log::warn!(
                "mem init, error begin address {:#x}, and end address {:#x}",
                start,
                start + arena.len()
            );
            return None;
        }
        let mem_size_aligned = end_align - begin_align - 2 * SIZEOF_ITEM;

        // SAFETY: begin_align lies inside `arena` (it is at most
        // ALIGN_SIZE - 1 bytes past its start and the arena is longer).
        let heap_ptr = unsafe { NonNull::new_unchecked(begin_align as *mut u8) };

        let mut pool = Self {
            heap_ptr,
            mem_size_aligned,
            lfree: 0,
            used: 0,
            max: 0,
            _arena: PhantomData,
        };
        let heap_end = pool.heap_end();
        pool.write(
            0,
            Item {
                pool: pool_word(false),
                next: heap_end as u32,
                prev: 0,
            },
        );
        pool.write(
            heap_end,
            Item {
                pool: pool_word(true),
                next: heap_end as u32,
                prev: heap_end as u32,
            },
        );
        log::debug!(
            "mem init, heap begin address {:#x}, size {}",
            begin_align,
            mem_size_aligned
        );
        Some(pool)
    }

    // -----------------------------------------------------------------------
    // Header access
    // -----------------------------------------------------------------------

    #[inline]
    fn heap_end(&self) -> usize {
        self.mem_size_aligned + SIZEOF_ITEM
    }

    #[inline]
    fn read(&self, off: usize) -> Item {
        debug_assert!(off <= self.heap_end() && off % ALIGN_SIZE == 0);
        // SAFETY: `off` is an aligned header offset inside the arena.
        unsafe { self.heap_ptr.as_ptr().add(off).cast::<Item>().read() }
    }

    #[inline]
    fn write(&mut self, off: usize, item: Item) {
        debug_assert!(off <= self.heap_end() && off % ALIGN_SIZE == 0);
        // SAFETY: as in `read`; `&mut self` gives exclusive arena access.
        unsafe { self.heap_ptr.as_ptr().add(off).cast::<Item>().write(item) }
    }

    #[inline]
    fn update(&mut self, off: usize, f: impl FnOnce(&mut Item)) {
        let mut item = self.read(off);
        f(&mut item);
        self.write(off, item);
    }

    #[inline]
    fn is_used(&self, off: usize) -> bool {
        self.read(off).pool & 1 == 1
    }

    #[inline]
    fn payload(&self, off: usize) -> NonNull<u8> {
        // SAFETY: off + SIZEOF_ITEM stays inside the arena for every block.
        unsafe { NonNull::new_unchecked(self.heap_ptr.as_ptr().add(off + SIZEOF_ITEM)) }
    }

    /// Header offset of the block whose payload starts at `rmem`.
    ///
    /// Panics on a pointer the pool never handed out.
    fn block_of(&self, rmem: NonNull<u8>) -> usize {
        let addr = rmem.as_ptr() as usize;
        let base = self.heap_ptr.as_ptr() as usize;
        assert!(addr % ALIGN_SIZE == 0, "unaligned pointer {:#x}", addr);
        assert!(
            addr >= base + SIZEOF_ITEM && addr < base + self.heap_end(),
            "pointer {:#x} outside of the heap",
            addr
        );
        let off = addr - base - SIZEOF_ITEM;
        let item = self.read(off);
        assert!(item.pool >> 1 == HEAP_MAGIC, "corrupted block header at {:#x}", addr);
        off
    }

    fn bump_max(&mut self) {
        if self.max < self.used {
            self.max = self.used;
        }
    }

    // -----------------------------------------------------------------------
    // Coalescing
    // -----------------------------------------------------------------------

    /// Merge the free block at `mem` with free neighbours on both sides.
    fn plug_holes(&mut self, mem: usize) {
        assert!(mem < self.heap_end());
        let heap_end = self.heap_end();

        // plug hole forward
        let nmem = self.read(mem).next as usize;
        if mem != nmem && !self.is_used(nmem) && nmem != heap_end {
            if self.lfree == nmem {
                self.lfree = mem;
            }
            let next = self.read(nmem).next;
            self.update(nmem, |n| n.pool = 0);
            self.update(mem, |m| m.next = next);
            self.update(next as usize, |n| n.prev = mem as u32);
        }

        // plug hole backward
        let pmem = self.read(mem).prev as usize;
        if pmem != mem && !self.is_used(pmem) {
            if self.lfree == mem {
                self.lfree = pmem;
            }
            let next = self.read(mem).next;
            self.update(mem, |m| m.pool = 0);
            self.update(pmem, |p| p.next = next);
            self.update(next as usize, |n| n.prev = pmem as u32);
        }
    }

    /// Cut the block at `mem` after `size` payload bytes, linking a new free
    /// block behind it. Returns the offset of the new block.
    fn split(&mut self, mem: usize, size: usize) -> usize {
        let ptr2 = mem + SIZEOF_ITEM + size;
        let next = self.read(mem).next;
        self.write(
            ptr2,
            Item {
                pool: pool_word(false),
                next,
                prev: mem as u32,
            },
        );
        self.update(mem, |m| m.next = ptr2 as u32);
        if next as usize != self.heap_end() {
            self.update(next as usize, |n| n.prev = ptr2 as u32);
        }
        ptr2
    }

    /// Move `lfree` up past used blocks.
    fn advance_lfree(&mut self) {
        let heap_end = self.heap_end();
        while self.lfree != heap_end && self.is_used(self.lfree) {
            self.lfree = self.read(self.lfree).next as usize;
        }
        debug_assert!(self.lfree == heap_end || !self.is_used(self.lfree));
    }

    // -----------------------------------------------------------------------
    // Public API
    // -----------------------------------------------------------------------

    /// Allocate `size` bytes, first fit from the lowest free block.
    ///
    /// Returns `None` for `size == 0` or when no free block is large enough.
    pub fn alloc(&mut self, size: usize) -> Option<NonNull<u8>> {
        if size == 0 {
            return None;
        }
        // Checked before rounding: `align_up` wraps near `usize::MAX`.
        if size > self.mem_size_aligned {
            log::debug!("no memory");
            return None;
        }
        let size = align_up(size, ALIGN_SIZE).max(MIN_SIZE_ALIGNED);
        if size > self.mem_size_aligned {
            log::debug!("no memory");
            return None;
        }

        let mut ptr = self.lfree;
        while ptr <= self.mem_size_aligned - size {
            let mem = self.read(ptr);
            let avail = mem.next as usize - (ptr + SIZEOF_ITEM);
            if !self.is_used(ptr) && avail >= size {
                if avail >= size + SIZEOF_ITEM + MIN_SIZE_ALIGNED {
                    self.split(ptr, size);
                    self.used += size + SIZEOF_ITEM;
                } else {
                    // Remainder too small to be a block: hand out the whole
                    // block.
                    self.used += mem.next as usize - ptr;
                }
                self.bump_max();
                self.update(ptr, |m| m.pool = pool_word(true));
                if ptr == self.lfree {
                    self.advance_lfree();
                }
                let rmem = self.payload(ptr);
                log::trace!(
                    "allocate memory at {:#x}, size: {}",
                    rmem.as_ptr() as usize,
                    self.read(ptr).next as usize - ptr
                );
                return Some(rmem);
            }
            ptr = mem.next as usize;
        }
        None
    }

    /// Release a block returned by [`alloc`](Self::alloc) or
    /// [`realloc`](Self::realloc).
    ///
    /// Panics on a pointer that is unaligned, outside the pool, or not in use.
    pub fn free(&mut self, rmem: NonNull<u8>) {
        let mem = self.block_of(rmem);
        assert!(self.is_used(mem), "double free at {:#x}", rmem.as_ptr() as usize);

        let size = self.read(mem).next as usize - mem;
        log::trace!("release memory {:#x}, size: {}", rmem.as_ptr() as usize, size);
        self.update(mem, |m| m.pool = pool_word(false));
        if mem < self.lfree {
            self.lfree = mem;
        }
        self.used -= size;
        self.plug_holes(mem);
    }

    /// Resize a block.
    ///
    /// - `realloc(None, n)` is `alloc(n)`.
    /// - `realloc(p, 0)` frees `p` and returns `None`.
    /// - Shrinking stays in place; a large enough remainder becomes a free
    ///   block and is coalesced at once.
    /// - Growing extends in place when the next block is free and large
    ///   enough, otherwise the data moves to a fresh block and the old one
    ///   is freed. On failure the old block is left untouched.
    pub fn realloc(&mut self, rmem: Option<NonNull<u8>>, newsize: usize) -> Option<NonNull<u8>> {
        if newsize > self.mem_size_aligned {
            log::debug!("realloc: out of memory");
            return None;
        }
        let newsize = align_up(newsize, ALIGN_SIZE);
        if newsize > self.mem_size_aligned {
            log::debug!("realloc: out of memory");
            return None;
        }
        if newsize == 0 {
            if let Some(p) = rmem {
                self.free(p);
            }
            return None;
        }
        let rmem = match rmem {
            None => return self.alloc(newsize),
            Some(p) => p,
        };

        let mem = self.block_of(rmem);
        assert!(self.is_used(mem), "realloc of a free block");
        let size = self.read(mem).next as usize - mem - SIZEOF_ITEM;
        if size == newsize {
            return Some(rmem);
        }

        if newsize < size {
            if newsize + SIZEOF_ITEM + MIN_SIZE_ALIGNED <= size {
                self.used -= size - newsize;
                let ptr2 = self.split(mem, newsize);
                if ptr2 < self.lfree {
                    self.lfree = ptr2;
                }
                self.plug_holes(ptr2);
            }
            return Some(rmem);
        }

        if self.grow_in_place(mem, size, newsize) {
            return Some(rmem);
        }

        let nmem = self.alloc(newsize)?;
        // SAFETY: both blocks are live, distinct, and at least `size` bytes.
        unsafe {
            core::ptr::copy_nonoverlapping(rmem.as_ptr(), nmem.as_ptr(), size.min(newsize));
        }
        self.free(rmem);
        Some(nmem)
    }

    fn grow_in_place(&mut self, mem: usize, size: usize, newsize: usize) -> bool {
        let heap_end = self.heap_end();
        let nmem = self.read(mem).next as usize;
        if nmem == heap_end || self.is_used(nmem) {
            return false;
        }
        let nnext = self.read(nmem).next as usize;
        let avail = nnext - mem - SIZEOF_ITEM;
        if avail < newsize {
            return false;
        }

        // Swallow the free successor, then give back what is not needed.
        self.update(nmem, |n| n.pool = 0);
        self.update(mem, |m| m.next = nnext as u32);
        if nnext != heap_end {
            self.update(nnext, |n| n.prev = mem as u32);
        }
        if avail >= newsize + SIZEOF_ITEM + MIN_SIZE_ALIGNED {
            let ptr2 = self.split(mem, newsize);
            self.used += newsize - size;
            if self.lfree == nmem {
                self.lfree = ptr2;
            }
        } else {
            self.used += avail - size;
            if self.lfree == nmem {
                self.lfree = nnext;
                self.advance_lfree();
            }
        }
        self.bump_max();
        true
    }

    /// Payload capacity of a live block (at least the requested size).
    pub fn block_size(&self, rmem: NonNull<u8>) -> usize {
        let mem = self.block_of(rmem);
        self.read(mem).next as usize - mem - SIZEOF_ITEM
    }

    /// True when `rmem` points into this pool's arena.
    pub fn contains(&self, rmem: NonNull<u8>) -> bool {
        let addr = rmem.as_ptr() as usize;
        let base = self.heap_ptr.as_ptr() as usize;
        addr >= base && addr < base + self.heap_end()
    }

    pub fn info(&self) -> MemInfo {
        MemInfo {
            total: self.mem_size_aligned,
            used: self.used,
            max_used: self.max,
        }
    }
}
