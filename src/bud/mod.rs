// SPDX-License-Identifier: GPL-2.0

//! Buddy allocator: ten segregated size-class free lists per page, backed
//! by a per-page bitmap that records which 16-byte units are live, with
//! coalescing driven by buddy-address arithmetic rather than list search.

mod bitmap;

use core::mem::size_of;
use core::ptr::NonNull;

use crate::oversize;
use crate::page::PageProvider;
use crate::trace;
use crate::types::{Addr, Page, PageHandle};
use crate::Allocator;

const NUM_CLASSES: usize = 10;
const SIZE_TAG_BYTES: usize = size_of::<u32>();
const HANDLE_BYTES: usize = size_of::<PageHandle>();

/// Per-page bookkeeping, living at the base of every page this allocator
/// owns. `next` chains pages together off `first_page` purely so teardown
/// can enumerate every page this allocator has ever claimed; address-to-page
/// resolution during normal operation goes through `P::base_addr` instead.
#[repr(C)]
struct PageHeader {
	owner: PageHandle,
	next: usize,
	bitmap: [u8; bitmap::BYTES],
}

/// Lives immediately after the [`PageHeader`] of the first page only: the
/// free-list heads and the class-size table, both shared across every page
/// this allocator manages.
#[repr(C)]
struct FreeIndex {
	allocs: i64,
	class_size: [usize; NUM_CLASSES],
	head: [usize; NUM_CLASSES],
}

const HEADER_BYTES: usize = size_of::<PageHeader>();
const FREE_INDEX_BYTES: usize = size_of::<FreeIndex>();

/// Every page reserves this much of its front for bookkeeping, whether or
/// not it is the first page. The first page actually uses it for the
/// `FreeIndex`; later pages just forgo that much of their own capacity so
/// every page's class-9 block is the same size regardless of which page it
/// lives on — matching the historical allocator's own rationale for doing
/// the same ("max buffer size will be bufsizes[9] regardless").
const DATA_OFFSET: usize = HEADER_BYTES + FREE_INDEX_BYTES;

const BASE_CLASS_SIZES: [usize; NUM_CLASSES - 1] = [16, 32, 64, 128, 256, 512, 1024, 2048, 4096];

unsafe fn page_header_at(addr: Addr) -> *mut PageHeader {
	addr.as_mut_ptr::<PageHeader>()
}

unsafe fn free_index_at(first_page_base: Addr) -> *mut FreeIndex {
	(first_page_base + HEADER_BYTES).as_mut_ptr::<FreeIndex>()
}

unsafe fn get_next(addr: Addr) -> usize {
	*addr.as_ptr::<usize>()
}

unsafe fn set_next(addr: Addr, next: usize) {
	*addr.as_mut_ptr::<usize>() = next;
}

unsafe fn get_size_tag(addr: Addr) -> u32 {
	*addr.as_ptr::<u32>()
}

unsafe fn set_size_tag(addr: Addr, size: u32) {
	*addr.as_mut_ptr::<u32>() = size;
}

/// A buddy allocator over page provider `P`.
pub struct BudAllocator<P: PageProvider> {
	provider: P,
	first_page: Option<Page>,
	pages: usize,
}

impl<P: PageProvider> BudAllocator<P> {
	/// Construct an allocator, rejecting a `P::PAGESIZE` too small to hold
	/// the first page's header, `FreeIndex`, and size tag.
	pub fn try_new(provider: P) -> crate::error::Result<Self> {
		if P::PAGESIZE <= DATA_OFFSET + SIZE_TAG_BYTES {
			return Err(crate::error::Error::InvalidArgument);
		}
		Ok(Self {
			provider,
			first_page: None,
			pages: 0,
		})
	}

	pub fn new(provider: P) -> Self {
		Self::try_new(provider).expect("PageProvider::PAGESIZE too small for the BUD control structures")
	}

	pub fn provider(&self) -> &P {
		&self.provider
	}

	pub fn provider_mut(&mut self) -> &mut P {
		&mut self.provider
	}

	/// Largest request servable from the segregated free lists, i.e. the
	/// top class's size minus the in-band size tag every managed block
	/// carries.
	pub const fn managed_capacity() -> usize {
		(P::PAGESIZE - DATA_OFFSET) - SIZE_TAG_BYTES
	}

	fn initialized(&self) -> bool {
		self.first_page.is_some()
	}

	fn free_index(&self) -> &FreeIndex {
		let base = self.first_page.expect("bud allocator not initialized").base;
		unsafe { &*free_index_at(base) }
	}

	fn free_index_mut(&mut self) -> &mut FreeIndex {
		let base = self.first_page.expect("bud allocator not initialized").base;
		unsafe { &mut *free_index_at(base) }
	}

	fn class_sizes(top: usize) -> [usize; NUM_CLASSES] {
		let mut sizes = [0usize; NUM_CLASSES];
		sizes[..NUM_CLASSES - 1].copy_from_slice(&BASE_CLASS_SIZES);
		sizes[NUM_CLASSES - 1] = top;
		sizes
	}

	fn class_for(&self, adjusted: usize) -> usize {
		let sizes = self.free_index().class_size;
		sizes
			.iter()
			.position(|&s| s >= adjusted)
			.unwrap_or(NUM_CLASSES - 1)
	}

	fn class_index_for_size(&self, size: usize) -> usize {
		self.free_index()
			.class_size
			.iter()
			.position(|&s| s == size)
			.expect("coalesce size must be a known class size")
	}

	fn format_page(&mut self, page: Page) {
		unsafe {
			let header = page_header_at(page.base);
			(*header).owner = page.handle;
			(*header).next = 0;
			(*header).bitmap = [0u8; bitmap::BYTES];
		}
	}

	/// Walk the page chain from `first_page` to its tail and append.
	fn append_page(&mut self, page_base: Addr) {
		let first = self.first_page.expect("bud allocator not initialized").base;
		let mut curr = first;
		loop {
			let next = unsafe { (*page_header_at(curr)).next };
			if next == 0 {
				unsafe {
					(*page_header_at(curr)).next = page_base.as_usize();
				}
				return;
			}
			curr = Addr::new(next);
		}
	}

	fn push_free(&mut self, addr: Addr, size: usize) {
		let class_idx = self.class_index_for_size(size);
		let old_head = self.free_index().head[class_idx];
		unsafe {
			set_next(addr, old_head);
		}
		self.free_index_mut().head[class_idx] = addr.as_usize();
	}

	fn pop_head(&mut self, class: usize) -> Addr {
		let head = self.free_index().head[class];
		debug_assert_ne!(head, 0, "popping from an empty class");
		let next = unsafe { get_next(Addr::new(head)) };
		self.free_index_mut().head[class] = next;
		Addr::new(head)
	}

	fn unlink_if_present(&mut self, class_idx: usize, target: Addr) -> bool {
		let mut prev: usize = 0;
		let mut curr = self.free_index().head[class_idx];

		while curr != 0 {
			if curr == target.as_usize() {
				let next = unsafe { get_next(Addr::new(curr)) };
				if prev == 0 {
					self.free_index_mut().head[class_idx] = next;
				} else {
					unsafe {
						set_next(Addr::new(prev), next);
					}
				}
				return true;
			}
			prev = curr;
			curr = unsafe { get_next(Addr::new(curr)) };
		}

		false
	}

	fn init(&mut self) -> Option<()> {
		let page = self.provider.page_alloc()?;
		self.format_page(page);
		self.first_page = Some(page);
		self.pages = 1;

		let top = P::PAGESIZE - DATA_OFFSET;
		{
			let fi = self.free_index_mut();
			fi.allocs = 0;
			fi.class_size = Self::class_sizes(top);
			fi.head = [0; NUM_CLASSES];
		}

		self.push_free(page.base + DATA_OFFSET, top);
		trace!("bud: initialized with first page {}", page.base);
		Some(())
	}

	fn grow(&mut self) -> Option<()> {
		let page = self.provider.page_alloc()?;
		self.format_page(page);
		self.append_page(page.base);
		self.pages += 1;

		let top = self.free_index().class_size[NUM_CLASSES - 1];
		self.push_free(page.base + DATA_OFFSET, top);
		trace!("bud: grew with page {}", page.base);
		Some(())
	}

	/// Guarantee `head[idx]` is non-empty by repeatedly splitting a larger
	/// class, cascading down one level per iteration. Returns `false` if no
	/// class at or above `idx` has anything to split.
	fn ensure_class_populated(&mut self, idx: usize) -> bool {
		let mut i = idx;
		while self.free_index().head[i] == 0 {
			i += 1;
			if i == NUM_CLASSES {
				return false;
			}
		}

		while i > idx {
			let popped = self.pop_head(i);
			let prev_head_below = self.free_index().head[i - 1];

			if i == NUM_CLASSES - 1 {
				// Class 9's size isn't 2x class 8's, so there is no real
				// buddy to carve out here: the whole block becomes a
				// single class-8 node, and whatever lies past
				// class_size[8] bytes of it is not reachable from any
				// free list again until this class-8 node itself gets
				// coalesced back into a fresh class-9 page.
				unsafe {
					set_next(popped, prev_head_below);
				}
				self.free_index_mut().head[i - 1] = popped.as_usize();
			} else {
				let half = self.free_index().class_size[i - 1];
				let buddy = popped + half;
				unsafe {
					set_next(buddy, prev_head_below);
					set_next(popped, buddy.as_usize());
				}
				self.free_index_mut().head[i - 1] = popped.as_usize();
			}

			i -= 1;
		}

		true
	}

	fn mark_allocated(&mut self, node: Addr, idx: usize) {
		let class_size = self.free_index().class_size[idx];
		unsafe {
			set_size_tag(node, class_size as u32);
		}
		let page_base = P::base_addr(node);
		let offset = (node - page_base) - DATA_OFFSET;
		unsafe {
			bitmap::mark(&mut (*page_header_at(page_base)).bitmap, offset, class_size, true);
		}
	}

	/// Tear down every page this allocator has ever claimed. Called once
	/// the outstanding allocation count drops to zero.
	fn teardown(&mut self) {
		let mut curr = self.first_page.take().map(|p| p.base);
		while let Some(addr) = curr {
			let header = unsafe { &*page_header_at(addr) };
			let next = if header.next == 0 { None } else { Some(Addr::new(header.next)) };
			let handle = header.owner;
			self.provider.page_free(Page { handle, base: addr });
			curr = next;
		}
		self.pages = 0;
		trace!("bud: torn down");
	}
}

impl<P: PageProvider> Allocator for BudAllocator<P> {
	fn allocate(&mut self, size: usize) -> Option<NonNull<u8>> {
		let fits_with_handle = size.checked_add(HANDLE_BYTES).map_or(false, |n| n <= P::PAGESIZE);
		if !fits_with_handle {
			return None;
		}
		if size > Self::managed_capacity() {
			return oversize::allocate(&mut self.provider, size);
		}

		if !self.initialized() {
			self.init()?;
		}

		let adjusted = size + SIZE_TAG_BYTES;
		let idx = self.class_for(adjusted);

		if !self.ensure_class_populated(idx) {
			self.grow()?;
			if !self.ensure_class_populated(idx) {
				return None;
			}
		}

		let node = self.pop_head(idx);
		self.mark_allocated(node, idx);
		self.free_index_mut().allocs += 1;

		let user = node + SIZE_TAG_BYTES;
		Some(unsafe { NonNull::new_unchecked(user.as_mut_ptr::<u8>()) })
	}

	unsafe fn free(&mut self, ptr: NonNull<u8>, size: usize) {
		let fits_with_handle = size.checked_add(HANDLE_BYTES).map_or(false, |n| n <= P::PAGESIZE);
		if !fits_with_handle {
			return;
		}
		if size > Self::managed_capacity() {
			unsafe {
				oversize::free(&mut self.provider, ptr);
			}
			return;
		}

		let block = Addr::new(ptr.as_ptr() as usize) - SIZE_TAG_BYTES;
		let tagged = unsafe { get_size_tag(block) } as usize;
		let page_base = P::base_addr(block);
		let data_start = page_base + DATA_OFFSET;

		unsafe {
			bitmap::mark(&mut (*page_header_at(page_base)).bitmap, block - data_start, tagged, false);
		}

		let top = self.free_index().class_size[NUM_CLASSES - 1];
		let mut addr = block;
		let mut s = tagged;

		while 2 * s <= top {
			let offset = addr - data_start;
			let buddy_offset = if (offset / s) % 2 == 0 { offset + s } else { offset - s };
			let buddy = data_start + buddy_offset;

			let buddy_live = unsafe { bitmap::any_set(&(*page_header_at(page_base)).bitmap, buddy_offset, s) };
			if buddy_live {
				break;
			}

			let class_idx = self.class_index_for_size(s);
			if !self.unlink_if_present(class_idx, buddy) {
				break;
			}

			addr = if buddy.as_usize() < addr.as_usize() { buddy } else { addr };
			s = if 2 * s == top { top } else { 2 * s };
		}

		self.push_free(addr, s);

		let fi = self.free_index_mut();
		fi.allocs -= 1;
		if fi.allocs <= 0 {
			self.teardown();
		}
	}

	fn pages_in_use(&self) -> usize {
		self.pages
	}
}
