// SPDX-License-Identifier: GPL-2.0

//! Resource-map allocator: a single address-ordered free list of
//! variable-sized runs, served first-fit, with neighbor coalescing and
//! whole-page reclamation.

use core::mem::size_of;
use core::ptr::NonNull;

use crate::page::PageProvider;
use crate::trace;
use crate::types::{Addr, Page, PageHandle};
use crate::Allocator;

/// Header prefixing every free run. `next` is the raw address of the next
/// run in address order, or `0` for the list end: a sentinel rather than
/// `Option<Addr>` keeps this a plain pair of machine words in memory, the
/// same layout as the original `{ int size; void *next; }`.
#[repr(C)]
struct RmHeader {
	size: usize,
	next: usize,
}

const HEADER_BYTES: usize = size_of::<RmHeader>();
const HANDLE_BYTES: usize = size_of::<PageHandle>();

unsafe fn header_at(addr: Addr) -> *mut RmHeader {
	addr.as_mut_ptr::<RmHeader>()
}

/// A resource-map allocator over page provider `P`.
///
/// Lazily acquires a private control page and one data page on the first
/// `allocate`, and tears itself back down to the pre-init state once the
/// free list empties out completely.
pub struct RmAllocator<P: PageProvider> {
	provider: P,
	control_page: Option<Page>,
	head: usize,
	pages: usize,
}

impl<P: PageProvider> RmAllocator<P> {
	/// Construct an allocator, rejecting a `P::PAGESIZE` too small to hold
	/// even one run's header plus the page back-pointer.
	pub fn try_new(provider: P) -> crate::error::Result<Self> {
		if P::PAGESIZE <= HEADER_BYTES + HANDLE_BYTES {
			return Err(crate::error::Error::InvalidArgument);
		}
		Ok(Self {
			provider,
			control_page: None,
			head: 0,
			pages: 0,
		})
	}

	pub fn new(provider: P) -> Self {
		Self::try_new(provider).expect("PageProvider::PAGESIZE too small for the RM control structures")
	}

	pub fn provider(&self) -> &P {
		&self.provider
	}

	pub fn provider_mut(&mut self) -> &mut P {
		&mut self.provider
	}

	/// Largest request servable from the in-page free-list path. RM grants
	/// no oversize fallback (spec §4.3, §7): a request above this bound
	/// fails outright, unlike BUD's dedicated oversize path.
	pub const fn managed_capacity() -> usize {
		P::PAGESIZE - HEADER_BYTES - HANDLE_BYTES
	}

	fn initialized(&self) -> bool {
		self.control_page.is_some()
	}

	fn init(&mut self) -> Option<()> {
		let control = self.provider.page_alloc()?;
		let data = match self.provider.page_alloc() {
			Some(p) => p,
			None => {
				self.provider.page_free(control);
				return None;
			}
		};
		self.control_page = Some(control);
		self.pages = 1;
		self.install_page(data);
		Some(())
	}

	/// Stamp a page's back-pointer and splice its whole capacity onto the
	/// tail of the free list as a single run.
	fn install_page(&mut self, page: Page) {
		unsafe {
			page.base.as_mut_ptr::<PageHandle>().write(page.handle);
		}
		let run = page.base + HANDLE_BYTES;
		unsafe {
			header_at(run).write(RmHeader {
				size: Self::managed_capacity(),
				next: 0,
			});
		}
		self.pages += 1;
		// Splice in address order, same as a freed run: both `coalesce` and
		// the list-ordering invariant depend on neighbors in the list being
		// neighbors in memory, and page addresses from the provider aren't
		// guaranteed to arrive in increasing order.
		self.insert_sorted(run);
		trace!("rm: installed page {} as run {}", page.base, run);
	}

	fn try_allocate(&mut self, size: usize) -> Option<NonNull<u8>> {
		let mut prev: usize = 0;
		let mut curr = self.head;

		while curr != 0 {
			let curr_addr = Addr::new(curr);
			// Safe: `curr` always points at a live header we installed or
			// relinked ourselves.
			let header = unsafe { &*header_at(curr_addr) };
			let run_size = header.size;
			let next = header.next;

			if run_size >= size + HEADER_BYTES {
				let user = curr_addr + HEADER_BYTES;
				let residual_size = run_size - size - HEADER_BYTES;
				if residual_size == 0 {
					self.relink(prev, curr, next);
				} else {
					let residual = user + size;
					unsafe {
						header_at(residual).write(RmHeader {
							size: residual_size,
							next,
						});
					}
					self.relink(prev, curr, residual.as_usize());
				}
				return Some(unsafe { NonNull::new_unchecked(user.as_mut_ptr::<u8>()) });
			}

			prev = curr;
			curr = next;
		}

		None
	}

	fn relink(&mut self, prev: usize, curr: usize, new_next: usize) {
		if prev == 0 {
			debug_assert_eq!(self.head, curr);
			self.head = new_next;
		} else {
			unsafe {
				(*header_at(Addr::new(prev))).next = new_next;
			}
		}
	}

	/// Insert a freed run into the list in address order. Unlike the
	/// historical same-page-only scan, this always finds a home for the
	/// run, whether or not any neighboring list node shares its page.
	fn insert_sorted(&mut self, freed: Addr) {
		let freed_raw = freed.as_usize();

		if self.head == 0 || freed_raw < self.head {
			unsafe {
				(*header_at(freed)).next = self.head;
			}
			self.head = freed_raw;
			return;
		}

		let mut curr = self.head;
		loop {
			let header = unsafe { &mut *header_at(Addr::new(curr)) };
			if header.next == 0 || freed_raw < header.next {
				unsafe {
					(*header_at(freed)).next = header.next;
				}
				header.next = freed_raw;
				return;
			}
			curr = header.next;
		}
	}

	/// Merge adjacent, same-page runs. Only advances past a run once it no
	/// longer abuts its successor, so a run that just absorbed its
	/// neighbor is rechecked against its new one.
	fn coalesce(&mut self) {
		let mut curr = self.head;

		while curr != 0 {
			let curr_addr = Addr::new(curr);
			let next = unsafe { (*header_at(curr_addr)).next };
			if next == 0 {
				break;
			}

			let next_addr = Addr::new(next);
			let same_page = P::base_addr(curr_addr) == P::base_addr(next_addr);
			let curr_size = unsafe { (*header_at(curr_addr)).size };
			let abuts = curr_addr + HEADER_BYTES + curr_size == next_addr;

			if same_page && abuts {
				let next_header = unsafe { *header_at(next_addr) };
				unsafe {
					let h = &mut *header_at(curr_addr);
					h.size += HEADER_BYTES + next_header.size;
					h.next = next_header.next;
				}
			} else {
				curr = next;
			}
		}
	}

	/// Release any run that now spans a whole page's managed capacity, and
	/// tear down the control page once nothing remains.
	fn reclaim(&mut self) {
		let mut prev: usize = 0;
		let mut curr = self.head;

		while curr != 0 {
			let curr_addr = Addr::new(curr);
			let header = unsafe { *header_at(curr_addr) };

			if header.size == Self::managed_capacity() {
				let page_base = curr_addr - HANDLE_BYTES;
				let handle = unsafe { *page_base.as_ptr::<PageHandle>() };
				self.relink(prev, curr, header.next);
				self.provider.page_free(Page { handle, base: page_base });
				self.pages -= 1;
				trace!("rm: reclaimed page {}", page_base);
				curr = header.next;
				continue;
			}

			prev = curr;
			curr = header.next;
		}

		if self.head == 0 {
			if let Some(control) = self.control_page.take() {
				self.provider.page_free(control);
				self.pages -= 1;
				trace!("rm: released control page {}", control.base);
			}
		}
	}
}

impl<P: PageProvider> Allocator for RmAllocator<P> {
	fn allocate(&mut self, size: usize) -> Option<NonNull<u8>> {
		// RM has no oversize fallback (spec §4.3): exceeding the managed
		// capacity is a flat rejection, not a route to a whole-page path.
		if size > Self::managed_capacity() {
			return None;
		}

		if !self.initialized() {
			self.init()?;
		}

		if let Some(ptr) = self.try_allocate(size) {
			return Some(ptr);
		}

		// First-fit scan exhausted the list; grow by one page. The fresh
		// page's run is exactly `managed_capacity()`, which is `>= size` by
		// the check above, so this retry cannot fail.
		let page = self.provider.page_alloc()?;
		self.install_page(page);
		self.try_allocate(size)
	}

	unsafe fn free(&mut self, ptr: NonNull<u8>, size: usize) {
		// Mirrors `allocate`: RM never served this size in the first place,
		// so there is nothing oversize to hand back here either.
		if size > Self::managed_capacity() {
			return;
		}

		let freed = Addr::new(ptr.as_ptr() as usize) - HEADER_BYTES;
		unsafe {
			header_at(freed).write(RmHeader { size, next: 0 });
		}

		self.insert_sorted(freed);
		self.coalesce();
		self.reclaim();
	}

	fn pages_in_use(&self) -> usize {
		self.pages
	}
}
