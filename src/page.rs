// SPDX-License-Identifier: GPL-2.0

//! The page provider interface (spec §4.1) and a host-backed implementation
//! for tests.
//!
//! Neither allocator policy ever allocates raw memory itself — every byte
//! they hand out or reclaim came from a `PageProvider`, which is the only
//! part of this crate that is allowed to know how pages are actually
//! backed (a real physical frame allocator, a `mmap` region, a bump arena
//! on the host during tests, ...).

use crate::types::{Addr, Page, PageHandle};

/// Supplies fixed-size, aligned pages on demand.
///
/// `PAGESIZE` is an associated constant rather than a runtime value: both
/// policies size their control structures against it at the type level, and
/// a provider that claimed a different page size at runtime than the one
/// it was compiled against would be a programming error, not a recoverable
/// one.
pub trait PageProvider {
	/// Size of every page this provider hands out. Must be a power of two
	/// and large enough to hold each policy's control structures (the
	/// policy modules assert this at `allocate` time).
	const PAGESIZE: usize;

	/// Obtain one fresh page. Returns `None` if the provider is
	/// exhausted.
	fn page_alloc(&mut self) -> Option<Page>;

	/// Return a page obtained from this provider. The caller must not
	/// reference `page.base` again afterward; the provider is free to
	/// reuse or unmap the memory immediately.
	fn page_free(&mut self, page: Page);

	/// The base of the `PAGESIZE`-aligned page containing `addr`.
	fn base_addr(addr: Addr) -> Addr {
		addr.base_addr(Self::PAGESIZE)
	}
}

/// Host-backed [`PageProvider`] used by the test suite and available to any
/// `std` embedding that just wants pages from the system allocator.
///
/// Tracks the number of pages currently on loan so that tests can assert
/// the "page reclamation floor" property (spec §8, property 3) without
/// instrumenting the allocator itself.
#[cfg(feature = "std")]
pub mod std_support {
	use super::*;
	use std::alloc::{alloc, dealloc, Layout};

	pub struct HeapPageProvider<const PAGESIZE: usize> {
		outstanding: usize,
		next_handle: u64,
	}

	impl<const PAGESIZE: usize> HeapPageProvider<PAGESIZE> {
		/// Construct a provider, rejecting a `PAGESIZE` this type cannot
		/// actually serve: `base_addr`'s masking trick (spec §4.1) requires
		/// a power of two, and every policy needs room for at least its
		/// control structures.
		pub fn try_new() -> crate::error::Result<Self> {
			static_assertions::const_assert!(PAGESIZE >= 64);
			if !PAGESIZE.is_power_of_two() {
				return Err(crate::error::Error::InvalidArgument);
			}
			Ok(Self {
				outstanding: 0,
				next_handle: 1,
			})
		}

		pub fn new() -> Self {
			Self::try_new().expect("PAGESIZE must be a power of two")
		}

		/// Number of pages currently on loan from this provider. Drives
		/// the page-reclamation-floor property: a fully-freed allocator
		/// must bring this back to zero.
		pub fn outstanding(&self) -> usize {
			self.outstanding
		}

		fn layout() -> Layout {
			Layout::from_size_align(PAGESIZE, PAGESIZE).expect("PAGESIZE must be a valid alignment")
		}
	}

	impl<const PAGESIZE: usize> Default for HeapPageProvider<PAGESIZE> {
		fn default() -> Self {
			Self::new()
		}
	}

	impl<const PAGESIZE: usize> PageProvider for HeapPageProvider<PAGESIZE> {
		const PAGESIZE: usize = PAGESIZE;

		fn page_alloc(&mut self) -> Option<Page> {
			let ptr = unsafe { alloc(Self::layout()) };
			if ptr.is_null() {
				return None;
			}
			let handle = PageHandle(self.next_handle);
			self.next_handle += 1;
			self.outstanding += 1;
			Some(Page {
				handle,
				base: Addr::new(ptr as usize),
			})
		}

		fn page_free(&mut self, page: Page) {
			unsafe {
				dealloc(page.base.as_mut_ptr::<u8>(), Self::layout());
			}
			self.outstanding -= 1;
		}
	}

	impl<const PAGESIZE: usize> Drop for HeapPageProvider<PAGESIZE> {
		fn drop(&mut self) {
			debug_assert_eq!(
				self.outstanding, 0,
				"HeapPageProvider dropped with {} page(s) still on loan",
				self.outstanding
			);
		}
	}
}
