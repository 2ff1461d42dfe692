// SPDX-License-Identifier: GPL-2.0

//! The oversize fast path shared by both policies (spec §4.2): requests too
//! large for a policy's in-page free structures are served by dedicating
//! one whole page to them, with the owning page's handle stashed at the
//! very start of the page so `free` can hand the page straight back.

use core::mem::size_of;
use core::ptr::NonNull;

use crate::page::PageProvider;
use crate::types::{Addr, Page, PageHandle};

/// Bytes of a page an oversize allocation sacrifices to the handle tag.
pub const HANDLE_BYTES: usize = size_of::<PageHandle>();

/// Serve `size` bytes from a dedicated page.
///
/// Returns `None` if the provider is exhausted, or if `size` plus the
/// handle tag does not even fit in one page (the page obtained is
/// released before returning in that case, per spec §7's exhaustion
/// handling).
pub fn allocate<P: PageProvider>(provider: &mut P, size: usize) -> Option<NonNull<u8>> {
	let page = provider.page_alloc()?;

	let fits = size.checked_add(HANDLE_BYTES).map_or(false, |n| n <= P::PAGESIZE);
	if !fits {
		provider.page_free(page);
		return None;
	}

	unsafe {
		page.base.as_mut_ptr::<PageHandle>().write(page.handle);
	}
	crate::trace!("oversize: allocated {} bytes at page {}", size, page.base);

	let user = page.base + HANDLE_BYTES;
	Some(unsafe { NonNull::new_unchecked(user.as_mut_ptr::<u8>()) })
}

/// Return a block obtained through [`allocate`].
///
/// # Safety
/// `ptr` must be exactly the pointer a prior `allocate` call on this
/// provider returned, and must not have been freed already.
pub unsafe fn free<P: PageProvider>(provider: &mut P, ptr: NonNull<u8>) {
	let user = Addr::new(ptr.as_ptr() as usize);
	let base = user - HANDLE_BYTES;
	let handle = unsafe { *base.as_ptr::<PageHandle>() };
	crate::trace!("oversize: freeing page {}", base);
	provider.page_free(Page { handle, base });
}
