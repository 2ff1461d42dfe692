// SPDX-License-Identifier: GPL-2.0

//! Optional single-instance convenience layer.
//!
//! `original_source/kma_rm.c` and `original_source/kma_bud.c` are both
//! written against one implicit, lazily initialized, process-wide
//! `static kma_page_t *entry`, reached through a bare `kma_malloc`/
//! `kma_free` pair. Spec §9 calls this out as a design choice to preserve
//! at the convenience seam ("encapsulate behind an allocator object;
//! single-instance usage is a convention at the top-level API, not an
//! invariant of the core") rather than bake into the policy types
//! themselves — [`rm::RmAllocator`](crate::rm::RmAllocator) and
//! [`bud::BudAllocator`](crate::bud::BudAllocator) stay plain, unlocked,
//! single-threaded objects.
//!
//! [`GlobalAllocator`] is that seam: a lazily constructed, mutex-guarded
//! singleton over any [`Allocator`], built from the same
//! [`sync`](crate::sync) primitives the teacher reaches for in its own
//! slab allocator (a `static SLAB_ALLOCATOR: Spinlock<...>`), widened to
//! `spin::Once` since constructing a concrete [`Allocator`] generally needs
//! a runtime-supplied page provider and so cannot be a `const fn`.

use core::ptr::NonNull;

use crate::sync::{Mutex, Once};
use crate::Allocator;

/// A lazily initialized, mutex-guarded [`Allocator`] singleton.
///
/// Declare one as a `static`, e.g.:
///
/// ```ignore
/// static KMA: GlobalAllocator<RmAllocator<HeapPageProvider<8192>>> =
///     GlobalAllocator::uninit();
///
/// fn kma_malloc(size: usize) -> Option<NonNull<u8>> {
///     KMA.allocate(size, || RmAllocator::new(HeapPageProvider::new()))
/// }
/// ```
///
/// The closure passed to [`GlobalAllocator::allocate`] runs at most once,
/// the first time any call site reaches this instance; subsequent calls
/// (from this or any other call site) reuse the already-constructed
/// allocator. This only makes first-touch initialization safe to invoke
/// from more than one place — it does not make concurrent `allocate`/`free`
/// calls against the same instance safe in any sense beyond "will not data
/// race", since the core policy objects have no concept of an in-progress
/// operation being interrupted by another.
pub struct GlobalAllocator<A> {
	cell: Once<Mutex<A>>,
}

impl<A> GlobalAllocator<A> {
	/// Construct an instance with nothing initialized yet. Must be a
	/// `const fn` so this can be used as a `static` initializer, the same
	/// way the teacher's `static SLAB_ALLOCATOR` is.
	pub const fn uninit() -> Self {
		Self { cell: Once::new() }
	}

	/// True once some call has triggered construction of the underlying
	/// allocator.
	pub fn is_initialized(&self) -> bool {
		self.cell.get().is_some()
	}
}

impl<A: Allocator> GlobalAllocator<A> {
	/// Serve `size` bytes from the underlying allocator, constructing it
	/// via `init` first if this is the first call to reach this instance.
	pub fn allocate(&self, size: usize, init: impl FnOnce() -> A) -> Option<NonNull<u8>> {
		let inner = self.cell.call_once(|| Mutex::new(init()));
		inner.lock().allocate(size)
	}

	/// Return a block obtained from [`GlobalAllocator::allocate`] on this
	/// same instance.
	///
	/// A `free` reaching an instance that was never initialized (no prior
	/// `allocate` call ever succeeded against it) is a no-op rather than a
	/// panic, mirroring `free(NULL)`/`kfree(NULL)` conventions: there is
	/// nothing this pointer could validly reference.
	///
	/// # Safety
	/// Same contract as [`Allocator::free`]: `ptr` and `size` must match a
	/// prior successful `allocate` call on this instance exactly.
	pub unsafe fn free(&self, ptr: NonNull<u8>, size: usize) {
		if let Some(inner) = self.cell.get() {
			unsafe {
				inner.lock().free(ptr, size);
			}
		}
	}
}
