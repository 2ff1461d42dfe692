// SPDX-License-Identifier: GPL-2.0

//! Black-box scenario tests (spec §8): the concrete S1-S6 traces and the
//! four universal properties, run against both policies over the same
//! heap-backed page provider. Policy-specific properties (bitmap/buddy
//! consistency for BUD, list ordering/abutment for RM) live in each
//! policy's own `#[cfg(test)]` module instead, since they need to peek at
//! private list/bitmap state that only that module has access to.

use kma::bud::BudAllocator;
use kma::page::std_support::HeapPageProvider;
use kma::rm::RmAllocator;
use kma::Allocator;

const PAGESIZE: usize = 8192;

type Rm = RmAllocator<HeapPageProvider<PAGESIZE>>;
type Bud = BudAllocator<HeapPageProvider<PAGESIZE>>;

fn new_rm() -> Rm {
	RmAllocator::new(HeapPageProvider::new())
}

fn new_bud() -> Bud {
	BudAllocator::new(HeapPageProvider::new())
}

// ---- S1: RM small allocate/free round trip brings pages back to zero ----

#[test]
fn s1_rm_small_round_trip_reclaims_all_pages() {
	let mut a = new_rm();
	let p1 = a.allocate(100).unwrap();
	let p2 = a.allocate(200).unwrap();
	unsafe {
		a.free(p1, 100);
		a.free(p2, 200);
	}
	assert_eq!(a.pages_in_use(), 0);
	assert_eq!(a.provider().outstanding(), 0);
}

// ---- S2: RM split-and-merge reuses space freed by a middle allocation ----

#[test]
fn s2_rm_split_and_merge_reuses_freed_middle_block() {
	let mut a = new_rm();
	let pa = a.allocate(1000).unwrap();
	let pb = a.allocate(1000).unwrap();
	let pc = a.allocate(1000).unwrap();
	unsafe {
		a.free(pb, 1000);
	}
	let pd = a.allocate(900).unwrap();

	// `pd` must land in the gap `pb` vacated: between `pa` and `pc` in
	// address order, and on the same page as both (the scenario's
	// "within same page as a,c" requirement).
	let (pa_addr, pc_addr, pd_addr) = (pa.as_ptr() as usize, pc.as_ptr() as usize, pd.as_ptr() as usize);
	assert!(pa_addr < pd_addr && pd_addr < pc_addr);

	unsafe {
		a.free(pa, 1000);
		a.free(pc, 1000);
		a.free(pd, 900);
	}
	assert_eq!(a.pages_in_use(), 0);
}

// ---- S3: RM page growth keeps serving allocations from a fresh page ----

#[test]
fn s3_rm_grows_across_pages_and_fully_reclaims() {
	let mut a = new_rm();
	let cap = Rm::managed_capacity();
	// Enough 1000-byte blocks to force at least one page growth, well
	// inside the block budget of a single page.
	let per_page = cap / 1000;
	let mut blocks = Vec::new();
	for _ in 0..=per_page {
		blocks.push(a.allocate(1000).unwrap());
	}
	// One more, from what must now be the growth page.
	let extra = a.allocate(1000).unwrap();
	blocks.push(extra);
	assert!(a.pages_in_use() >= 3); // control + >= 2 data pages

	for p in blocks {
		unsafe {
			a.free(p, 1000);
		}
	}
	assert_eq!(a.pages_in_use(), 0);
	assert_eq!(a.provider().outstanding(), 0);
}

// ---- S4: BUD split cascade from a fresh page down to class 0 ----

#[test]
fn s4_bud_split_cascade_to_class_zero_and_back() {
	let mut a = new_bud();
	// Fresh allocator: the only free node is class 9. A 16-byte request
	// must cascade the split all the way down to class 0.
	let p = a.allocate(16).unwrap();
	unsafe {
		p.as_ptr().write_bytes(0x99, 16);
	}
	// Every intermediate class must now have at least one free node,
	// confirmed indirectly: allocating one block of each class size
	// below the top must succeed without growing a new page.
	for &sz in &[16usize, 32, 64, 128, 256, 512, 1024, 2048] {
		let q = a.allocate(sz).unwrap();
		unsafe {
			a.free(q, sz);
		}
	}
	assert_eq!(a.pages_in_use(), 1); // still just the first page

	unsafe {
		a.free(p, 16);
	}
	assert_eq!(a.pages_in_use(), 0); // fully merged back up, allocs == 0
}

// ---- S5: BUD buddy coalesce collapses a page back to nothing ----

#[test]
fn s5_bud_buddy_coalesce_tears_down_on_zero_outstanding() {
	let mut a = new_bud();
	let pa = a.allocate(64).unwrap();
	let pb = a.allocate(64).unwrap();
	let pc = a.allocate(64).unwrap();
	unsafe {
		a.free(pa, 64);
		a.free(pc, 64);
		a.free(pb, 64);
	}
	assert_eq!(a.pages_in_use(), 0);
	assert_eq!(a.provider().outstanding(), 0);
}

// ---- S6: oversize path is independent of in-page allocator state ----
//
// Only BUD grants an oversize fallback (spec §4.4, §7); RM rejects any
// request past its managed capacity outright (spec §4.3, §7) and must
// not be routed through the oversize path at all.

#[test]
fn s6_oversize_allocation_served_and_freed_independently() {
	let mut a = new_rm();
	assert!(a.allocate(Rm::managed_capacity() + 1).is_none());
	assert_eq!(a.pages_in_use(), 0);

	// Must exceed `managed_capacity()` (7876 for an 8192-byte page) but
	// still fit a whole page alongside its handle tag (<= 8192 - 8).
	let mut b = new_bud();
	let small = b.allocate(32).unwrap();
	let before = b.pages_in_use();
	let big = b.allocate(8100).unwrap();
	assert_eq!(b.pages_in_use(), before + 1);
	unsafe {
		big.as_ptr().write_bytes(0x66, 8100);
		b.free(big, 8100);
	}
	assert_eq!(b.pages_in_use(), before);
	unsafe {
		b.free(small, 32);
	}
	assert_eq!(b.pages_in_use(), 0);
}

// ---- Universal property 1: non-aliasing across live allocations ----

#[test]
fn non_aliasing_holds_across_many_live_allocations_both_policies() {
	fn ranges_disjoint(allocs: &[(*mut u8, usize)]) -> bool {
		for i in 0..allocs.len() {
			for j in i + 1..allocs.len() {
				let (pi, si) = allocs[i];
				let (pj, sj) = allocs[j];
				let (pi, pj) = (pi as usize, pj as usize);
				let overlap = pi < pj + sj && pj < pi + si;
				if overlap {
					return false;
				}
			}
		}
		true
	}

	let mut rm = new_rm();
	let sizes = [32usize, 64, 128, 17, 900, 3, 500];
	let mut live = Vec::new();
	for &s in &sizes {
		let p = rm.allocate(s).unwrap();
		live.push((p.as_ptr(), s));
	}
	assert!(ranges_disjoint(&live));
	for (p, s) in live {
		unsafe {
			rm.free(std::ptr::NonNull::new(p).unwrap(), s);
		}
	}

	let mut bud = new_bud();
	let mut live = Vec::new();
	for &s in &sizes {
		let p = bud.allocate(s).unwrap();
		live.push((p.as_ptr(), s));
	}
	assert!(ranges_disjoint(&live));
	for (p, s) in live {
		unsafe {
			bud.free(std::ptr::NonNull::new(p).unwrap(), s);
		}
	}
}

// ---- Universal property 2: full free-everything resets observable state ----

#[test]
fn round_trip_reset_allows_reuse_both_policies() {
	let mut rm = new_rm();
	let p = rm.allocate(500).unwrap();
	unsafe {
		rm.free(p, 500);
	}
	// State after full free must behave as if fresh: a subsequent
	// allocation of any valid size succeeds.
	let q = rm.allocate(500).unwrap();
	unsafe {
		rm.free(q, 500);
	}
	assert_eq!(rm.pages_in_use(), 0);

	let mut bud = new_bud();
	let p = bud.allocate(500).unwrap();
	unsafe {
		bud.free(p, 500);
	}
	let q = bud.allocate(500).unwrap();
	unsafe {
		bud.free(q, 500);
	}
	assert_eq!(bud.pages_in_use(), 0);
}

// ---- Universal property 3: page reclamation floor ----

#[test]
fn page_reclamation_floor_both_policies() {
	let mut rm = new_rm();
	let blocks: Vec<_> = (0..10).map(|_| rm.allocate(600).unwrap()).collect();
	assert!(rm.pages_in_use() > 0);
	for p in blocks {
		unsafe {
			rm.free(p, 600);
		}
	}
	assert_eq!(rm.pages_in_use(), 0);
	assert_eq!(rm.provider().outstanding(), 0);

	let mut bud = new_bud();
	let blocks: Vec<_> = (0..10).map(|_| bud.allocate(600).unwrap()).collect();
	assert!(bud.pages_in_use() > 0);
	for p in blocks {
		unsafe {
			bud.free(p, 600);
		}
	}
	assert_eq!(bud.pages_in_use(), 0);
	assert_eq!(bud.provider().outstanding(), 0);
}

// ---- Universal property 4: oversize path does not perturb in-page state ----

#[test]
fn oversize_correctness_leaves_in_page_state_untouched() {
	let mut bud = new_bud();
	let resident = bud.allocate(40).unwrap();
	// Must exceed `managed_capacity()` (7876 for an 8192-byte page) but
	// still fit a whole page alongside its handle tag (<= 8192 - 8).
	let oversize = bud.allocate(8100).unwrap();
	unsafe {
		oversize.as_ptr().write_bytes(0xaa, 8100);
		bud.free(oversize, 8100);
	}
	// The small, still-outstanding allocation must be untouched and must
	// still free cleanly through the ordinary in-page path.
	unsafe {
		resident.as_ptr().write_bytes(0x12, 40);
		assert_eq!(*resident.as_ptr(), 0x12);
		bud.free(resident, 40);
	}
	assert_eq!(bud.pages_in_use(), 0);
}
