// SPDX-License-Identifier: GPL-2.0

//! Error handling types and utilities

use core::fmt;

/// Allocator error type.
///
/// The hot-path operations (`Allocator::allocate`, `Allocator::free`) never
/// use this type directly — `allocate` reports failure by returning `None`
/// and `free` has no return channel at all, per the external contract. This
/// enum is for the construction-time surface: setting up a `PageProvider`
/// and wiring it to a policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
	/// The page provider could not satisfy a `page_alloc` request.
	OutOfMemory,
	/// A size or alignment argument violated a precondition.
	InvalidArgument,
	/// The allocator was used before it lazily initialized itself.
	NotInitialized,
	/// Corruption was observed in an allocator-owned structure (a bitmap
	/// bit disagreeing with the free list, an address outside any known
	/// page, ...). Fatal; the allocator does not attempt to recover.
	Corruption,
}

impl Error {
	/// Convert error to an errno-style value, for code that bridges this
	/// crate to a C-ABI `kma_malloc`/`kma_free` surface.
	pub fn to_errno(self) -> i32 {
		match self {
			Error::OutOfMemory => -12,     // ENOMEM
			Error::InvalidArgument => -22, // EINVAL
			Error::NotInitialized => -6,   // ENXIO
			Error::Corruption => -74,      // EBADMSG
		}
	}
}

impl fmt::Display for Error {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Error::OutOfMemory => write!(f, "page provider exhausted"),
			Error::InvalidArgument => write!(f, "invalid argument"),
			Error::NotInitialized => write!(f, "allocator not initialized"),
			Error::Corruption => write!(f, "allocator state corrupted"),
		}
	}
}

/// Allocator result type.
pub type Result<T> = core::result::Result<T, Error>;
