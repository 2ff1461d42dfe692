// SPDX-License-Identifier: GPL-2.0

//! Allocator-internal tracing.
//!
//! `original_source/kma_rm.c` and `original_source/kma_bud.c` both guard
//! their diagnostic `printf` calls behind a `DEBUG` compile-time flag. This
//! module is the Rust-ification of that: a single pluggable sink, compiled
//! out entirely unless the `trace` feature is enabled, so a release build
//! of this crate carries none of the formatting machinery.

/// A trace sink. Receives one pre-formatted line per event; has no opinion
/// on where the line goes (a `no_std` caller might wire it to a UART, a
/// `std` caller to `eprintln!`).
pub type Sink = fn(core::fmt::Arguments);

static SINK: crate::sync::Spinlock<Option<Sink>> = crate::sync::Spinlock::new(None);

/// Install a trace sink. Replaces any previously installed sink.
pub fn set_sink(sink: Sink) {
	*SINK.lock() = Some(sink);
}

/// Remove the installed sink, silencing tracing again.
pub fn clear_sink() {
	*SINK.lock() = None;
}

#[doc(hidden)]
pub fn dispatch(args: core::fmt::Arguments) {
	if let Some(sink) = *SINK.lock() {
		sink(args);
	}
}

/// Emit one trace line if the `trace` feature is enabled and a sink is
/// installed; a no-op statement otherwise.
#[macro_export]
macro_rules! trace {
	($($arg:tt)*) => {
		#[cfg(feature = "trace")]
		$crate::logging::dispatch(format_args!($($arg)*));
	};
}
