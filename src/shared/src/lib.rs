//! Shared-library surface: the small C-style API re-exported for dynamic
//! loading. Nothing here panics across the boundary; malformed input is
//! silently dropped, matching the fail-soft policy of the runtime core.

use std::{
	ffi::CStr,
	os::raw::{c_char, c_int},
};

use lantern_system::{
	logger::{self, Level},
	mem::{AreaBox, MemoryArea, MemoryManager},
};

// === Level values (part of the ABI) === //

pub const LANTERN_LOG_VERBOSE: c_int = 0;
pub const LANTERN_LOG_DEBUG: c_int = 1;
pub const LANTERN_LOG_INFO: c_int = 2;
pub const LANTERN_LOG_WARNING: c_int = 3;
pub const LANTERN_LOG_ERROR: c_int = 4;
pub const LANTERN_LOG_ASSERT: c_int = 5;

// === Exports === //

struct Greeter;

impl Greeter {
	fn new() -> Self {
		logger::message(Level::Debug, "Hello!! lantern!!");
		Self
	}
}

impl Drop for Greeter {
	fn drop(&mut self) {
		logger::message(Level::Debug, "Good Bye!! lantern!!");
	}
}

/// Demonstration entry: allocates an application object through the tracked
/// allocator, audits for leaks with it live, frees it, and audits again.
#[no_mangle]
pub extern "C" fn lantern_hello() {
	lantern_system::ensure_initialized();

	let greeter = AreaBox::try_new_in(MemoryArea::Application, Greeter::new());
	MemoryManager::report_leaks(0, MemoryManager::bookmark());

	drop(greeter);
	MemoryManager::report_leaks(0, MemoryManager::bookmark());
}

/// Logs `message` at `level`. An empty message or an out-of-range level is a
/// no-op.
///
/// # Safety
///
/// `message` must be null or point at a nul-terminated string.
#[no_mangle]
pub unsafe extern "C" fn lantern_log_message(level: c_int, message: *const c_char) {
	if message.is_null() {
		return;
	}

	let Some(level) = Level::from_raw(level) else {
		return;
	};
	let Ok(message) = CStr::from_ptr(message).to_str() else {
		return;
	};

	logger::message(level, message);
}

/// The `printf`-shaped slot in the ABI. Formatting happens on the caller's
/// side; the format string arrives here as the finished message, and extra
/// arguments are ignored. An empty format is a no-op.
///
/// # Safety
///
/// `format` must be null or point at a nul-terminated string.
#[no_mangle]
pub unsafe extern "C" fn lantern_log_format(level: c_int, format: *const c_char) {
	lantern_log_message(level, format);
}

// === Tests === //
