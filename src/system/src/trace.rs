//! Stack-trace provider: cheap call-site hashes for the allocation ledger
//! and fully symbolized frames for the assert path.

use std::hash::Hasher;

use rustc_hash::FxHasher;

use crate::logger::{self, Level};

/// Frames captured on a failed assertion.
pub const ASSERT_FRAME_CAP: usize = 62;

/// Warms the symbol cache so the first assert does not pay for loading the
/// debug tables. Must run before the first tracked allocation.
pub fn init() {
	let mut scratch = [TraceFrame::default()];
	capture_frames(&mut scratch);
}

pub fn shutdown() {}

/// Hashes the return-address chain of the caller. Stable across identical
/// call sites within one process run; not cryptographic.
pub fn capture_hash() -> u64 {
	let mut hasher = FxHasher::default();

	backtrace::trace(|frame| {
		hasher.write_usize(frame.ip() as usize);
		true
	});

	hasher.finish()
}

// === TraceFrame === //

#[derive(Debug, Clone, Default)]
pub struct TraceFrame {
	pub function: String,
	pub file: String,
	pub line: u32,
	pub address: usize,
}

impl TraceFrame {
	pub fn log(&self, level: Level) {
		logger::format(
			level,
			format_args!(
				"{}({}) : {} [0x{:016X}]",
				self.file, self.line, self.function, self.address
			),
		);
	}
}

/// Fills `buffer` with symbolized frames for the current call stack, starting
/// at the caller, and returns how many were written.
pub fn capture_frames(buffer: &mut [TraceFrame]) -> usize {
	let mut count = 0;

	backtrace::trace(|frame| {
		if count >= buffer.len() {
			return false;
		}

		let mut out = TraceFrame {
			address: frame.ip() as usize,
			..TraceFrame::default()
		};

		backtrace::resolve_frame(frame, |symbol| {
			if let Some(name) = symbol.name() {
				out.function = name.to_string();
			}
			if let Some(file) = symbol.filename() {
				out.file = file.display().to_string();
			}
			if let Some(line) = symbol.lineno() {
				out.line = line;
			}
		});

		buffer[count] = out;
		count += 1;
		true
	});

	count
}

// === Tests === //
