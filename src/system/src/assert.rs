//! Framework assertion protocol: report, stack-trace, debug-break.
//!
//! [lantern_assert] is live only under `debug_assertions`; release builds
//! compile it down to nothing.

use crate::logger::{self, Level};
use crate::trace::{self, TraceFrame};

const FENCE: &str = "========================================";

/// Reports a failed assertion and terminates. The report format is
/// `file(line) : { expression="..." } message`, followed by up to
/// [trace::ASSERT_FRAME_CAP] stack frames between fence lines.
#[doc(hidden)]
pub fn assert_failed(expression: &str, message: &str, file: &str, line: u32) -> ! {
	logger::format(
		Level::Assert,
		format_args!("{file}({line}) : {{ expression=\"{expression}\" }} {message}"),
	);

	let mut frames = vec![TraceFrame::default(); trace::ASSERT_FRAME_CAP];
	let captured = trace::capture_frames(&mut frames);

	if captured > 0 {
		logger::message(Level::Assert, FENCE);
		for frame in &frames[..captured] {
			frame.log(Level::Assert);
		}
		logger::message(Level::Assert, FENCE);
	}

	debug_break()
}

fn debug_break() -> ! {
	std::process::abort()
}

#[macro_export]
macro_rules! lantern_assert {
	($cond:expr) => {
		$crate::lantern_assert!($cond, "")
	};
	($cond:expr, $($message:tt)*) => {
		if cfg!(debug_assertions) && !$cond {
			$crate::assert::assert_failed(
				stringify!($cond),
				&format!($($message)*),
				file!(),
				line!(),
			);
		}
	};
}
