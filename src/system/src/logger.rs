//! Severity levels and the glue onto the host's log sink.
//!
//! The numeric level values are stable and shared with the C ABI; the sink
//! itself is whatever the host installed behind the [log] facade.

use std::fmt;

// === Level === //

#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[repr(i32)]
pub enum Level {
	Verbose = 0,
	Debug = 1,
	Info = 2,
	Warning = 3,
	Error = 4,
	Assert = 5,
}

impl Level {
	pub const COUNT: usize = 6;

	pub fn from_raw(raw: i32) -> Option<Self> {
		Some(match raw {
			0 => Self::Verbose,
			1 => Self::Debug,
			2 => Self::Info,
			3 => Self::Warning,
			4 => Self::Error,
			5 => Self::Assert,
			_ => return None,
		})
	}

	pub fn raw(self) -> i32 {
		self as i32
	}

	pub fn name(self) -> &'static str {
		match self {
			Self::Verbose => "Verbose",
			Self::Debug => "Debug",
			Self::Info => "Info",
			Self::Warning => "Warning",
			Self::Error => "Error",
			Self::Assert => "Assert",
		}
	}

	fn as_log_level(self) -> log::Level {
		match self {
			Self::Verbose => log::Level::Trace,
			Self::Debug => log::Level::Debug,
			Self::Info => log::Level::Info,
			Self::Warning => log::Level::Warn,
			Self::Error | Self::Assert => log::Level::Error,
		}
	}
}

impl fmt::Display for Level {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.name())
	}
}

// === Sink === //

/// Forwards a `[level] message` composite line to the host sink. An empty
/// message is a no-op.
pub fn message(level: Level, text: &str) {
	if text.is_empty() {
		return;
	}

	log::log!(
		target: "lantern",
		level.as_log_level(),
		"[{}] {}",
		level.name(),
		text
	);
}

pub fn format(level: Level, args: fmt::Arguments<'_>) {
	message(level, &args.to_string());
}

// === Tests === //
