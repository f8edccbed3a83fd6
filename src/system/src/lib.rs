//! Runtime core of the lantern application framework: area-partitioned
//! tracked memory, a reentrancy-safe signal/slot multicaster, and the
//! type-erased event plumbing shared by every other crate.

use std::sync::Once;

pub mod assert;
pub mod event;
pub mod logger;
pub mod mem;
pub mod signal;
pub mod trace;


pub mod prelude {
	pub use crate::{
		event::{EventQueue, EventValue, TypeFingerprint},
		lantern_assert,
		logger::{self, Level},
		mem::{AreaBox, AreaVec, MemoryArea, MemoryManager},
		signal::{Connection, ScopedConnection, Signal},
	};
}

/// Brings the process-wide services up in dependency order: the stack-trace
/// engine must be warm before the first tracked allocation captures a hash.
pub fn initialize() -> Result<(), mem::MemoryError> {
	trace::init();
	mem::MemoryManager::initialize()
}

pub fn initialize_with(config: mem::MemoryConfig) -> Result<(), mem::MemoryError> {
	trace::init();
	mem::MemoryManager::initialize_with(config)
}

pub fn terminate() {
	mem::MemoryManager::terminate();
	trace::shutdown();
}

/// One-shot variant of [initialize] for hosts that cannot sequence their own
/// startup (FFI entry points, tests). Later calls are no-ops.
pub fn ensure_initialized() {
	static ONCE: Once = Once::new();
	ONCE.call_once(|| {
		let _ = initialize();
	});
}
