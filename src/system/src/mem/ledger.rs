//! Process-wide allocation routing and the live-allocation debug ledger.
//!
//! Every area shares one heap lock; the ledger has its own. The two are never
//! held at the same time, and neither is ever held across the log sink.

use std::{
	panic::Location,
	ptr::{self, NonNull},
	sync::atomic::{AtomicU64, Ordering::Relaxed},
	time::{SystemTime, UNIX_EPOCH},
};

use parking_lot::Mutex;
use thiserror::Error;

use crate::{
	logger::{self, Level},
	trace,
};

use super::area::{MemoryArea, MemorySpace};

// === Constants === //

pub const DEFAULT_ALIGNMENT: usize = 16;

/// Sentinel written immediately past every tracked payload.
pub const TRAP_MAGIC: u32 = 0x5EED_70AD;
pub const TRAP_SIZE: usize = std::mem::size_of::<u32>();

const FENCE_MAJOR: &str = "========================================";
const FENCE_MINOR: &str = "----------------------------------------";

// === Config === //

#[derive(Debug, Clone)]
pub struct MemoryConfig {
	/// Per-area arena capacities, indexed by [MemoryArea::index].
	pub area_capacities: [usize; MemoryArea::COUNT],
	/// Slots in the live-allocation table.
	pub ledger_capacity: usize,
}

impl Default for MemoryConfig {
	fn default() -> Self {
		const KB: usize = 1024;

		Self {
			area_capacities: [512, 512, KB, 10 * KB, 10 * KB],
			ledger_capacity: 1024,
		}
	}
}

// === Errors === //

#[derive(Debug, Copy, Clone, Error)]
pub enum MemoryError {
	#[error("memory manager initialized twice")]
	AlreadyInitialized,
	#[error("memory manager is not initialized")]
	Uninitialized,
	#[error("{} area exhausted", .0.name())]
	OutOfMemory(MemoryArea),
}

// === AllocationRecord === //

/// Ledger entry for one live tracked allocation.
#[derive(Debug, Clone)]
pub struct AllocationRecord {
	pub address: usize,
	pub bytes: usize,
	pub file: &'static str,
	pub line: u32,
	pub area: MemoryArea,
	/// Microseconds since the unix epoch at allocation time.
	pub timestamp_micros: u64,
	/// Call-site hash from [trace::capture_hash].
	pub trace_hash: u64,
	/// Position in the global allocation sequence.
	pub bookmark: u64,
}

impl AllocationRecord {
	fn log(&self, trap: u32, level: Level) {
		logger::format(
			level,
			format_args!(
				"{}({}) : {{ area=\"{}\" address={:#x} size={}byte time={}.{:06} traceHash={:#018X} }} [ {:08X} ]",
				self.file,
				self.line,
				self.area.name(),
				self.address,
				self.bytes,
				self.timestamp_micros / 1_000_000,
				self.timestamp_micros % 1_000_000,
				self.trace_hash,
				trap,
			),
		);
	}

	/// Re-reads the trap word past the payload. Only meaningful while the
	/// payload is live, which the ledger lock guarantees for its entries.
	unsafe fn read_trap(&self) -> u32 {
		ptr::read_unaligned((self.address + self.bytes) as *const u32)
	}
}

// === Ledger === //

struct Ledger {
	records: Vec<Option<AllocationRecord>>,
}

impl Ledger {
	const fn empty() -> Self {
		Self {
			records: Vec::new(),
		}
	}

	fn configure(&mut self, capacity: usize) {
		self.records.clear();
		self.records.resize(capacity, None);
	}

	/// Overwrites the record for an address already present (which tracked
	/// allocations never produce), otherwise takes the first empty slot.
	/// Returns false when the table is full and the record was skipped.
	fn insert(&mut self, record: AllocationRecord) -> bool {
		let mut empty = None;

		for (index, slot) in self.records.iter_mut().enumerate() {
			match slot {
				Some(existing) if existing.address == record.address => {
					*slot = Some(record);
					return true;
				}
				None if empty.is_none() => empty = Some(index),
				_ => {}
			}
		}

		match empty {
			Some(index) => {
				self.records[index] = Some(record);
				true
			}
			None => false,
		}
	}

	fn remove(&mut self, address: usize) -> Option<AllocationRecord> {
		self.records
			.iter_mut()
			.find(|slot| matches!(slot, Some(record) if record.address == address))
			.and_then(Option::take)
	}

	fn in_range(&self, lo: u64, hi: u64) -> impl Iterator<Item = &AllocationRecord> {
		self.records
			.iter()
			.flatten()
			.filter(move |record| (lo..hi).contains(&record.bookmark))
	}
}

// === MemoryManager === //

static SPACES: Mutex<Option<[MemorySpace; MemoryArea::COUNT]>> = Mutex::new(None);
static LEDGER: Mutex<Ledger> = Mutex::new(Ledger::empty());
static ALLOC_COUNT: AtomicU64 = AtomicU64::new(0);
static LIVE_COUNT: AtomicU64 = AtomicU64::new(0);

/// Facade over the process-wide areas and the debug ledger.
pub struct MemoryManager;

impl MemoryManager {
	pub fn initialize() -> Result<(), MemoryError> {
		Self::initialize_with(MemoryConfig::default())
	}

	pub fn initialize_with(config: MemoryConfig) -> Result<(), MemoryError> {
		{
			let mut spaces = SPACES.lock();
			if spaces.is_some() {
				drop(spaces);
				logger::message(Level::Error, "memory manager initialized twice");
				return Err(MemoryError::AlreadyInitialized);
			}

			*spaces = Some(MemoryArea::ALL.map(|area| {
				MemorySpace::create(area.name(), config.area_capacities[area.index()])
			}));
		}

		LEDGER.lock().configure(config.ledger_capacity);
		Ok(())
	}

	pub fn terminate() {
		let live = LIVE_COUNT.load(Relaxed);
		if live > 0 {
			logger::format(
				Level::Warning,
				format_args!("terminating with {live} live tracked allocations"),
			);
		}

		*SPACES.lock() = None;
		LEDGER.lock().configure(0);
	}

	pub fn is_initialized() -> bool {
		SPACES.lock().is_some()
	}

	// === Raw area operations === //

	pub fn alloc(area: MemoryArea, bytes: usize, align: usize) -> Option<NonNull<u8>> {
		let result = {
			let mut spaces = SPACES.lock();
			match spaces.as_mut() {
				Some(spaces) => spaces[area.index()].alloc(bytes, align).ok_or(MemoryError::OutOfMemory(area)),
				None => Err(MemoryError::Uninitialized),
			}
		};

		match result {
			Ok(payload) => Some(payload),
			Err(error) => {
				logger::format(
					Level::Error,
					format_args!("allocation of {bytes} bytes failed: {error}"),
				);
				None
			}
		}
	}

	/// Frees a raw allocation back to its area. Freeing null is a no-op.
	///
	/// # Safety
	///
	/// A non-null `ptr` must have come out of [Self::alloc] (or
	/// [Self::realloc]) for the same `area` and must not be freed twice.
	pub unsafe fn free(area: MemoryArea, ptr: *mut u8) {
		let Some(ptr) = NonNull::new(ptr) else {
			return;
		};

		let mut spaces = SPACES.lock();
		if let Some(spaces) = spaces.as_mut() {
			spaces[area.index()].free(ptr);
		}
	}

	/// Area-local resize. A null `ptr` degenerates to [Self::alloc] at the
	/// default alignment.
	///
	/// # Safety
	///
	/// Same contract as [Self::free].
	pub unsafe fn realloc(area: MemoryArea, ptr: *mut u8, new_bytes: usize) -> Option<NonNull<u8>> {
		let Some(ptr) = NonNull::new(ptr) else {
			return Self::alloc(area, new_bytes, DEFAULT_ALIGNMENT);
		};

		let result = {
			let mut spaces = SPACES.lock();
			match spaces.as_mut() {
				Some(spaces) => spaces[area.index()]
					.realloc(ptr, new_bytes)
					.ok_or(MemoryError::OutOfMemory(area)),
				None => Err(MemoryError::Uninitialized),
			}
		};

		match result {
			Ok(payload) => Some(payload),
			Err(error) => {
				logger::format(
					Level::Error,
					format_args!("realloc to {new_bytes} bytes failed: {error}"),
				);
				None
			}
		}
	}

	// === Tracked operations === //

	/// Allocates `bytes` in `area`, plants the trap word past the payload,
	/// and enters the allocation into the ledger under the caller's source
	/// location. Returns the payload address; the trap word is invisible to
	/// the caller.
	#[track_caller]
	pub fn alloc_tracked(area: MemoryArea, bytes: usize, align: usize) -> Option<NonNull<u8>> {
		let caller = Location::caller();
		let payload = Self::alloc(area, bytes.checked_add(TRAP_SIZE)?, align)?;

		unsafe {
			ptr::write_unaligned(payload.as_ptr().add(bytes) as *mut u32, TRAP_MAGIC);
		}

		let record = AllocationRecord {
			address: payload.as_ptr() as usize,
			bytes,
			file: caller.file(),
			line: caller.line(),
			area,
			timestamp_micros: now_micros(),
			trace_hash: trace::capture_hash(),
			bookmark: ALLOC_COUNT.fetch_add(1, Relaxed),
		};

		let inserted = LEDGER.lock().insert(record);
		if !inserted {
			logger::message(Level::Warning, "allocation ledger full; record skipped");
		}

		LIVE_COUNT.fetch_add(1, Relaxed);
		Some(payload)
	}

	/// Clears the ledger record and frees the payload. Freeing null is a
	/// no-op; freeing an address the ledger does not know still releases the
	/// memory but is reported.
	///
	/// # Safety
	///
	/// A non-null `ptr` must have come out of [Self::alloc_tracked] for the
	/// same `area` and must not be freed twice.
	pub unsafe fn free_tracked(area: MemoryArea, ptr: *mut u8) {
		if ptr.is_null() {
			return;
		}

		let removed = LEDGER.lock().remove(ptr as usize);
		if removed.is_none() {
			logger::format(
				Level::Warning,
				format_args!("freeing untracked address {:#x} in {}", ptr as usize, area.name()),
			);
		}

		Self::free(area, ptr);
		LIVE_COUNT.fetch_sub(1, Relaxed);
	}

	// === Audits === //

	/// Snapshot of the allocation counter; usable as an interval endpoint for
	/// [Self::report_leaks] and [Self::check_trap].
	pub fn bookmark() -> u64 {
		ALLOC_COUNT.load(Relaxed)
	}

	/// Tracked allocations minus tracked frees.
	pub fn live_instances() -> u64 {
		LIVE_COUNT.load(Relaxed)
	}

	/// Reports every live allocation whose bookmark falls in `lo..hi` and
	/// returns how many there were.
	pub fn report_leaks(lo: u64, hi: u64) -> usize {
		let leaked: Vec<(AllocationRecord, u32)> = {
			let ledger = LEDGER.lock();
			ledger
				.in_range(lo, hi)
				.map(|record| (record.clone(), unsafe { record.read_trap() }))
				.collect()
		};

		logger::message(Level::Info, FENCE_MAJOR);
		logger::format(
			Level::Info,
			format_args!("leak sweep [{lo:#X} - {hi:#X}]"),
		);

		for (record, trap) in &leaked {
			logger::message(Level::Warning, FENCE_MINOR);
			record.log(*trap, Level::Warning);
		}

		logger::message(Level::Info, FENCE_MINOR);
		match leaked.len() {
			0 => logger::message(Level::Info, "no leaks detected"),
			count => logger::format(
				Level::Warning,
				format_args!("{count} leaked allocations detected"),
			),
		}
		logger::message(Level::Info, FENCE_MAJOR);

		leaked.len()
	}

	/// Re-reads the trap word of every live allocation whose bookmark falls
	/// in `lo..hi`, reports the mismatches, and returns how many there were.
	pub fn check_trap(lo: u64, hi: u64) -> usize {
		let corrupted: Vec<(AllocationRecord, u32)> = {
			let ledger = LEDGER.lock();
			ledger
				.in_range(lo, hi)
				.filter_map(|record| {
					let trap = unsafe { record.read_trap() };
					(trap != TRAP_MAGIC).then(|| (record.clone(), trap))
				})
				.collect()
		};

		logger::message(Level::Info, FENCE_MAJOR);
		logger::format(
			Level::Info,
			format_args!("trap sweep [{lo:#X} - {hi:#X}]"),
		);

		for (record, trap) in &corrupted {
			logger::message(Level::Error, FENCE_MINOR);
			record.log(*trap, Level::Error);
		}

		logger::message(Level::Info, FENCE_MINOR);
		match corrupted.len() {
			0 => logger::message(Level::Info, "no heap corruption detected"),
			count => logger::format(
				Level::Error,
				format_args!("{count} corrupted allocations detected"),
			),
		}
		logger::message(Level::Info, FENCE_MAJOR);

		corrupted.len()
	}

	/// Dumps the whole ledger, oldest allocation first.
	pub fn print_all() {
		let mut records: Vec<(AllocationRecord, u32)> = {
			let ledger = LEDGER.lock();
			ledger
				.records
				.iter()
				.flatten()
				.map(|record| (record.clone(), unsafe { record.read_trap() }))
				.collect()
		};
		records.sort_by_key(|(record, _)| record.timestamp_micros);

		logger::message(Level::Info, FENCE_MINOR);
		for (record, trap) in &records {
			record.log(*trap, Level::Info);
		}
		logger::message(Level::Info, FENCE_MINOR);
	}
}

fn now_micros() -> u64 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.unwrap_or_default()
		.as_micros() as u64
}

// === Tests === //
