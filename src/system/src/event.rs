//! Type-erased event values and the deferred emission queue.

use std::{
	any::TypeId,
	fmt,
	hash::{Hash, Hasher},
	mem,
	ptr::{self, NonNull},
};

use parking_lot::Mutex;
use rustc_hash::FxHasher;

use crate::{
	logger::{self, Level},
	mem::{area::MemoryArea, boxed::AreaVec, ledger::MemoryManager},
	signal::{Connection, Signal},
};

// === TypeFingerprint === //

/// Stable 64-bit identity of a payload type. Two fingerprints compare equal
/// iff the types match; distinct types collide only with negligible
/// probability, and such a collision is a program bug rather than a data
/// condition.
#[derive(Copy, Clone)]
#[cfg_attr(not(debug_assertions), derive(Eq, PartialEq, Ord, PartialOrd, Hash))]
#[cfg_attr(
	debug_assertions,
	derive_where::derive_where(Eq, PartialEq, Ord, PartialOrd, Hash)
)]
pub struct TypeFingerprint {
	value: u64,
	#[cfg(debug_assertions)]
	#[derive_where(skip)]
	name: Option<&'static str>,
}

impl fmt::Debug for TypeFingerprint {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		#[cfg(debug_assertions)]
		if let Some(name) = self.name {
			return write!(f, "TypeFingerprint<{name}>");
		}

		write!(f, "TypeFingerprint({:#018X})", self.value)
	}
}

impl TypeFingerprint {
	pub fn of<T: ?Sized + 'static>() -> Self {
		let mut hasher = FxHasher::default();
		TypeId::of::<T>().hash(&mut hasher);

		Self {
			value: hasher.finish(),
			#[cfg(debug_assertions)]
			name: Some(std::any::type_name::<T>()),
		}
	}

	pub fn raw(self) -> u64 {
		self.value
	}
}

// === EventValue === //

/// Ownership-exclusive box pairing a payload with its type fingerprint.
/// Introspection is deliberately narrow: [EventValue::is] and
/// [EventValue::downcast_ref] are all a consumer gets.
///
/// Payload storage is tracked in the area the value was built for, so event
/// traffic shows up in leak and overrun audits like any other allocation.
pub struct EventValue {
	fingerprint: TypeFingerprint,
	type_id: TypeId,
	payload: NonNull<u8>,
	area: MemoryArea,
	drop_payload: unsafe fn(*mut u8),
}

unsafe impl Send for EventValue {}
unsafe impl Sync for EventValue {}

impl EventValue {
	/// Moves `value` into tracked storage in `area`. `None` when the arena is
	/// exhausted (the allocator already logged the failure); an [EventValue]
	/// that exists is never empty.
	#[track_caller]
	pub fn try_new_in<T: Send + Sync + 'static>(area: MemoryArea, value: T) -> Option<Self> {
		let raw = MemoryManager::alloc_tracked(area, mem::size_of::<T>(), mem::align_of::<T>())?;

		unsafe {
			raw.cast::<T>().as_ptr().write(value);
		}

		Some(Self {
			fingerprint: TypeFingerprint::of::<T>(),
			type_id: TypeId::of::<T>(),
			payload: raw,
			area,
			drop_payload: drop_erased::<T>,
		})
	}

	#[track_caller]
	pub fn new<T: Send + Sync + 'static>(value: T) -> Option<Self> {
		Self::try_new_in(MemoryArea::System, value)
	}

	pub fn fingerprint(&self) -> TypeFingerprint {
		self.fingerprint
	}

	pub fn area(&self) -> MemoryArea {
		self.area
	}

	pub fn is<T: 'static>(&self) -> bool {
		self.fingerprint == TypeFingerprint::of::<T>()
	}

	/// Borrow of the payload iff it is a `T`.
	pub fn downcast_ref<T: 'static>(&self) -> Option<&T> {
		(self.type_id == TypeId::of::<T>())
			.then(|| unsafe { &*(self.payload.as_ptr() as *const T) })
	}
}

unsafe fn drop_erased<T>(payload: *mut u8) {
	ptr::drop_in_place(payload as *mut T);
}

impl fmt::Debug for EventValue {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("EventValue")
			.field("fingerprint", &self.fingerprint)
			.field("area", &self.area)
			.finish()
	}
}

impl Drop for EventValue {
	fn drop(&mut self) {
		unsafe {
			(self.drop_payload)(self.payload.as_ptr());
			MemoryManager::free_tracked(self.area, self.payload.as_ptr());
		}
	}
}

// === EventQueue === //

/// Deferred-emission queue: events accumulate under the queue lock and fan
/// out through one internal signal on [EventQueue::emit]. The queue is tagged
/// with the area its event payloads route to; the buffer itself is container
/// storage and lives in the STL area.
pub struct EventQueue {
	area: MemoryArea,
	events: Mutex<AreaVec<EventValue>>,
	signal: Signal<EventValue>,
}

impl EventQueue {
	pub fn new(area: MemoryArea) -> Self {
		Self {
			area,
			events: Mutex::new(AreaVec::new_in(MemoryArea::Stl)),
			signal: Signal::new(),
		}
	}

	/// Queue for framework-internal traffic.
	pub fn system() -> Self {
		Self::new(MemoryArea::System)
	}

	pub fn area(&self) -> MemoryArea {
		self.area
	}

	pub fn connect<F>(&self, slot: F) -> Connection
	where
		F: Fn(&EventValue) + Send + Sync + 'static,
	{
		self.signal.connect(slot)
	}

	pub fn enqueue(&self, event: EventValue) {
		let mut events = self.events.lock();
		if events.push(event).is_err() {
			drop(events);
			logger::message(Level::Error, "event queue storage exhausted; event dropped");
		}
	}

	/// Builds the [EventValue] in place and appends it. Allocation failure is
	/// fail-soft: the event is dropped after the allocator logs the error.
	#[track_caller]
	pub fn enqueue_as<T: Send + Sync + 'static>(&self, value: T) {
		if let Some(event) = EventValue::try_new_in(self.area, value) {
			self.enqueue(event);
		}
	}

	/// Fires the queued events in FIFO order. The buffer is swapped out under
	/// the lock first, so slots enqueueing further events feed the *next*
	/// emission rather than this one.
	pub fn emit(&self) {
		let drained = self.events.lock().take_all();

		for event in &drained {
			self.signal.emit(event);
		}
	}

	pub fn pending_events(&self) -> usize {
		self.events.lock().len()
	}
}

impl fmt::Debug for EventQueue {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("EventQueue")
			.field("area", &self.area)
			.field("pending_events", &self.pending_events())
			.finish()
	}
}

impl Drop for EventQueue {
	fn drop(&mut self) {
		let events = self.events.get_mut();
		if !events.is_empty() {
			logger::format(
				Level::Warning,
				format_args!("dropping event queue with {} undispatched events", events.len()),
			);
		}
	}
}

// === Tests === //

#[cfg(test)]
mod tests {
	use std::sync::Arc;

	use parking_lot::Mutex as PlMutex;

	use super::*;
	use crate::test_util::memory_test;

	#[derive(Debug, Copy, Clone, PartialEq)]
	struct Ping;

	#[derive(Debug, Copy, Clone, PartialEq)]
	struct Tick {
		step: u32,
	}

	#[test]
	fn fingerprints_discriminate_types() {
		assert_eq!(TypeFingerprint::of::<Ping>(), TypeFingerprint::of::<Ping>());
		assert_ne!(TypeFingerprint::of::<Ping>(), TypeFingerprint::of::<Tick>());
	}

	#[test]
	fn value_answers_only_for_its_own_type() {
		let _guard = memory_test();

		let event = EventValue::new(Ping).unwrap();
		assert!(event.is::<Ping>());
		assert!(!event.is::<Tick>());
		assert!(event.downcast_ref::<Ping>().is_some());
		assert!(event.downcast_ref::<Tick>().is_none());
	}

	#[test]
	fn value_preserves_the_payload() {
		let _guard = memory_test();

		let event = EventValue::new(Tick { step: 77 }).unwrap();
		assert_eq!(event.downcast_ref::<Tick>(), Some(&Tick { step: 77 }));
	}

	#[test]
	fn value_storage_is_tracked_in_its_area() {
		let _guard = memory_test();

		let b0 = MemoryManager::bookmark();
		let event = EventValue::try_new_in(MemoryArea::Application, Tick { step: 1 }).unwrap();
		assert_eq!(event.area(), MemoryArea::Application);
		assert_eq!(MemoryManager::report_leaks(b0, MemoryManager::bookmark()), 1);

		drop(event);
		assert_eq!(MemoryManager::report_leaks(b0, MemoryManager::bookmark()), 0);
	}

	#[test]
	fn queue_dispatches_in_fifo_order() {
		let _guard = memory_test();

		let queue = EventQueue::system();
		let seen = Arc::new(PlMutex::new(Vec::new()));

		let _conn = {
			let seen = Arc::clone(&seen);
			queue.connect(move |event| {
				seen.lock().push(event.downcast_ref::<Tick>().unwrap().step);
			})
		};

		for step in 0..5 {
			queue.enqueue_as(Tick { step });
		}
		queue.emit();

		assert_eq!(*seen.lock(), vec![0, 1, 2, 3, 4]);
		assert_eq!(queue.pending_events(), 0);
	}

	#[test]
	fn events_enqueued_mid_emission_wait_for_the_next() {
		let _guard = memory_test();

		let queue = Arc::new(EventQueue::system());
		let seen = Arc::new(PlMutex::new(Vec::new()));

		let _conn = {
			let feedback = Arc::clone(&queue);
			let seen = Arc::clone(&seen);
			queue.connect(move |event| {
				let tick = *event.downcast_ref::<Tick>().unwrap();
				seen.lock().push(tick.step);

				if tick.step == 0 {
					feedback.enqueue_as(Tick { step: 1 });
				}
			})
		};

		queue.enqueue_as(Tick { step: 0 });
		queue.emit();
		assert_eq!(*seen.lock(), vec![0]);
		assert_eq!(queue.pending_events(), 1);

		queue.emit();
		assert_eq!(*seen.lock(), vec![0, 1]);
	}
}
