//! Reentrancy-safe multicast: signals, slots, and connection handles.
//!
//! A signal body keeps two slot lists. `live` is the list the current
//! emission iterates; `pending` collects slots connected while an emission is
//! in flight. Disconnection never shrinks `live` mid-emission: the entry is
//! tombstoned (severed) in place so in-flight indices stay valid, and the
//! list is compacted once the emission depth returns to zero.

use std::{
	cell::RefCell,
	fmt,
	sync::{
		atomic::{
			AtomicBool, AtomicI32,
			Ordering::{Acquire, Release},
		},
		Arc, Weak,
	},
};

use parking_lot::ReentrantMutex;
use smallvec::SmallVec;

// === Slot storage === //

struct SlotEntry<A, R> {
	slot: Box<dyn Fn(&A) -> R + Send + Sync>,
	severed: AtomicBool,
}

impl<A, R> SlotEntry<A, R> {
	fn is_severed(&self) -> bool {
		self.severed.load(Acquire)
	}

	fn sever(&self) {
		self.severed.store(true, Release);
	}
}

// === SignalBody === //

struct SignalBody<A, R> {
	/// Slots visible to emissions. Severed entries keep their position until
	/// the next compaction.
	live: ReentrantMutex<RefCell<Vec<Arc<SlotEntry<A, R>>>>>,
	/// Slots connected since the last top-level emission began. Promoted to
	/// the tail of `live` when the depth is back at zero.
	pending: ReentrantMutex<RefCell<Vec<Arc<SlotEntry<A, R>>>>>,
	/// Nested emission depth, across all threads.
	depth: AtomicI32,
}

/// Restores the depth counter even when a slot panics out of the emission.
struct DepthGuard<'a>(&'a AtomicI32);

impl Drop for DepthGuard<'_> {
	fn drop(&mut self) {
		self.0.fetch_sub(1, Release);
	}
}

impl<A, R> SignalBody<A, R> {
	fn new() -> Self {
		Self {
			live: ReentrantMutex::new(RefCell::new(Vec::new())),
			pending: ReentrantMutex::new(RefCell::new(Vec::new())),
			depth: AtomicI32::new(0),
		}
	}

	/// Copies `pending` out under its lock, then appends under the `live`
	/// lock. The two locks are never held at the same time; a slot severed in
	/// the window between them is filtered by its own flag.
	fn promote_pending(&self) {
		let drained: SmallVec<[Arc<SlotEntry<A, R>>; 4]> = {
			let pending = self.pending.lock();
			let mut pending = pending.borrow_mut();
			pending.drain(..).collect()
		};

		if drained.is_empty() {
			return;
		}

		let live = self.live.lock();
		live.borrow_mut()
			.extend(drained.into_iter().filter(|entry| !entry.is_severed()));
	}

	fn emit(&self, args: &A) -> Vec<R> {
		if self.depth.load(Acquire) <= 0 {
			self.promote_pending();
		}

		if self.depth.load(Acquire) >= i16::MAX as i32 {
			return Vec::new();
		}

		self.depth.fetch_add(1, Release);
		let depth_guard = DepthGuard(&self.depth);

		// Iterate by index; each entry is cloned out under a short lock so no
		// lock is held while user code runs.
		let mut results = Vec::new();
		let mut index = 0;
		loop {
			let entry = {
				let live = self.live.lock();
				let live = live.borrow();
				match live.get(index) {
					Some(entry) => Arc::clone(entry),
					None => break,
				}
			};
			index += 1;

			if entry.is_severed() {
				continue;
			}

			results.push((entry.slot)(args));
		}

		drop(depth_guard);
		if self.depth.load(Acquire) <= 0 {
			self.compact();
		}

		results
	}

	fn compact(&self) {
		let live = self.live.lock();
		live.borrow_mut().retain(|entry| !entry.is_severed());
	}

	fn disconnect(&self, target: &Arc<SlotEntry<A, R>>) {
		target.sever();

		// Pending slots can be dropped eagerly; live entries wait for the
		// post-emission compaction so in-flight indices survive.
		let pending = self.pending.lock();
		let mut pending = pending.borrow_mut();
		if let Some(position) = pending.iter().position(|entry| Arc::ptr_eq(entry, target)) {
			pending.remove(position);
		}
	}

	fn invocation_count(&self) -> usize {
		let live = self.live.lock();
		let live = live.borrow();
		live.iter().filter(|entry| !entry.is_severed()).count()
	}
}

// === Connection === //

trait ConnectionBody: Send + Sync {
	fn disconnect(&self);
	fn is_connected(&self) -> bool;
	fn clone_body(&self) -> Box<dyn ConnectionBody>;
}

struct ConnectionBodyFor<A, R> {
	body: Weak<SignalBody<A, R>>,
	entry: Weak<SlotEntry<A, R>>,
}

impl<A: 'static, R: 'static> ConnectionBody for ConnectionBodyFor<A, R> {
	fn disconnect(&self) {
		let Some(entry) = self.entry.upgrade() else {
			return;
		};

		match self.body.upgrade() {
			Some(body) => body.disconnect(&entry),
			None => entry.sever(),
		}
	}

	fn is_connected(&self) -> bool {
		self.body.upgrade().is_some()
			&& self
				.entry
				.upgrade()
				.map_or(false, |entry| !entry.is_severed())
	}

	fn clone_body(&self) -> Box<dyn ConnectionBody> {
		Box::new(Self {
			body: self.body.clone(),
			entry: self.entry.clone(),
		})
	}
}

/// Weak handle to one (signal, slot) pair. Dropping it does nothing; cloning
/// produces an equivalent weak handle; disconnecting is idempotent and safe
/// after either endpoint is gone.
#[derive(Default)]
pub struct Connection {
	body: Option<Box<dyn ConnectionBody>>,
}

impl Connection {
	pub fn disconnect(&mut self) {
		if let Some(body) = self.body.take() {
			body.disconnect();
		}
	}

	pub fn is_connected(&self) -> bool {
		self.body.as_ref().map_or(false, |body| body.is_connected())
	}
}

impl Clone for Connection {
	fn clone(&self) -> Self {
		Self {
			body: self.body.as_ref().map(|body| body.clone_body()),
		}
	}
}

impl fmt::Debug for Connection {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Connection")
			.field("connected", &self.is_connected())
			.finish()
	}
}

// === ScopedConnection === //

/// Connection wrapper that disconnects when dropped. Not cloneable.
#[derive(Debug, Default)]
pub struct ScopedConnection {
	connection: Connection,
}

impl ScopedConnection {
	pub fn new() -> Self {
		Self::default()
	}

	/// Adopts `connection`, disconnecting whatever was held before.
	pub fn replace(&mut self, connection: Connection) {
		self.connection.disconnect();
		self.connection = connection;
	}

	pub fn disconnect(&mut self) {
		self.connection.disconnect();
	}

	pub fn is_connected(&self) -> bool {
		self.connection.is_connected()
	}
}

impl From<Connection> for ScopedConnection {
	fn from(connection: Connection) -> Self {
		Self { connection }
	}
}

impl Drop for ScopedConnection {
	fn drop(&mut self) {
		self.connection.disconnect();
	}
}

// === Signal === //

/// Multicast emitter. Slots receive the emission argument by reference and
/// their return values come back from [Signal::emit] in invocation order
/// (`Vec<()>` for plain notifications, which never allocates).
pub struct Signal<A: 'static = (), R: 'static = ()> {
	body: Arc<SignalBody<A, R>>,
}

impl<A: 'static, R: 'static> Signal<A, R> {
	pub fn new() -> Self {
		Self {
			body: Arc::new(SignalBody::new()),
		}
	}

	/// Appends `slot` to the pending list; it joins the live list when no
	/// emission is in flight. Slots connected during an emission are not
	/// invoked by it.
	pub fn connect<F>(&self, slot: F) -> Connection
	where
		F: Fn(&A) -> R + Send + Sync + 'static,
	{
		let entry = Arc::new(SlotEntry {
			slot: Box::new(slot),
			severed: AtomicBool::new(false),
		});

		{
			let pending = self.body.pending.lock();
			pending.borrow_mut().push(Arc::clone(&entry));
		}

		Connection {
			body: Some(Box::new(ConnectionBodyFor {
				body: Arc::downgrade(&self.body),
				entry: Arc::downgrade(&entry),
			})),
		}
	}

	/// Invokes every slot that was live at the start of the emission, in
	/// connection order, and returns their results.
	pub fn emit(&self, args: &A) -> Vec<R> {
		self.body.emit(args)
	}

	/// Live slots minus tombstones.
	pub fn invocation_count(&self) -> usize {
		self.body.invocation_count()
	}
}

impl<A: 'static, R: 'static> Default for Signal<A, R> {
	fn default() -> Self {
		Self::new()
	}
}

impl<A: 'static, R: 'static> fmt::Debug for Signal<A, R> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Signal")
			.field("invocation_count", &self.invocation_count())
			.finish()
	}
}

// === Tests === //

#[cfg(test)]
mod tests {
	use std::sync::{
		atomic::{AtomicUsize, Ordering::SeqCst},
		Arc,
	};

	use parking_lot::Mutex;

	use super::*;

	#[test]
	fn every_slot_fires_once_per_emission() {
		let signal = Signal::<u32>::new();
		let hits = Arc::new(AtomicUsize::new(0));

		for _ in 0..3 {
			let hits = Arc::clone(&hits);
			let _conn = signal.connect(move |value| {
				hits.fetch_add(*value as usize, SeqCst);
			});
		}

		signal.emit(&2);
		assert_eq!(hits.load(SeqCst), 6);
		assert_eq!(signal.invocation_count(), 3);
	}

	#[test]
	fn emission_collects_return_values_in_order() {
		let signal = Signal::<u32, u32>::new();
		let _a = signal.connect(|value| value + 1);
		let _b = signal.connect(|value| value * 10);

		assert_eq!(signal.emit(&5), vec![6, 50]);
	}

	#[test]
	fn slot_connected_during_emission_waits_for_the_next() {
		let signal = Arc::new(Signal::<()>::new());
		let log = Arc::new(Mutex::new(Vec::new()));

		let _a = {
			let signal_for_connect = Arc::clone(&signal);
			let signal = Arc::clone(&signal);
			let log = Arc::clone(&log);
			let hooked = AtomicBool::new(false);

			signal_for_connect.connect(move |()| {
				log.lock().push("a");

				if !hooked.swap(true, SeqCst) {
					let log = Arc::clone(&log);
					// Deliberately leak the connection; the signal owns the slot.
					let _ = signal.connect(move |()| {
						log.lock().push("b");
					});
				}
			})
		};

		signal.emit(&());
		assert_eq!(*log.lock(), vec!["a"]);

		signal.emit(&());
		assert_eq!(*log.lock(), vec!["a", "a", "b"]);
	}

	#[test]
	fn slot_disconnected_during_emission_is_skipped() {
		let signal = Signal::<()>::new();
		let log = Arc::new(Mutex::new(Vec::new()));

		let victim = {
			let log = Arc::clone(&log);
			signal.connect(move |()| {
				log.lock().push("victim");
			})
		};

		let victim = Arc::new(Mutex::new(victim));
		let _killer = {
			let log = Arc::clone(&log);
			let victim = Arc::clone(&victim);
			signal.connect(move |()| {
				log.lock().push("killer");
				victim.lock().disconnect();
			})
		};

		// The killer connected after the victim, so "victim" fires once; on
		// any later emission it must stay silent.
		signal.emit(&());
		signal.emit(&());
		assert_eq!(*log.lock(), vec!["victim", "killer", "killer"]);
	}

	#[test]
	fn slot_disconnecting_a_not_yet_visited_slot_suppresses_it() {
		let signal = Signal::<()>::new();
		let log = Arc::new(Mutex::new(Vec::new()));

		let victim_conn: Arc<Mutex<Connection>> = Arc::new(Mutex::new(Connection::default()));

		let _killer = {
			let log = Arc::clone(&log);
			let victim_conn = Arc::clone(&victim_conn);
			signal.connect(move |()| {
				log.lock().push("killer");
				victim_conn.lock().disconnect();
			})
		};

		*victim_conn.lock() = {
			let log = Arc::clone(&log);
			signal.connect(move |()| {
				log.lock().push("victim");
			})
		};

		signal.emit(&());
		assert_eq!(*log.lock(), vec!["killer"]);
	}

	#[test]
	fn disconnect_is_idempotent() {
		let signal = Signal::<()>::new();
		let fired = Arc::new(AtomicUsize::new(0));

		let mut conn = {
			let fired = Arc::clone(&fired);
			signal.connect(move |()| {
				fired.fetch_add(1, SeqCst);
			})
		};

		signal.emit(&());
		assert!(conn.is_connected());

		conn.disconnect();
		conn.disconnect();
		assert!(!conn.is_connected());

		signal.emit(&());
		assert_eq!(fired.load(SeqCst), 1);
		assert_eq!(signal.invocation_count(), 0);
	}

	#[test]
	fn cloned_connections_alias_the_same_slot() {
		let signal = Signal::<()>::new();
		let conn = signal.connect(|()| {});
		let mut clone = conn.clone();

		signal.emit(&());
		assert!(conn.is_connected());
		assert!(clone.is_connected());

		clone.disconnect();
		assert!(!conn.is_connected());
		assert_eq!(signal.invocation_count(), 0);
	}

	#[test]
	fn scoped_connection_disconnects_on_drop() {
		let signal = Signal::<()>::new();
		let fired = Arc::new(AtomicUsize::new(0));

		{
			let fired = Arc::clone(&fired);
			let _scoped = ScopedConnection::from(signal.connect(move |()| {
				fired.fetch_add(1, SeqCst);
			}));
			signal.emit(&());
		}

		signal.emit(&());
		assert_eq!(fired.load(SeqCst), 1);
	}

	#[test]
	fn connections_outlive_their_signal_safely() {
		let mut conn = {
			let signal = Signal::<()>::new();
			signal.connect(|()| {})
		};

		assert!(!conn.is_connected());
		conn.disconnect();
	}

	#[test]
	fn reentrant_emission_terminates() {
		let signal = Arc::new(Signal::<()>::new());
		let depth = Arc::new(AtomicUsize::new(0));

		let _conn = {
			let signal_for_connect = Arc::clone(&signal);
			let signal = Arc::clone(&signal);
			let depth = Arc::clone(&depth);
			signal_for_connect.connect(move |()| {
				if depth.fetch_add(1, SeqCst) < 3 {
					signal.emit(&());
				}
			})
		};

		signal.emit(&());
		assert_eq!(depth.load(SeqCst), 4);
	}

	#[test]
	fn panicking_slot_restores_the_depth_counter() {
		let signal = Signal::<()>::new();

		let armed = AtomicBool::new(true);
		let _bomb = signal.connect(move |()| {
			if armed.swap(false, SeqCst) {
				panic!("slot failure");
			}
		});

		let fired = Arc::new(AtomicUsize::new(0));
		let _late = {
			let fired = Arc::clone(&fired);
			signal.connect(move |()| {
				fired.fetch_add(1, SeqCst);
			})
		};

		assert!(std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
			signal.emit(&());
		}))
		.is_err());

		// The panic unwound past the slot that never ran. With the depth
		// restored, the next top-level emission reaches it.
		signal.emit(&());
		assert_eq!(fired.load(SeqCst), 1);
	}
}
