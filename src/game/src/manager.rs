//! The entity registry: id allocation, event routing, and the dispatch tick.

use std::{
	collections::BTreeMap,
	mem,
	sync::{
		atomic::{AtomicU64, Ordering::Relaxed},
		Arc,
	},
};

use once_cell::sync::Lazy;
use parking_lot::Mutex;

use crate::{
	entity::{Entity, EntityHandle},
	events::{OnDestroy, OnStart},
};

// === EntityManager === //

/// Registry of live entities keyed by id. Ids are handed out monotonically
/// starting at 1 and never reused; iteration over entities is always in
/// ascending id order, which the ordered map gives us for free.
///
/// Dispatch is single-threaded by contract, but every entry point snapshots
/// the table outside the lock so components may call back into the manager
/// mid-dispatch.
pub struct EntityManager {
	next_id: AtomicU64,
	entities: Mutex<BTreeMap<u64, Arc<Entity>>>,
	/// Ids whose `OnDestroy` is queued; drained at the end of the next
	/// dispatch tick.
	destroy_ids: Mutex<Vec<u64>>,
}

impl EntityManager {
	pub fn instance() -> &'static EntityManager {
		static INSTANCE: Lazy<EntityManager> = Lazy::new(EntityManager::new);

		&INSTANCE
	}

	pub fn new() -> Self {
		Self {
			next_id: AtomicU64::new(1),
			entities: Mutex::new(BTreeMap::new()),
			destroy_ids: Mutex::new(Vec::new()),
		}
	}

	/// Creates an entity, posts `OnStart` on it, and returns its id.
	pub fn create_entity(&self) -> u64 {
		let id = self.next_id.fetch_add(1, Relaxed);
		let entity = Entity::new(id);

		self.entities.lock().insert(id, Arc::clone(&entity));
		entity.post_event(OnStart);

		id
	}

	/// Posts `OnDestroy` and schedules the entity for removal at the end of
	/// the next dispatch tick. Unknown ids are ignored.
	pub fn destroy_entity(&self, id: u64) {
		let entity = self.entities.lock().get(&id).cloned();

		if let Some(entity) = entity {
			entity.post_event(OnDestroy);
			self.destroy_ids.lock().push(id);
		}
	}

	/// Targeted delivery. Unknown ids are ignored.
	pub fn post_event<T: Send + Sync + 'static>(&self, id: u64, value: T) {
		let entity = self.entities.lock().get(&id).cloned();

		if let Some(entity) = entity {
			entity.post_event(value);
		}
	}

	/// Enqueues a copy of `value` on every known entity, in id order.
	pub fn broadcast_event<T: Clone + Send + Sync + 'static>(&self, value: T) {
		let targets: Vec<Arc<Entity>> = self.entities.lock().values().cloned().collect();

		for entity in targets {
			entity.post_event(value.clone());
		}
	}

	pub fn register_component(&self, id: u64, name: &str) -> bool {
		let entity = self.entities.lock().get(&id).cloned();
		entity.map_or(false, |entity| entity.register_component(name))
	}

	pub fn unregister_component(&self, id: u64, name: &str) -> bool {
		let entity = self.entities.lock().get(&id).cloned();
		entity.map_or(false, |entity| entity.unregister_component(name))
	}

	/// One dispatch tick: drain every entity's queue in ascending id order,
	/// then apply the deferred destructions.
	pub fn dispatch_event(&self) {
		let targets: Vec<Arc<Entity>> = self.entities.lock().values().cloned().collect();
		for entity in &targets {
			entity.dispatch_event();
		}

		let destroyed = mem::take(&mut *self.destroy_ids.lock());
		if !destroyed.is_empty() {
			let mut entities = self.entities.lock();
			for id in destroyed {
				entities.remove(&id);
			}
		}
	}

	pub fn contains(&self, id: u64) -> bool {
		self.entities.lock().contains_key(&id)
	}

	pub fn entity_count(&self) -> usize {
		self.entities.lock().len()
	}

	pub fn handle(&self, id: u64) -> Option<EntityHandle> {
		self.entities.lock().get(&id).map(Entity::handle)
	}
}

impl Default for EntityManager {
	fn default() -> Self {
		Self::new()
	}
}

// === Tests === //

#[cfg(test)]
mod tests {
	use parking_lot::Mutex as PlMutex;

	use lantern_system::event::EventValue;

	use crate::component::{Component, ComponentManager};
	use crate::events::OnUpdate;

	use super::*;

	struct Recorder {
		name: &'static str,
		log: Arc<PlMutex<Vec<String>>>,
	}

	impl Component for Recorder {
		fn handle_event(&self, event: &EventValue) {
			if event.is::<OnStart>() {
				self.log.lock().push(format!("{} => OnStart", self.name));
			} else if event.is::<OnDestroy>() {
				self.log.lock().push(format!("{} => OnDestroy", self.name));
			} else if let Some(update) = event.downcast_ref::<OnUpdate>() {
				self.log
					.lock()
					.push(format!("{} => OnUpdate{{{}}}", self.name, update.delta_time));
			}
		}

		fn component_name(&self) -> &str {
			self.name
		}
	}

	fn register_recorder(name: &'static str, log: &Arc<PlMutex<Vec<String>>>) {
		let log = Arc::clone(log);
		ComponentManager::instance().register_factory(name, move || {
			Arc::new(Recorder {
				name,
				log: Arc::clone(&log),
			})
		});
	}

	#[test]
	fn lifecycle_events_arrive_in_order_and_destruction_is_deferred() {
		crate::test_util::init_runtime();

		let log = Arc::new(PlMutex::new(Vec::new()));
		register_recorder("TestComponentA", &log);

		let manager = EntityManager::new();
		let e1 = manager.create_entity();
		assert!(manager.register_component(e1, "TestComponentA"));

		manager.broadcast_event(OnUpdate { delta_time: 0.0 });
		manager.destroy_entity(e1);

		// Nothing ran yet; the queue drains on the tick.
		assert!(log.lock().is_empty());
		assert!(manager.contains(e1));

		manager.dispatch_event();

		assert_eq!(
			*log.lock(),
			vec![
				"TestComponentA => OnStart",
				"TestComponentA => OnUpdate{0}",
				"TestComponentA => OnDestroy",
			]
		);
		assert!(!manager.contains(e1));
		assert_eq!(manager.entity_count(), 0);
	}

	#[test]
	fn entity_ids_start_at_one_and_are_never_reused() {
		crate::test_util::init_runtime();

		let manager = EntityManager::new();
		assert_eq!(manager.create_entity(), 1);
		assert_eq!(manager.create_entity(), 2);

		manager.destroy_entity(1);
		manager.dispatch_event();

		assert_eq!(manager.create_entity(), 3);
	}

	#[test]
	fn events_after_removal_are_dropped() {
		crate::test_util::init_runtime();

		let log = Arc::new(PlMutex::new(Vec::new()));
		register_recorder("TestComponentGone", &log);

		let manager = EntityManager::new();
		let id = manager.create_entity();
		manager.register_component(id, "TestComponentGone");
		manager.destroy_entity(id);
		manager.dispatch_event();

		log.lock().clear();

		manager.post_event(id, OnUpdate { delta_time: 1.0 });
		manager.broadcast_event(OnUpdate { delta_time: 2.0 });
		manager.dispatch_event();

		assert!(log.lock().is_empty());
	}

	#[test]
	fn broadcast_walks_entities_in_id_order() {
		crate::test_util::init_runtime();

		let log = Arc::new(PlMutex::new(Vec::new()));
		register_recorder("TestComponentOrder", &log);

		let manager = EntityManager::new();
		let first = manager.create_entity();
		let second = manager.create_entity();
		manager.register_component(first, "TestComponentOrder");
		manager.register_component(second, "TestComponentOrder");

		// Flush the two OnStart deliveries out of the way.
		manager.dispatch_event();
		log.lock().clear();

		manager.broadcast_event(OnUpdate { delta_time: 5.0 });
		manager.dispatch_event();

		assert_eq!(
			*log.lock(),
			vec![
				"TestComponentOrder => OnUpdate{5}",
				"TestComponentOrder => OnUpdate{5}",
			]
		);
	}

	#[test]
	fn missing_ids_are_silently_ignored() {
		crate::test_util::init_runtime();

		let manager = EntityManager::new();
		manager.destroy_entity(42);
		manager.post_event(42, OnUpdate { delta_time: 0.0 });
		assert!(!manager.register_component(42, "TestComponentA"));
		assert!(!manager.unregister_component(42, "TestComponentA"));
		manager.dispatch_event();
	}

	#[test]
	fn handles_from_the_registry_expire_with_the_entity() {
		crate::test_util::init_runtime();

		let manager = EntityManager::new();
		let id = manager.create_entity();

		let handle = manager.handle(id).unwrap();
		assert!(handle.is_alive());

		manager.destroy_entity(id);
		manager.dispatch_event();

		assert!(manager.handle(id).is_none());
		assert!(!handle.is_alive());
	}
}
