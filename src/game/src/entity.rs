//! Entities: an event queue, a fan-out connection, and an ordered component
//! list under one identifier.

use std::{
	fmt, mem,
	sync::{Arc, Weak},
};

use parking_lot::Mutex;

use lantern_system::{
	event::EventQueue,
	mem::MemoryArea,
	signal::ScopedConnection,
};

use crate::component::{Component, ComponentManager};

// === EntityHandle === //

/// Weak back-reference to an entity. Validity is rechecked on every use, so
/// holders (components, most of the time) never keep an entity alive and
/// never dangle.
#[derive(Clone)]
pub struct EntityHandle {
	id: u64,
	entity: Weak<Entity>,
}

impl EntityHandle {
	pub fn id(&self) -> u64 {
		self.id
	}

	pub fn upgrade(&self) -> Option<Arc<Entity>> {
		self.entity.upgrade()
	}

	pub fn is_alive(&self) -> bool {
		self.entity.strong_count() > 0
	}

	/// Posts onto the referenced entity's queue; a dead handle ignores the
	/// event.
	pub fn post_event<T: Send + Sync + 'static>(&self, value: T) {
		if let Some(entity) = self.upgrade() {
			entity.post_event(value);
		}
	}
}

impl fmt::Debug for EntityHandle {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("EntityHandle")
			.field("id", &self.id)
			.field("alive", &self.is_alive())
			.finish()
	}
}

// === Entity === //

type ComponentList = Arc<Mutex<Vec<Arc<dyn Component>>>>;

/// An identified aggregate: a SYSTEM-area event queue wired to a fan-out slot
/// that forwards every dispatched event to the components in insertion order.
pub struct Entity {
	id: u64,
	queue: EventQueue,
	components: ComponentList,
	_fan_out: ScopedConnection,
}

impl Entity {
	pub(crate) fn new(id: u64) -> Arc<Self> {
		let queue = EventQueue::new(MemoryArea::System);
		let components: ComponentList = Arc::default();

		let fan_out = {
			let components = Arc::clone(&components);
			queue.connect(move |event| {
				// Snapshot so a handler may register or unregister components
				// on its own entity mid-dispatch.
				let snapshot = components.lock().clone();
				for component in &snapshot {
					component.handle_event(event);
				}
			})
		};

		Arc::new(Self {
			id,
			queue,
			components,
			_fan_out: ScopedConnection::from(fan_out),
		})
	}

	pub fn id(&self) -> u64 {
		self.id
	}

	pub fn handle(self: &Arc<Self>) -> EntityHandle {
		EntityHandle {
			id: self.id,
			entity: Arc::downgrade(self),
		}
	}

	pub fn post_event<T: Send + Sync + 'static>(&self, value: T) {
		self.queue.enqueue_as(value);
	}

	/// Drains the entity's queue through the fan-out slot.
	pub fn dispatch_event(&self) {
		self.queue.emit();
	}

	/// Creates the named component through the [ComponentManager] and appends
	/// it to the component list. Returns false when no factory matched.
	pub fn register_component(self: &Arc<Self>, name: &str) -> bool {
		let Some(component) = ComponentManager::instance().create_component(name) else {
			return false;
		};

		component.attach_owner(self.handle());
		self.components.lock().push(component);
		true
	}

	/// Removes the first component with a matching name and releases it from
	/// the registry. Returns false when the entity has no such component.
	pub fn unregister_component(&self, name: &str) -> bool {
		let removed = {
			let mut components = self.components.lock();
			components
				.iter()
				.position(|component| component.component_name() == name)
				.map(|position| components.remove(position))
		};

		match removed {
			Some(component) => {
				ComponentManager::instance().destroy_component(&component);
				true
			}
			None => false,
		}
	}

	pub fn component_count(&self) -> usize {
		self.components.lock().len()
	}
}

impl Drop for Entity {
	fn drop(&mut self) {
		let components = mem::take(&mut *self.components.lock());
		for component in components {
			ComponentManager::instance().destroy_component(&component);
		}
	}
}

impl fmt::Debug for Entity {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Entity")
			.field("id", &self.id)
			.field("components", &self.component_count())
			.finish()
	}
}

// === Tests === //
