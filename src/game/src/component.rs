//! Named components and the factory-backed component registry.

use std::{hash::BuildHasherDefault, sync::Arc};

use hashbrown::HashMap;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use rustc_hash::FxHasher;

use lantern_system::{
	event::EventValue,
	lantern_assert,
	logger::{self, Level},
};

use crate::entity::EntityHandle;

type FxHashMap<K, V> = HashMap<K, V, BuildHasherDefault<FxHasher>>;

// === Component === //

/// Polymorphic event handler installed on an entity under a stable name.
/// Component names are compared by string equality everywhere.
pub trait Component: Send + Sync {
	fn handle_event(&self, event: &EventValue);

	/// The component's class name; must match the factory name it was
	/// created under.
	fn component_name(&self) -> &str;

	/// Called once when the component is installed. The handle is a weak
	/// back-reference; the entity keeps exclusive ownership of its list.
	fn attach_owner(&self, _owner: EntityHandle) {}
}

pub type ComponentFactory = Arc<dyn Fn() -> Arc<dyn Component> + Send + Sync>;

// === ComponentManager === //

#[derive(Default)]
struct ManagerInner {
	factories: FxHashMap<String, ComponentFactory>,
	/// Created components indexed by class name, for lookup and bulk
	/// destruction.
	instances: FxHashMap<String, Vec<Arc<dyn Component>>>,
}

/// Process-wide registry mapping component names to user-supplied factories.
pub struct ComponentManager {
	inner: Mutex<ManagerInner>,
}

impl ComponentManager {
	pub fn instance() -> &'static ComponentManager {
		static INSTANCE: Lazy<ComponentManager> = Lazy::new(|| ComponentManager {
			inner: Mutex::default(),
		});

		&INSTANCE
	}

	pub fn register_factory<F>(&self, name: impl Into<String>, factory: F)
	where
		F: Fn() -> Arc<dyn Component> + Send + Sync + 'static,
	{
		self.inner
			.lock()
			.factories
			.insert(name.into(), Arc::new(factory));
	}

	/// Runs the factory registered under `name`. Returns `None` (after a
	/// debug assert) when no factory matches. The lock is not held while the
	/// factory runs.
	pub fn create_component(&self, name: &str) -> Option<Arc<dyn Component>> {
		let factory = self.inner.lock().factories.get(name).cloned();

		let Some(factory) = factory else {
			logger::format(
				Level::Warning,
				format_args!("no component factory registered for \"{name}\""),
			);
			lantern_assert!(false, "missing component factory: {name}");
			return None;
		};

		let component = factory();
		lantern_assert!(
			component.component_name() == name,
			"component factory for \"{name}\" produced \"{}\"",
			component.component_name()
		);

		self.inner
			.lock()
			.instances
			.entry(name.to_owned())
			.or_default()
			.push(Arc::clone(&component));

		Some(component)
	}

	/// Releases the registry's reference to one created component.
	pub fn destroy_component(&self, component: &Arc<dyn Component>) {
		let mut inner = self.inner.lock();

		if let Some(bucket) = inner.instances.get_mut(component.component_name()) {
			if let Some(position) = bucket.iter().position(|c| Arc::ptr_eq(c, component)) {
				bucket.remove(position);
			}
		}
	}

	/// Drops every created component still held by the registry.
	pub fn clear_instances(&self) {
		self.inner.lock().instances.clear();
	}

	pub fn instance_count(&self, name: &str) -> usize {
		self.inner
			.lock()
			.instances
			.get(name)
			.map_or(0, Vec::len)
	}
}

// === Tests === //
