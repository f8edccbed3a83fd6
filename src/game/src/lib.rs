//! Entity/component runtime: an identifier-keyed registry of entities, each
//! owning a per-entity event queue and an ordered list of named components,
//! with broadcast/targeted routing and deferred destruction driven by a
//! single dispatch tick.

pub mod component;
pub mod entity;
pub mod events;
pub mod manager;

#[cfg(test)]
pub(crate) mod test_util {
	use std::sync::Once;

	use lantern_system::mem::MemoryConfig;

	/// Tests share the process-wide memory manager; size the arenas so
	/// concurrently running tests never starve each other.
	pub fn init_runtime() {
		static ONCE: Once = Once::new();

		ONCE.call_once(|| {
			const KB: usize = 1024;

			let _ = lantern_system::initialize_with(MemoryConfig {
				area_capacities: [16 * KB, 16 * KB, 64 * KB, 256 * KB, 64 * KB],
				ledger_capacity: 4096,
			});
		});
	}
}

pub mod prelude {
	pub use crate::{
		component::{Component, ComponentManager},
		entity::{Entity, EntityHandle},
		events::{OnDestroy, OnStart, OnUpdate},
		manager::EntityManager,
	};
}
