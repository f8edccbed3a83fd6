//! Built-in lifecycle events posted by the entity registry.

/// Posted on an entity immediately after creation.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct OnStart;

/// Posted on an entity when its destruction is requested; delivered before
/// the entity leaves the registry.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct OnDestroy;

/// Per-tick update carrying the elapsed time.
#[derive(Debug, Copy, Clone, Default, PartialEq)]
pub struct OnUpdate {
	pub delta_time: f64,
}

// === Tests === //
