pub mod area;
pub mod boxed;
pub mod ledger;

pub use area::MemoryArea;
pub use boxed::{AreaBox, AreaVec};
pub use ledger::{AllocationRecord, MemoryConfig, MemoryError, MemoryManager};
