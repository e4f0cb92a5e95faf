pub mod events;
pub mod registry;
pub mod runtime;

pub use events::{Event, EventBus, EventHandler, LoggingHandler};
pub use registry::{ModelSlotRegistry, RegistryBuilder, SlotStateKind, SlotStatus};
pub use runtime::{GenerationStream, ModelRuntime, StreamEvent};
