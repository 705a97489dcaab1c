pub mod factory;
pub mod handler;
pub mod list_watch;
pub mod shared;
pub mod source;

pub use factory::{InformerBuilder, InformerKey, SharedInformerFactory};
pub use handler::{EventHandlerFns, EventHandlerRegistration, ResourceEventHandler};
pub use list_watch::{Informer, InformerState};
pub use shared::SharedIndexInformer;
pub use source::{EventStream, ListerWatcher, ResourceEvent, WatchScope};
