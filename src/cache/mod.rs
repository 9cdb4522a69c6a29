//! In-process caching and the event bus that evicts it.
pub mod bus;
pub mod keyed;
pub mod ttl;

pub use bus::{Event, EventAction, EventBus, EvictSubscriber, ResourceKind};
pub use keyed::KeyedTtlCache;
pub use ttl::TtlCache;
