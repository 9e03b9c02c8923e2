mod api;
mod client;
mod in_memory;
mod redis_store;

pub use api::RegistryStore;
pub use api::StoreError;
pub use api::Subscription;
pub use client::server_key;
pub use client::transfer_key;
pub use client::EventSubscription;
pub use client::RegistryClient;
pub use client::SubscriptionEvent;
pub use client::EVENTS_CHANNEL;
pub use client::SERVER_KEY_PREFIX;
pub use in_memory::InMemoryStore;
pub use redis_store::RedisEndpoint;
pub use redis_store::RedisStore;
