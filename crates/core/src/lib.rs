//! Client-side session core for a remote database management gateway.
//!
//! A [`Session`] wires the connection registry, schema cache, query session,
//! mutation coordinators, type-mapping previewer and export service to one
//! [`GatewayClient`] and one [`EventBus`]. Transport lives in adapter crates.

pub mod config;
pub mod connection_registry;
pub mod events;
pub mod export;
pub mod gateway;
pub mod model;
pub mod query_session;
pub mod row_mutation;
pub mod schema_cache;
pub mod schema_mutation;
pub mod session;
pub mod type_mapping;

#[cfg(test)]
mod test_support;

pub use config::{GatewaySettings, GroupDeletionPolicy, InvalidationPolicy, SessionConfig};
pub use events::{EventBus, SessionEvent};
pub use gateway::{Envelope, GatewayClient, GatewayError, GatewayRequest, Method, TransportError};
pub use session::Session;
