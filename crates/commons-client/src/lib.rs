//! Client side of the messaging service: a REST client, an explicit gateway
//! connection, and the local state machines that reconcile what both deliver.

pub mod connection;
pub mod error;
pub mod http;
pub mod reconciler;
pub mod typing;

pub use connection::GatewayConnection;
pub use error::{ClientError, ClientResult};
pub use http::ApiClient;
pub use reconciler::Reconciler;
