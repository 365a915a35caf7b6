pub mod conversations;
pub mod error;
pub mod messages;
pub mod messenger;
pub mod middleware;
pub mod profiles;
pub mod reactions;
pub mod receipts;
pub mod routes;
pub mod state;
pub mod typing;

pub use messenger::Messenger;
pub use routes::router;
pub use state::{AppState, AppStateInner};
