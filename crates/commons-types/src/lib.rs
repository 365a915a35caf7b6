pub mod api;
pub mod delivery;
pub mod error;
pub mod events;
pub mod models;
