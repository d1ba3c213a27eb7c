//! Wire types shared by the store, the gateway and the REST layer.

pub mod api;
pub mod events;
pub mod models;
