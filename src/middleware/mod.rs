//! HTTP admission middleware and a server that runs it.

mod layer;
mod server;
mod service;

pub use layer::{GovernorLayer, DEFAULT_IDENTITY_HEADER};
pub use server::{spawn_sweeper, GovernorServer};
pub use service::GovernorService;
