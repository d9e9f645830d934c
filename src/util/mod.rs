//! Utility modules

mod socket;
mod tracing_setup;

pub use socket::{create_tcp_listener, LISTEN_BACKLOG};
pub use tracing_setup::init_tracing;
