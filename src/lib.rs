pub mod application;
pub mod config;
pub mod domain;
pub mod infrastructure;

pub use application::{executor, gateway, registry};
pub use domain::types;
pub use infrastructure::{bridge, model, server, tool_server};
