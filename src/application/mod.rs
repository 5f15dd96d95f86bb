pub mod executor;
pub mod gateway;
pub mod registry;
