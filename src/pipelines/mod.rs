pub mod aggregate;
pub mod resources;
pub mod sample;
pub mod scheduler;
