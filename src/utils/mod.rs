pub mod command;
pub mod fastx;
pub mod fetch;
pub mod file;
pub mod layout;
pub mod probe;
pub mod retention;
pub mod system;
