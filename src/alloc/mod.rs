pub mod attribution;
pub mod global;
pub mod header;
pub mod manual;
pub mod meta;
pub mod tracing;
pub mod tracing_alloc;
pub mod types;
