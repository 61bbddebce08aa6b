pub mod archive;
pub mod checkpoint;
pub mod context;
pub mod header;
pub mod job;
pub mod remote;
pub mod scanner;

/// Default to 4k bytes
pub const DEFAULT_BUFFER_SIZE: usize = 4096;
