pub mod error;
pub mod io_channel;
pub mod options;

pub use error::{ExtError, Result};
pub use io_channel::{FileChannel, IoChannel, MemoryChannel, WriteKind, WriteRecord};
pub use options::OpenOptions;
