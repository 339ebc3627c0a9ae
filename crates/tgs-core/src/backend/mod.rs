//! Chat backend abstraction (Telegram today; any bot API that can store a file in a
//! channel and hand it back later fits behind the same port).

pub mod memory;
pub mod port;
pub mod throttled;

pub use port::{read_capped, BackendError, ByteStream, ChatBackend, FetchedObject, MAX_UPLOAD_BYTES};
