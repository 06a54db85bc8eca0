mod errors;
pub use errors::{MetadataError, Result};

mod store;
pub use store::{KeyValueVersion, MetadataStore};

mod watch;
pub use watch::{WatchEvent, WatchStream};

mod memory_store;
pub use memory_store::MemoryStore;
