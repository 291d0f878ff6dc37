pub mod db;
pub mod error;
pub mod files;
pub mod manager;
pub mod queue_consumer;
pub mod thread;
pub mod types;

pub use error::MemoryError;
pub use files::FileStore;
pub use manager::MemoryManager;
pub use queue_consumer::{FileConsumer, MessageConsumer, QueuedFile};
pub use thread::ThreadCache;
pub use types::{
    FileKind, ForwardOrigin, ForwardOriginKind, Message, MessageRole, NewMessage, QuoteContext,
    ReplyContext, Thread, ThreadKey, UploadedFile, UserMemory,
};
