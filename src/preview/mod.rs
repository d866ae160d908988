//! On-disk preview thumbnails
//!
//! This module handles:
//! - The fixed-header RGB555 preview format (codec.rs)
//! - Transactional temp-file-then-rename writes (writer.rs)
//! - Named preview lookup with an in-memory front cache (store.rs)

pub mod codec;
pub mod store;
pub mod writer;

pub use codec::{PreviewCodec, PreviewHeader, HEADER_LEN, PREVIEW_MAGIC};
pub use store::PreviewStore;
pub use writer::{AtomicFileWriter, StagedFile, TransactionalWriter};
