// ABOUTME: Core library for quill, containing keys, revisions, records, codec and errors.
// ABOUTME: This crate defines the shared data model used by every backend and the cache.

pub mod codec;
pub mod error;
pub mod key;
pub mod record;

pub use codec::{DocumentError, DocumentFormat, Envelope, decode, decode_document, encode, encode_document};
pub use error::{FlushFailure, StorageError};
pub use key::{EntityKey, EntityType};
pub use record::{Record, Revision, Versioned};
