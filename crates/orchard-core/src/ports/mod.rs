//! Port traits — the narrow interfaces the engine is generic over.

pub mod remote;

pub use remote::{
    MutationReceipt, RemoteAdapter, RemoteChild, RemoteError, RemoteMetadata, UploadResult,
};
