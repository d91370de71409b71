pub mod bucket;
pub mod upload;

pub use bucket::{sha256_hex, FilesystemBucket, ObjectMeta, ObjectStore};
pub use upload::{
    compute_directory_hash, normalize_relative_path, store_payload, validate_upload_payload,
    UploadEntry, UploadKind, UploadPayload, UploadSummary,
};
