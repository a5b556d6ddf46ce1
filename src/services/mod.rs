pub mod aasx;
pub mod attachment;
pub mod blob;
pub mod environment;
pub mod hash;
pub mod package;

pub use attachment::AttachmentService;
pub use blob::BlobService;
pub use package::PackageService;
