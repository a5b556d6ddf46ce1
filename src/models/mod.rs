pub mod attachment;
pub mod blob;
pub mod package;
pub mod page;

pub use attachment::*;
pub use blob::*;
pub use package::*;
pub use page::*;
