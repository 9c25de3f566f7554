pub mod file;
pub mod traits;

pub use file::FileLanding;
pub use traits::{LandedRecord, LandingHeader, RawLanding, RawRecord, SourceRef};
