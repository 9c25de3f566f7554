pub mod http_client;
pub mod lookup;
pub mod traits;

pub use http_client::HttpUpstream;
pub use lookup::{lookups_from_config, ReferenceKeys, StaticKeys};
pub use traits::{classify_status, FetchError, KeyLookup, PageRequest, PageResponse, Upstream};
