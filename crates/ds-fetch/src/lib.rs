//! Resource fetcher seam: the only components allowed to perform external
//! I/O. Concrete scrapers live outside the engine; this crate defines the
//! contract they implement and the registry the executor dispatches through.

pub mod context;
pub mod fetcher;

pub use context::{FetchContext, FetchUpdate, ProgressSink};
pub use fetcher::{FetcherRegistry, ResourceFetcher};
