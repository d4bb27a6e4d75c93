//! A row-indexed, column-addressable dataframe with lazily-resolved derived
//! columns and a recycling pool keyed by stream-context identity.
//!
//! Base columns are produced by an `enumerator`; derived columns `map` over
//! already-resolved parent columns, chosen so the dependency graph is a DAG by
//! construction. An [`iter::Iter`] resolves each row's projected columns at
//! most once (memoized per step) and hands finished values back to the pool
//! as soon as the next row is requested, so repeated iteration over the same
//! dataframe and stream context reuses the same value allocations.

mod ctx;
mod error;
mod iter;
mod pool;
mod schema;

pub use ctx::StreamCtxId;
pub use error::{Error, PrefetchUnsupported, Status};
pub use iter::Iter;
pub use schema::{BaseColumnSpec, Dataframe, Deinit, Enumerator, Map, Value};
