//! The dataframe itself: row count, base and derived column schema, and the
//! shared recycling pool all iterators over it draw from.

use std::any::Any;
use std::cell::RefCell;

use tracing::trace;

use crate::error::Error;
use crate::iter::Iter;
use crate::pool::Pool;

/// A type-erased column value. Columns may hold arbitrary owned data (a heap
/// int, a tensor, a batch of strings); the dataframe never inspects it, only
/// moves it between cache slots, the recycling pool, and `deinit`.
pub type Value = Box<dyn Any + Send>;

use crate::ctx::StreamCtxId;

/// Produces the value for a base column at `row`, given an in/out slot that
/// may already hold a recycled value to reuse.
pub type Enumerator = dyn Fn(usize, &mut Option<Value>, StreamCtxId) + Send + Sync;

/// Produces a derived column's value from its already-resolved parent values.
pub type Map = dyn Fn(&[&Value], &mut Option<Value>, StreamCtxId) + Send + Sync;

/// Releases every resource a column value owns.
pub type Deinit = dyn Fn(Value) + Send + Sync;

pub(crate) struct BaseColumn {
    pub(crate) enumerate: Box<Enumerator>,
    pub(crate) deinit: Option<Box<Deinit>>,
}

pub(crate) struct DerivedColumn {
    pub(crate) parents: Vec<usize>,
    pub(crate) map: Box<Map>,
    pub(crate) deinit: Option<Box<Deinit>>,
}

/// Specification for one base column, supplied at [`Dataframe::new`] time.
pub struct BaseColumnSpec {
    pub enumerate: Box<Enumerator>,
    pub deinit: Option<Box<Deinit>>,
}

/// A row-indexed, column-addressable dataset with lazily-resolved derived
/// columns and a per-stream recycling pool.
///
/// Columns live in one flat index space `[0, B+D)`: base columns first, then
/// derived columns in the order they were added. A derived column may only
/// name parents with strictly lower indices, which are fixed at construction
/// time, so the dependency graph is a DAG by construction.
pub struct Dataframe {
    pub(crate) rows: usize,
    pub(crate) base: Vec<BaseColumn>,
    pub(crate) derived: Vec<DerivedColumn>,
    pub(crate) pool: RefCell<Pool>,
}

impl Dataframe {
    /// Creates a dataframe with `rows` rows and the given base columns.
    ///
    /// # Panics
    /// Panics if `base_columns` is empty.
    #[must_use]
    pub fn new(rows: usize, base_columns: Vec<BaseColumnSpec>) -> Self {
        assert!(!base_columns.is_empty(), "a dataframe needs at least one base column");
        let base: Vec<BaseColumn> = base_columns
            .into_iter()
            .map(|spec| BaseColumn {
                enumerate: spec.enumerate,
                deinit: spec.deinit,
            })
            .collect();
        let mut pool = Pool::default();
        pool.ensure_columns(base.len());
        Dataframe {
            rows,
            base,
            derived: Vec::new(),
            pool: RefCell::new(pool),
        }
    }

    #[must_use]
    pub fn rows(&self) -> usize {
        self.rows
    }

    #[must_use]
    pub fn column_count(&self) -> usize {
        self.base.len() + self.derived.len()
    }

    /// Appends a derived column that maps over `parents`' resolved values.
    ///
    /// Returns the new column's index. Every entry of `parents` must already
    /// be a valid column index (base or previously-added derived), enforcing
    /// the DAG by construction order.
    pub fn map(
        &mut self,
        parents: Vec<usize>,
        map_fn: impl Fn(&[&Value], &mut Option<Value>, StreamCtxId) + Send + Sync + 'static,
        deinit: Option<Box<Deinit>>,
    ) -> Result<usize, Error> {
        let column_count = self.column_count();
        if let Some(&bad) = parents.iter().find(|&&p| p >= column_count) {
            return Err(Error::InvalidParentColumn {
                index: bad,
                column_count,
            });
        }
        self.derived.push(DerivedColumn {
            parents,
            map: Box::new(map_fn),
            deinit,
        });
        let idx = column_count;
        self.pool.borrow_mut().ensure_columns(column_count + 1);
        trace!(column = idx, "derived column added");
        Ok(idx)
    }

    /// Creates an iterator over `projection`, a (non-empty) selection of
    /// column indices to resolve on each step.
    ///
    /// Cache slots are allocated for *every* column, not only projected ones:
    /// a derived column may traverse non-projected parents to compute its
    /// value.
    pub fn iter(&self, projection: Vec<usize>) -> Result<Iter<'_>, Error> {
        if projection.is_empty() {
            return Err(Error::EmptyProjection);
        }
        let column_count = self.column_count();
        if let Some(&bad) = projection.iter().find(|&&c| c >= column_count) {
            return Err(Error::ColumnOutOfRange {
                index: bad,
                column_count,
            });
        }
        Ok(Iter::new(self, projection))
    }
}

impl Drop for Dataframe {
    fn drop(&mut self) {
        let base_len = self.base.len();
        let base = std::mem::take(&mut self.base);
        let derived = std::mem::take(&mut self.derived);
        self.pool.get_mut().drain_all(|column, value| {
            let deinit = if column < base_len {
                base[column].deinit.as_ref()
            } else {
                derived[column - base_len].deinit.as_ref()
            };
            if let Some(deinit) = deinit {
                deinit(value);
            }
        });
        trace!("dataframe dropped");
    }
}
