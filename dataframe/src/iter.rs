//! Lazy, memoized resolution of a dataframe's rows, with per-stream recycling.

use crate::ctx::StreamCtxId;
use crate::error::{PrefetchUnsupported, Status};
use crate::schema::{Dataframe, Value};

/// Steps through a [`Dataframe`]'s rows, resolving only the projected columns
/// (plus whatever non-projected parents those transitively depend on) and
/// recycling each row's values once the next step begins.
pub struct Iter<'a> {
    dataframe: &'a Dataframe,
    projection: Vec<usize>,
    idx: usize,
    cache: Vec<Option<(Value, StreamCtxId)>>,
}

impl<'a> Iter<'a> {
    pub(crate) fn new(dataframe: &'a Dataframe, projection: Vec<usize>) -> Self {
        let column_count = dataframe.column_count();
        Iter {
            dataframe,
            projection,
            idx: 0,
            cache: std::iter::repeat_with(|| None).take(column_count).collect(),
        }
    }

    #[must_use]
    pub fn row(&self) -> usize {
        self.idx
    }

    /// Recycles every occupied cache slot, returns its value to the pool
    /// under the stream-context identity it was produced with (not `stream_ctx`
    /// for this call — that would let a value escape to a stream it wasn't
    /// actually produced on), then, if there is a next row, resolves the first
    /// `k` projected columns for it.
    ///
    /// `k` may be less than the full projection length, resolving only a
    /// prefix of it this step.
    pub fn next_cols(&mut self, k: usize, stream_ctx: StreamCtxId) -> Status {
        assert!(k <= self.projection.len(), "k exceeds this iterator's projection size");
        self.recycle();

        if self.idx == self.dataframe.rows {
            return Status::EndOfStream;
        }

        for i in 0..k {
            let column = self.projection[i];
            self.ensure(column, self.idx, stream_ctx);
        }
        self.idx += 1;
        Status::Ok
    }

    /// Convenience for `next_cols` over the full projection.
    pub fn next(&mut self, stream_ctx: StreamCtxId) -> Status {
        self.next_cols(self.projection.len(), stream_ctx)
    }

    /// The value resolved for the `projected_index`-th entry of this
    /// iterator's projection, for the row most recently advanced to.
    ///
    /// # Panics
    /// Panics if that column hasn't been resolved this row (e.g. `k` passed
    /// to `next_cols` didn't reach it yet).
    #[must_use]
    pub fn value(&self, projected_index: usize) -> &Value {
        let column = self.projection[projected_index];
        self.cache[column]
            .as_ref()
            .map(|(value, _)| value)
            .expect("column not yet resolved for this row")
    }

    /// Reserved; prefetching is not supported by this core.
    pub fn prefetch(&self, _stream_ctx: StreamCtxId) -> Result<(), PrefetchUnsupported> {
        Err(PrefetchUnsupported)
    }

    fn recycle(&mut self) {
        let mut pool = self.dataframe.pool.borrow_mut();
        for (column, slot) in self.cache.iter_mut().enumerate() {
            if let Some((value, ctx)) = slot.take() {
                pool.push(ctx, column, value);
            }
        }
    }

    /// Ensures `cache[column]` holds a value for `row`, resolving parents
    /// first for a derived column. Every column is resolved at most once per
    /// row (memoized via `cache`); the DAG property (parents always have a
    /// strictly lower index) guarantees this recursion terminates.
    fn ensure(&mut self, column: usize, row: usize, stream_ctx: StreamCtxId) {
        if self.cache[column].is_some() {
            return;
        }

        let dataframe = self.dataframe;
        let mut slot = dataframe.pool.borrow_mut().take(stream_ctx, column);

        if column < dataframe.base.len() {
            (dataframe.base[column].enumerate)(row, &mut slot, stream_ctx);
        } else {
            let derived = &dataframe.derived[column - dataframe.base.len()];
            for &parent in &derived.parents {
                self.ensure(parent, row, stream_ctx);
            }
            let scratch: Vec<&Value> = derived
                .parents
                .iter()
                .map(|&parent| {
                    self.cache[parent]
                        .as_ref()
                        .map(|(value, _)| value)
                        .expect("parent was just resolved above")
                })
                .collect();
            (derived.map)(&scratch, &mut slot, stream_ctx);
        }

        let value = slot.expect("enumerator or map must produce a value");
        self.cache[column] = Some((value, stream_ctx));
    }
}

impl Drop for Iter<'_> {
    fn drop(&mut self) {
        self.recycle();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::BaseColumnSpec;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::EnvFilter;

    fn counted_enumerator(calls: Arc<AtomicUsize>, f: impl Fn(usize) -> i64 + Send + Sync + 'static) -> Box<crate::schema::Enumerator> {
        Box::new(move |row, slot, _ctx| {
            calls.fetch_add(1, Ordering::SeqCst);
            let value = f(row);
            match slot {
                Some(existing) => {
                    *existing.downcast_mut::<i64>().expect("column is always i64 in this test") = value;
                }
                None => *slot = Some(Box::new(value)),
            }
        })
    }

    fn get_i64(value: &Value) -> i64 {
        *value.downcast_ref::<i64>().unwrap()
    }

    #[test]
    fn single_base_column_five_rows() {
        let calls = Arc::new(AtomicUsize::new(0));
        let df = Dataframe::new(
            5,
            vec![BaseColumnSpec {
                enumerate: counted_enumerator(Arc::clone(&calls), |row| row as i64),
                deinit: None,
            }],
        );

        let mut iter = df.iter(vec![0]).unwrap();
        let mut seen = Vec::new();
        while iter.next(StreamCtxId::NONE) == Status::Ok {
            seen.push(get_i64(iter.value(0)));
        }
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
        drop(iter);
        assert_eq!(calls.load(Ordering::SeqCst), 5);

        // A second pass reuses the same slot recycled by the first iterator.
        let mut iter2 = df.iter(vec![0]).unwrap();
        let mut seen2 = Vec::new();
        while iter2.next(StreamCtxId::NONE) == Status::Ok {
            seen2.push(get_i64(iter2.value(0)));
        }
        assert_eq!(seen2, vec![0, 1, 2, 3, 4]);
        assert_eq!(calls.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn derived_column_sums_two_bases() {
        let _trace = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_thread_names(true)
            .set_default();

        let calls0 = Arc::new(AtomicUsize::new(0));
        let calls1 = Arc::new(AtomicUsize::new(0));
        let calls2 = Arc::new(AtomicUsize::new(0));

        let mut df = Dataframe::new(
            3,
            vec![
                BaseColumnSpec {
                    enumerate: counted_enumerator(Arc::clone(&calls0), |row| row as i64),
                    deinit: None,
                },
                BaseColumnSpec {
                    enumerate: counted_enumerator(Arc::clone(&calls1), |row| row as i64 * 10),
                    deinit: None,
                },
            ],
        );

        let calls2_clone = Arc::clone(&calls2);
        let col2 = df
            .map(
                vec![0, 1],
                move |parents, slot, _ctx| {
                    calls2_clone.fetch_add(1, Ordering::SeqCst);
                    let sum = get_i64(parents[0]) + get_i64(parents[1]);
                    *slot = Some(Box::new(sum));
                },
                None,
            )
            .unwrap();
        assert_eq!(col2, 2);

        let mut iter = df.iter(vec![2]).unwrap();
        let mut seen = Vec::new();
        while iter.next(StreamCtxId::NONE) == Status::Ok {
            seen.push(get_i64(iter.value(0)));
        }
        assert_eq!(seen, vec![0, 11, 22]);

        assert_eq!(calls0.load(Ordering::SeqCst), 3);
        assert_eq!(calls1.load(Ordering::SeqCst), 3);
        assert_eq!(calls2.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn pool_is_keyed_by_stream_context() {
        let df = Dataframe::new(
            1,
            vec![BaseColumnSpec {
                enumerate: counted_enumerator(Arc::new(AtomicUsize::new(0)), |row| row as i64),
                deinit: None,
            }],
        );

        let ctx_a = StreamCtxId::from_ptr(0x1000 as *const u8);
        let ctx_b = StreamCtxId::from_ptr(0x2000 as *const u8);

        let mut iter_a = df.iter(vec![0]).unwrap();
        assert_eq!(iter_a.next(ctx_a), Status::Ok);
        drop(iter_a);

        let mut iter_b = df.iter(vec![0]).unwrap();
        assert_eq!(iter_b.next(ctx_b), Status::Ok);
        drop(iter_b);

        assert_eq!(df.pool.borrow().len(ctx_a, 0), 1);
        assert_eq!(df.pool.borrow().len(ctx_b, 0), 1);

        // A fresh iterator under ctx_a only drains ctx_a's stack.
        let mut iter_a2 = df.iter(vec![0]).unwrap();
        assert_eq!(iter_a2.next(ctx_a), Status::Ok);
        drop(iter_a2);
        assert_eq!(df.pool.borrow().len(ctx_a, 0), 1);
        assert_eq!(df.pool.borrow().len(ctx_b, 0), 1);
    }

    #[test]
    fn empty_projection_is_rejected() {
        let df = Dataframe::new(
            1,
            vec![BaseColumnSpec {
                enumerate: counted_enumerator(Arc::new(AtomicUsize::new(0)), |row| row as i64),
                deinit: None,
            }],
        );
        assert_eq!(df.iter(vec![]).unwrap_err(), crate::error::Error::EmptyProjection);
    }

    #[test]
    fn prefetch_is_unsupported() {
        let df = Dataframe::new(
            1,
            vec![BaseColumnSpec {
                enumerate: counted_enumerator(Arc::new(AtomicUsize::new(0)), |row| row as i64),
                deinit: None,
            }],
        );
        let iter = df.iter(vec![0]).unwrap();
        assert!(iter.prefetch(StreamCtxId::NONE).is_err());
    }
}
