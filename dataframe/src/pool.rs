//! Per-`(stream context, column)` recycling stacks.

use std::collections::HashMap;

use crate::ctx::StreamCtxId;
use crate::Value;

/// LIFO recycling stacks, keyed by stream-context identity and then by column.
///
/// Values are recycled under the stream-context identity they were *produced*
/// with, never the identity requesting a new one — preserving the ordering
/// invariant that a value is only reused once its production side effects
/// have settled on that same stream.
#[derive(Default)]
pub(crate) struct Pool {
    columns: usize,
    stacks: HashMap<StreamCtxId, Vec<Vec<Value>>>,
}

impl Pool {
    pub(crate) fn ensure_columns(&mut self, columns: usize) {
        if columns <= self.columns {
            return;
        }
        for stacks in self.stacks.values_mut() {
            stacks.resize_with(columns, Vec::new);
        }
        self.columns = columns;
    }

    pub(crate) fn take(&mut self, ctx: StreamCtxId, column: usize) -> Option<Value> {
        self.stacks.get_mut(&ctx)?.get_mut(column)?.pop()
    }

    pub(crate) fn push(&mut self, ctx: StreamCtxId, column: usize, value: Value) {
        let columns = self.columns.max(column + 1);
        self.columns = columns;
        let stacks = self
            .stacks
            .entry(ctx)
            .or_insert_with(|| Vec::from_iter(std::iter::repeat_with(Vec::new).take(columns)));
        if stacks.len() < columns {
            stacks.resize_with(columns, Vec::new);
        }
        stacks[column].push(value);
    }

    /// Counts the values currently parked for `(ctx, column)`. Test-only helper.
    #[cfg(test)]
    pub(crate) fn len(&self, ctx: StreamCtxId, column: usize) -> usize {
        self.stacks.get(&ctx).and_then(|s| s.get(column)).map_or(0, Vec::len)
    }

    /// Drains every value out of every stack, in no particular order, handing
    /// each to `on_value` along with the column it belonged to. Used by
    /// `Dataframe::drop` to run each column's deinit hook.
    pub(crate) fn drain_all(&mut self, mut on_value: impl FnMut(usize, Value)) {
        for (_ctx, stacks) in self.stacks.drain() {
            for (column, stack) in stacks.into_iter().enumerate() {
                for value in stack {
                    on_value(column, value);
                }
            }
        }
    }
}
