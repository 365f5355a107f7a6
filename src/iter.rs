//! Pull-based iteration over a cursor with guaranteed cleanup.

use crate::column::Projection;
use crate::driver::{Cursor, Row};
use crate::error::Error;
use tokio_util::sync::CancellationToken;

/// Lifecycle of a [`RowIter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IterState {
    /// No row has been requested; options may still change.
    Created,
    /// At least one row was requested; options are frozen.
    Started,
    /// The cursor ran out of rows.
    Exhausted,
    /// Closed before exhaustion, explicitly or because of an error.
    Closed,
}

type Finalizer<'a> = Box<dyn FnOnce() -> crate::Result<()> + 'a>;
type Transform<'a> = Box<dyn FnMut(Row) -> crate::Result<Row> + 'a>;

/// Iterates the rows of a cursor, projecting each one.
///
/// The cursor is closed and the finalizer runs exactly once, on whichever of these
/// happens first: the cursor is exhausted, [`close`](Self::close) is called, an
/// error escapes row production, a cancellation is observed, or the iterator is
/// dropped.
pub struct RowIter<'a, C>
where
    C: Cursor,
{
    cursor: C,
    projection: Projection,
    transform: Option<Transform<'a>>,
    finalizer: Option<Finalizer<'a>>,
    skip_nulls: bool,
    cancel: Option<CancellationToken>,
    state: IterState,
    peeked: Option<Row>,
    released: bool,
}

impl<'a, C> RowIter<'a, C>
where
    C: Cursor,
{
    pub fn new(cursor: C, projection: Projection) -> Self {
        Self {
            cursor,
            projection,
            transform: None,
            finalizer: None,
            skip_nulls: false,
            cancel: None,
            state: IterState::Created,
            peeked: None,
            released: false,
        }
    }

    pub fn state(&self) -> IterState {
        self.state
    }

    fn ensure_created(&self, option: &str) -> crate::Result<()> {
        match self.state {
            IterState::Created => Ok(()),
            state => Err(Error::Usage(format!(
                "cannot change {option} once iteration has begun (state {state:?})"
            ))),
        }
    }

    /// Skip rows whose (transformed) projection is entirely null.
    pub fn set_skip_nulls(&mut self, skip: bool) -> crate::Result<()> {
        self.ensure_created("null skipping")?;
        self.skip_nulls = skip;
        Ok(())
    }

    /// Applies `transform` to every projected row.
    pub fn set_transform<F>(&mut self, transform: F) -> crate::Result<()>
    where
        F: FnMut(Row) -> crate::Result<Row> + 'a,
    {
        self.ensure_created("the row transform")?;
        self.transform = Some(Box::new(transform));
        Ok(())
    }

    /// Runs `finalizer` once when iteration ends, after the cursor is closed.
    pub fn set_finalizer<F>(&mut self, finalizer: F) -> crate::Result<()>
    where
        F: FnOnce() -> crate::Result<()> + 'a,
    {
        self.ensure_created("the finalizer")?;
        self.finalizer = Some(Box::new(finalizer));
        Ok(())
    }

    /// Checks `token` before every row is pulled.
    pub fn set_cancel_token(&mut self, token: CancellationToken) -> crate::Result<()> {
        self.ensure_created("the cancellation token")?;
        self.cancel = Some(token);
        Ok(())
    }

    pub fn has_next(&mut self) -> crate::Result<bool> {
        self.fill()
    }

    pub fn next_row(&mut self) -> crate::Result<Option<Row>> {
        self.fill()?;
        Ok(self.peeked.take())
    }

    /// Ends iteration early. Safe to call more than once.
    pub fn close(&mut self) -> crate::Result<()> {
        self.peeked = None;
        if self.state != IterState::Exhausted {
            self.state = IterState::Closed;
        }
        self.release()
    }

    fn fill(&mut self) -> crate::Result<bool> {
        if self.peeked.is_some() {
            return Ok(true);
        }
        match self.state {
            IterState::Exhausted | IterState::Closed => return Ok(false),
            IterState::Created => self.state = IterState::Started,
            IterState::Started => {}
        }
        loop {
            if self.cancel.as_ref().is_some_and(CancellationToken::is_cancelled) {
                self.abort();
                return Err(Error::Cancelled);
            }
            let row = match self.produce() {
                Ok(Some(row)) => row,
                Ok(None) => {
                    self.state = IterState::Exhausted;
                    self.release()?;
                    return Ok(false);
                }
                Err(err) => {
                    self.abort();
                    return Err(err);
                }
            };
            if self.skip_nulls && row.is_null() {
                continue;
            }
            self.peeked = Some(row);
            return Ok(true);
        }
    }

    fn produce(&mut self) -> crate::Result<Option<Row>> {
        let Some(raw) = self.cursor.next_row()? else {
            return Ok(None);
        };
        let row = self.projection.apply(raw)?;
        match self.transform.as_mut() {
            Some(transform) => transform(row).map(Some),
            None => Ok(Some(row)),
        }
    }

    /// Closes the cursor, then runs the finalizer. Returns the first error.
    fn release(&mut self) -> crate::Result<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        let closed = self.cursor.close();
        let finalized = match self.finalizer.take() {
            Some(finalizer) => finalizer(),
            None => Ok(()),
        };
        closed.and(finalized)
    }

    fn abort(&mut self) {
        self.state = IterState::Closed;
        self.peeked = None;
        if let Err(err) = self.release() {
            tracing::warn!(error = %err, "cleanup after failed iteration");
        }
    }
}

impl<C> Iterator for RowIter<'_, C>
where
    C: Cursor,
{
    type Item = crate::Result<Row>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_row().transpose()
    }
}

impl<C> Drop for RowIter<'_, C>
where
    C: Cursor,
{
    fn drop(&mut self) {
        if let Err(err) = self.release() {
            tracing::warn!(error = %err, "cleanup of dropped row iterator");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::column::ColumnConfig;
    use crate::driver::{Connection, Statement};
    use crate::memory::{MemoryCursor, MemoryProvider, Resource};
    use crate::provider::ConnectionProvider;
    use crate::value::Value;
    use std::cell::Cell;

    const SQL: &str = "select v from t";

    fn cursor_over(provider: &MemoryProvider) -> MemoryCursor {
        let mut conn = provider.open().unwrap();
        let mut stmt = conn.prepare(SQL).unwrap();
        stmt.query().unwrap()
    }

    fn values(items: &[Option<i32>]) -> Vec<Vec<Value>> {
        items.iter().map(|v| vec![Value::from(*v)]).collect()
    }

    #[test]
    fn test_exhaustion_runs_finalizer_once() {
        let provider = MemoryProvider::new();
        provider.on_query(SQL, &["v"], values(&[Some(1), Some(2), Some(3)]));
        let runs = Cell::new(0);
        let mut iter = RowIter::new(cursor_over(&provider), Projection::Raw);
        iter.set_finalizer(|| {
            runs.set(runs.get() + 1);
            Ok(())
        })
        .unwrap();

        for expected in 1..=3 {
            let row = iter.next_row().unwrap().unwrap();
            assert_eq!(row.get("v"), Some(&Value::Int(expected)));
        }
        assert_eq!(runs.get(), 0);
        assert!(!iter.has_next().unwrap());
        assert_eq!(iter.state(), IterState::Exhausted);
        assert_eq!(runs.get(), 1);
        assert!(!iter.has_next().unwrap());
        iter.close().unwrap();
        drop(iter);
        assert_eq!(runs.get(), 1);
        assert_eq!(provider.closes(), vec![Resource::Cursor]);
    }

    #[test]
    fn test_has_next_does_not_consume() {
        let provider = MemoryProvider::new();
        provider.on_query(SQL, &["v"], values(&[Some(1), Some(2)]));
        let mut iter = RowIter::new(cursor_over(&provider), Projection::Raw);
        assert!(iter.has_next().unwrap());
        assert!(iter.has_next().unwrap());
        assert_eq!(provider.rows_read(), 1);
        let rows: Vec<_> = iter.by_ref().collect::<crate::Result<_>>().unwrap();
        assert_eq!(rows.len(), 2);
    }

    #[test]
    fn test_close_before_exhaustion() {
        let provider = MemoryProvider::new();
        provider.on_query(SQL, &["v"], values(&[Some(1), Some(2)]));
        let runs = Cell::new(0);
        let mut iter = RowIter::new(cursor_over(&provider), Projection::Raw);
        iter.set_finalizer(|| {
            runs.set(runs.get() + 1);
            Ok(())
        })
        .unwrap();
        iter.next_row().unwrap();
        iter.close().unwrap();
        iter.close().unwrap();
        assert_eq!(iter.state(), IterState::Closed);
        assert!(iter.next_row().unwrap().is_none());
        drop(iter);
        assert_eq!(runs.get(), 1);
        assert_eq!(provider.rows_read(), 1);
    }

    #[test]
    fn test_drop_runs_finalizer() {
        let provider = MemoryProvider::new();
        provider.on_query(SQL, &["v"], values(&[Some(1)]));
        let runs = Cell::new(0);
        {
            let mut iter = RowIter::new(cursor_over(&provider), Projection::Raw);
            iter.set_finalizer(|| {
                runs.set(runs.get() + 1);
                Ok(())
            })
            .unwrap();
        }
        assert_eq!(runs.get(), 1);
        assert_eq!(provider.closes(), vec![Resource::Cursor]);
    }

    #[test]
    fn test_options_freeze_after_start() {
        let provider = MemoryProvider::new();
        provider.on_query(SQL, &["v"], values(&[Some(1)]));
        let mut iter = RowIter::new(cursor_over(&provider), Projection::Raw);
        iter.set_skip_nulls(true).unwrap();
        iter.has_next().unwrap();
        assert!(matches!(iter.set_skip_nulls(false), Err(Error::Usage(_))));
        assert!(matches!(iter.set_finalizer(|| Ok(())), Err(Error::Usage(_))));
    }

    #[test]
    fn test_skip_nulls_transforms_each_row_once() {
        let provider = MemoryProvider::new();
        provider.on_query(SQL, &["v"], values(&[None, Some(1), None, None, Some(2), None]));
        let transformed = Cell::new(0);
        let mut iter = RowIter::new(cursor_over(&provider), Projection::Raw);
        iter.set_skip_nulls(true).unwrap();
        iter.set_transform(|row| {
            transformed.set(transformed.get() + 1);
            Ok(row)
        })
        .unwrap();

        assert!(iter.has_next().unwrap());
        assert!(iter.has_next().unwrap());
        assert_eq!(iter.next_row().unwrap().unwrap().get("v"), Some(&Value::Int(1)));
        assert_eq!(iter.next_row().unwrap().unwrap().get("v"), Some(&Value::Int(2)));
        assert!(iter.next_row().unwrap().is_none());
        assert_eq!(transformed.get(), 6);
    }

    #[test]
    fn test_nulls_are_visible_without_skipping() {
        let provider = MemoryProvider::new();
        provider.on_query(SQL, &["v"], values(&[None, Some(1)]));
        let iter = RowIter::new(cursor_over(&provider), Projection::Raw);
        assert_eq!(iter.count(), 2);
    }

    #[test]
    fn test_projection_error_closes_and_finalizes() {
        let provider = MemoryProvider::new();
        provider.on_query(SQL, &["v"], vec![vec![Value::from("1")], vec![Value::from("x")]]);
        let runs = Cell::new(0);
        let projection = Projection::from_configs(vec![ColumnConfig::new("v:long").unwrap()]);
        let mut iter = RowIter::new(cursor_over(&provider), projection);
        iter.set_finalizer(|| {
            runs.set(runs.get() + 1);
            Ok(())
        })
        .unwrap();
        assert_eq!(iter.next_row().unwrap().unwrap().get("v"), Some(&Value::Long(1)));
        assert!(matches!(iter.next_row(), Err(Error::Extract { .. })));
        assert_eq!(runs.get(), 1);
        assert_eq!(iter.state(), IterState::Closed);
        assert!(iter.next_row().unwrap().is_none());
    }

    #[test]
    fn test_cursor_error_closes_and_finalizes() {
        let provider = MemoryProvider::new();
        provider.on_query_failing_at(SQL, &["v"], values(&[Some(1), Some(2)]), 1);
        let runs = Cell::new(0);
        let mut iter = RowIter::new(cursor_over(&provider), Projection::Raw);
        iter.set_finalizer(|| {
            runs.set(runs.get() + 1);
            Ok(())
        })
        .unwrap();
        let results: Vec<_> = iter.by_ref().collect();
        assert_eq!(results.len(), 2);
        assert!(results[0].is_ok());
        assert!(matches!(results[1], Err(Error::Driver(_))));
        assert_eq!(runs.get(), 1);
        assert_eq!(provider.closes(), vec![Resource::Cursor]);
    }

    #[test]
    fn test_cancellation_between_rows() {
        let provider = MemoryProvider::new();
        provider.on_query(SQL, &["v"], values(&[Some(1), Some(2), Some(3)]));
        let token = CancellationToken::new();
        let runs = Cell::new(0);
        let mut iter = RowIter::new(cursor_over(&provider), Projection::Raw);
        iter.set_cancel_token(token.clone()).unwrap();
        iter.set_finalizer(|| {
            runs.set(runs.get() + 1);
            Ok(())
        })
        .unwrap();
        iter.next_row().unwrap();
        token.cancel();
        assert!(matches!(iter.next_row(), Err(Error::Cancelled)));
        assert_eq!(runs.get(), 1);
        assert_eq!(provider.rows_read(), 1);
    }

    #[test]
    fn test_finalizer_error_surfaces_on_close() {
        let provider = MemoryProvider::new();
        provider.on_query(SQL, &["v"], values(&[Some(1)]));
        let mut iter = RowIter::new(cursor_over(&provider), Projection::Raw);
        iter.set_finalizer(|| Err(Error::Connection("close failed".into())))
            .unwrap();
        assert!(matches!(iter.close(), Err(Error::Connection(_))));
        assert!(iter.close().is_ok());
    }
}
