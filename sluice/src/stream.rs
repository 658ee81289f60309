//! Pull-based streaming query iterator.

use futures::Stream;
use tracing::warn;

use crate::{conn::RowCursor, error::DriverError, row::Row};

/// Single-consumer, pull-based iterator over a streamed result set.
///
/// Finite and not restartable. Rows are fetched only while a
/// [`try_next`](QueryStream::try_next) or [`peek`](QueryStream::peek) call
/// is outstanding, so the source never runs ahead of consumer demand beyond
/// the one-row look-ahead slot that `peek` fills. The `&mut self` receivers
/// make overlapping calls unrepresentable; the stream is a single-consumer
/// value, not a handle to share across tasks.
pub struct QueryStream<C: RowCursor> {
    cursor: Option<C>,
    peeked: Option<Row>,
}

impl<C: RowCursor> QueryStream<C> {
    pub(crate) fn new(cursor: C) -> Self {
        Self {
            cursor: Some(cursor),
            peeked: None,
        }
    }

    /// Fetch the next row.
    ///
    /// Returns `Ok(None)` once the result set is exhausted, after a driver
    /// error has been delivered, or after [`cancel`](QueryStream::cancel).
    /// A driver error is delivered exactly once, with its diagnostic code
    /// intact; the stream is terminal afterwards.
    pub async fn try_next(&mut self) -> Result<Option<Row>, DriverError> {
        if let Some(row) = self.peeked.take() {
            return Ok(Some(row));
        }
        let Some(cursor) = self.cursor.as_mut() else {
            return Ok(None);
        };
        match cursor.fetch_next().await {
            Ok(Some(row)) => Ok(Some(row)),
            Ok(None) => {
                self.close().await;
                Ok(None)
            }
            Err(error) => {
                self.close().await;
                Err(error)
            }
        }
    }

    /// Look at the next row without consuming it.
    ///
    /// Fills the one-row look-ahead slot; the following `try_next` drains
    /// the slot instead of touching the source.
    pub async fn peek(&mut self) -> Result<Option<&Row>, DriverError> {
        if self.peeked.is_none() {
            self.peeked = self.try_next().await?;
        }
        Ok(self.peeked.as_ref())
    }

    /// Stop the query early.
    ///
    /// Discards the look-ahead slot and closes the underlying cursor, which
    /// returns the borrowed connection; no rows are delivered afterwards.
    /// Calling it again, or after exhaustion, is a no-op. Close failures
    /// are secondary: logged, never surfaced.
    pub async fn cancel(&mut self) {
        self.peeked = None;
        self.close().await;
    }

    /// Whether the stream has reached a terminal state (exhausted, errored
    /// or cancelled, with no buffered row left to deliver).
    pub fn is_terminated(&self) -> bool {
        self.cursor.is_none() && self.peeked.is_none()
    }

    async fn close(&mut self) {
        if let Some(cursor) = self.cursor.take() {
            if let Err(error) = cursor.close().await {
                warn!(error = %error, "failed to close query stream");
            }
        }
    }

    /// Adapt into a `futures` [`Stream`] of rows.
    pub fn into_stream(self) -> impl Stream<Item = Result<Row, DriverError>> + Send
    where
        C: 'static,
    {
        futures::stream::unfold(self, |mut stream| async move {
            match stream.try_next().await {
                Ok(Some(row)) => Some((Ok(row), stream)),
                Ok(None) => None,
                Err(error) => Some((Err(error), stream)),
            }
        })
    }
}
