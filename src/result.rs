//! Uniform materialization of row-sets and mutation outcomes.

use rusqlite::types::{Value, ValueRef};
use rusqlite::{Statement, params_from_iter};
use std::collections::HashMap;
use tokio::sync::mpsc;

use crate::{Error, Result};

/// One materialized row: column name to its text value.
///
/// SQL NULL materializes as an empty string, so NULL and `''` cannot be
/// told apart here.
pub type Row = HashMap<String, String>;

/// Raw cells of one row, `None` for SQL NULL.
pub(crate) type Cells = Vec<Option<String>>;

/// What a query producer hands to a [`Cursor`].
#[derive(Debug)]
pub(crate) enum Frame {
    Columns(Vec<String>),
    Row(Cells),
    Failed(rusqlite::Error),
}

fn decode_value(value: ValueRef<'_>) -> Option<String> {
    match value {
        ValueRef::Null => None,
        ValueRef::Integer(i) => Some(i.to_string()),
        ValueRef::Real(f) => Some(f.to_string()),
        ValueRef::Text(t) => Some(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Some(String::from_utf8_lossy(b).into_owned()),
    }
}

fn decode_row(row: &rusqlite::Row<'_>, width: usize) -> rusqlite::Result<Cells> {
    (0..width).map(|i| row.get_ref(i).map(decode_value)).collect()
}

/// Run a prepared statement and feed its frames to `emit`.
///
/// Binding errors and errors from stepping the first row are returned
/// before any frame is emitted, so callers can fail the query itself.
/// Later step errors are emitted as [`Frame::Failed`]. Scanning stops as
/// soon as `emit` returns false.
pub(crate) fn scan_statement<F>(stmt: &mut Statement<'_>, args: &[Value], mut emit: F) -> rusqlite::Result<()>
where
    F: FnMut(Frame) -> bool,
{
    let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
    let width = columns.len();

    let mut rows = stmt.query(params_from_iter(args.iter()))?;
    let first = match rows.next()? {
        Some(row) => Some(decode_row(row, width)?),
        None => None,
    };

    if !emit(Frame::Columns(columns)) {
        return Ok(());
    }
    match first {
        Some(cells) => {
            if !emit(Frame::Row(cells)) {
                return Ok(());
            }
        }
        None => return Ok(()),
    }

    loop {
        let cells = match rows.next() {
            Ok(Some(row)) => decode_row(row, width),
            Ok(None) => return Ok(()),
            Err(e) => Err(e),
        };
        match cells {
            Ok(cells) => {
                if !emit(Frame::Row(cells)) {
                    return Ok(());
                }
            }
            Err(e) => {
                emit(Frame::Failed(e));
                return Ok(());
            }
        }
    }
}

/// Run `stmt` to completion and keep every row in memory.
pub(crate) fn collect_statement(stmt: &mut Statement<'_>, args: &[Value]) -> rusqlite::Result<Cursor> {
    let mut columns = Vec::new();
    let mut rows = Vec::new();
    let mut failure = None;

    scan_statement(stmt, args, |frame| {
        match frame {
            Frame::Columns(c) => columns = c,
            Frame::Row(cells) => rows.push(cells),
            Frame::Failed(e) => failure = Some(e),
        }
        true
    })?;

    match failure {
        Some(e) => Err(e),
        None => Ok(Cursor::buffered(columns, rows)),
    }
}

#[derive(Debug)]
enum Source {
    Stream(mpsc::Receiver<Frame>),
    Buffered(std::vec::IntoIter<Cells>),
    Closed,
}

/// Row cursor behind a row-set [`QueryResult`].
///
/// A streamed cursor is fed by a blocking task that owns the pooled
/// connection; closing the cursor drops the receiver, which stops that task
/// and returns the connection to its pool.
#[derive(Debug)]
pub(crate) struct Cursor {
    columns: Vec<String>,
    source: Source,
}

impl Cursor {
    pub(crate) fn streaming(columns: Vec<String>, rx: mpsc::Receiver<Frame>) -> Self {
        Self {
            columns,
            source: Source::Stream(rx),
        }
    }

    pub(crate) fn buffered(columns: Vec<String>, rows: Vec<Cells>) -> Self {
        Self {
            columns,
            source: Source::Buffered(rows.into_iter()),
        }
    }

    fn columns(&self) -> &[String] {
        &self.columns
    }

    fn is_closed(&self) -> bool {
        matches!(self.source, Source::Closed)
    }

    async fn next(&mut self) -> Result<Option<Cells>> {
        loop {
            let frame = match &mut self.source {
                Source::Closed => return Ok(None),
                Source::Buffered(rows) => rows.next().map(Frame::Row),
                Source::Stream(rx) => rx.recv().await,
            };
            match frame {
                Some(Frame::Row(cells)) => return Ok(Some(cells)),
                Some(Frame::Columns(_)) => continue,
                Some(Frame::Failed(e)) => {
                    self.close();
                    return Err(e.into());
                }
                None => {
                    self.close();
                    return Ok(None);
                }
            }
        }
    }

    fn close(&mut self) {
        self.source = Source::Closed;
    }

    fn materialize(&self, cells: Cells) -> Row {
        self.columns
            .iter()
            .cloned()
            .zip(cells.into_iter().map(Option::unwrap_or_default))
            .collect()
    }
}

#[derive(Debug, Clone, Copy)]
struct MutationOutcome {
    rows_affected: u64,
    last_insert_id: i64,
}

#[derive(Debug)]
enum Kind {
    RowSet(Cursor),
    Mutation(MutationOutcome),
}

/// Outcome of one query or exec call.
///
/// Holds either a row-set or a mutation outcome, never both, and remembers
/// which database served the call.
#[derive(Debug)]
pub struct QueryResult {
    hit: String,
    kind: Kind,
}

impl QueryResult {
    pub(crate) fn from_rows(hit: impl Into<String>, cursor: Cursor) -> Self {
        Self {
            hit: hit.into(),
            kind: Kind::RowSet(cursor),
        }
    }

    pub(crate) fn from_outcome(hit: impl Into<String>, rows_affected: u64, last_insert_id: i64) -> Self {
        Self {
            hit: hit.into(),
            kind: Kind::Mutation(MutationOutcome {
                rows_affected,
                last_insert_id,
            }),
        }
    }

    /// Id of the database that produced this result.
    pub fn hit(&self) -> &str {
        &self.hit
    }

    pub fn is_row_set(&self) -> bool {
        matches!(self.kind, Kind::RowSet(_))
    }

    /// Column names of a row-set, empty for a mutation outcome.
    pub fn columns(&self) -> &[String] {
        match &self.kind {
            Kind::RowSet(cursor) => cursor.columns(),
            Kind::Mutation(_) => &[],
        }
    }

    /// True once the row cursor has been closed or exhausted.
    pub fn is_consumed(&self) -> bool {
        match &self.kind {
            Kind::RowSet(cursor) => cursor.is_closed(),
            Kind::Mutation(_) => true,
        }
    }

    /// First row of the set.
    ///
    /// The cursor is closed right after the first row is read, releasing
    /// the connection even if more rows remain. A mutation outcome or an
    /// already consumed cursor yields an empty row.
    pub async fn row(&mut self) -> Result<Row> {
        let cursor = match &mut self.kind {
            Kind::Mutation(_) => return Ok(Row::new()),
            Kind::RowSet(cursor) => cursor,
        };
        if cursor.columns().is_empty() {
            return Err(Error::NoColumnsFound);
        }

        let first = cursor.next().await;
        cursor.close();

        Ok(match first? {
            Some(cells) => cursor.materialize(cells),
            None => Row::new(),
        })
    }

    /// Every remaining row, in cursor order.
    ///
    /// A mutation outcome or an already consumed cursor yields no rows.
    pub async fn rows(&mut self) -> Result<Vec<Row>> {
        let cursor = match &mut self.kind {
            Kind::Mutation(_) => return Ok(Vec::new()),
            Kind::RowSet(cursor) => cursor,
        };
        if cursor.columns().is_empty() {
            return Err(Error::NoColumnsFound);
        }

        let mut rows = Vec::new();
        while let Some(cells) = cursor.next().await? {
            rows.push(cursor.materialize(cells));
        }
        Ok(rows)
    }

    /// Release the row cursor without reading further.
    pub fn close(&mut self) {
        if let Kind::RowSet(cursor) = &mut self.kind {
            cursor.close();
        }
    }

    pub fn rows_affected(&self) -> Result<u64> {
        match &self.kind {
            Kind::Mutation(outcome) => Ok(outcome.rows_affected),
            Kind::RowSet(_) => Err(Error::NoMutationOutcome),
        }
    }

    /// Rowid of the last row inserted through the serving connection.
    pub fn last_insert_id(&self) -> Result<i64> {
        match &self.kind {
            Kind::Mutation(outcome) => Ok(outcome.last_insert_id),
            Kind::RowSet(_) => Err(Error::NoMutationOutcome),
        }
    }

    /// Reserved for typed decoding. Always fails with
    /// [`Error::NotImplemented`] and leaves `target` untouched.
    pub fn unmarshal<T: ?Sized>(&self, _target: &mut T) -> Result<()> {
        Err(Error::NotImplemented)
    }
}
