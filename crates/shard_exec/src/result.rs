//! One decoded response batch from one physical operation.
//!
//! An [`OpResult`] owns the response buffer (shared with the transport
//! sidecar) and a forward cursor over its rows. For batched row-id reads the
//! storage layer returns per-row order tags alongside the buffer; those are
//! attached here and must match the row count exactly.

use bytes::Bytes;
use tracing::trace;

use crate::decoder::{decode_result, RowCursor};
use crate::error::{ExecError, ExecResult};

/// A batch of row identifiers extracted from an index-scan result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowIdBatch {
    /// Row identifiers in response order.
    pub ids: Vec<Bytes>,
    /// Whether the caller asked for order preservation downstream.
    pub keep_order: bool,
}

/// One decoded response from one physical operation. Immutable once
/// constructed apart from the forward cursor.
#[derive(Debug)]
pub struct OpResult {
    data: Bytes,
    row_count: u64,
    current_row: u64,
    cursor: RowCursor,
    row_orders: Vec<i64>,
    row_ids: Vec<Bytes>,
}

impl OpResult {
    /// Decodes a response buffer without order tags.
    pub fn new(data: Bytes) -> ExecResult<Self> {
        let (row_count, cursor) = decode_result(&data)?;
        Ok(Self {
            data,
            row_count,
            current_row: 0,
            cursor,
            row_orders: Vec::new(),
            row_ids: Vec::new(),
        })
    }

    /// Decodes a response buffer carrying per-row order tags.
    ///
    /// Order tags come only with batched row-id operations; their count must
    /// equal the row count exactly.
    pub fn with_orders(data: Bytes, orders: &[i64]) -> ExecResult<Self> {
        let mut result = Self::new(data)?;
        if !orders.is_empty() {
            if orders.len() as u64 != result.row_count {
                return Err(ExecError::illegal_state(format!(
                    "row order count {} does not match row count {}",
                    orders.len(),
                    result.row_count
                )));
            }
            result.row_orders = orders.to_vec();
        }
        Ok(result)
    }

    /// Number of rows in this batch.
    pub fn row_count(&self) -> u64 {
        self.row_count
    }

    /// Returns `true` once every row has been consumed.
    pub fn is_eof(&self) -> bool {
        self.current_row >= self.row_count
    }

    /// Order tag of the row the cursor currently points at.
    pub fn next_row_order(&self) -> ExecResult<i64> {
        if self.is_eof() {
            return Err(ExecError::illegal_state(
                "row order requested past the end of the batch",
            ));
        }
        self.row_orders
            .get(self.current_row as usize)
            .copied()
            .ok_or_else(|| ExecError::illegal_state("batch carries no row order tags"))
    }

    /// Reads the next row as `column_count` optional values, advancing the
    /// cursor.
    pub fn read_row(&mut self, column_count: usize) -> ExecResult<Vec<Option<Bytes>>> {
        if self.is_eof() {
            return Err(ExecError::illegal_state("read past the end of the batch"));
        }
        let mut row = Vec::with_capacity(column_count);
        for _ in 0..column_count {
            if self.cursor.read_header_is_null()? {
                row.push(None);
            } else {
                row.push(Some(self.cursor.read_value()?));
            }
        }
        self.current_row += 1;
        Ok(row)
    }

    /// Extracts every remaining row as a single non-null row identifier.
    ///
    /// Row-id batches are consumed whole; ordered consumption happens after
    /// the ids are routed back through batched read operations, so a batch
    /// with order tags here is a protocol error.
    pub fn extract_row_ids(&mut self) -> ExecResult<&[Bytes]> {
        if !self.row_orders.is_empty() {
            return Err(ExecError::illegal_state(
                "row-id entries cannot carry order tags",
            ));
        }
        while !self.is_eof() {
            if self.cursor.read_header_is_null()? {
                return Err(ExecError::illegal_state("row identifier cannot be null"));
            }
            let id = self.cursor.read_value()?;
            self.row_ids.push(id);
            self.current_row += 1;
        }
        if !self.cursor.is_empty() {
            return Err(ExecError::illegal_state("unread row data after last row"));
        }
        trace!(ids = self.row_ids.len(), "extracted row-id batch");
        Ok(&self.row_ids)
    }

    /// Underlying shared buffer, mostly useful for accounting.
    pub fn data(&self) -> &Bytes {
        &self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::ResultBuilder;

    fn one_column_batch(values: &[&[u8]]) -> Bytes {
        let mut builder = ResultBuilder::new();
        for value in values {
            builder.push_row([Some(*value)]);
        }
        builder.finish()
    }

    #[test]
    fn order_tag_count_must_match_rows() {
        let data = one_column_batch(&[b"a", b"b"]);
        let err = OpResult::with_orders(data.clone(), &[7]).unwrap_err();
        assert!(matches!(err, ExecError::IllegalState(_)));

        let result = OpResult::with_orders(data, &[7, 9]).expect("matching orders");
        assert_eq!(result.next_row_order().unwrap(), 7);
    }

    #[test]
    fn read_row_advances_order_cursor() {
        let data = one_column_batch(&[b"a", b"b"]);
        let mut result = OpResult::with_orders(data, &[3, 5]).unwrap();
        assert_eq!(result.next_row_order().unwrap(), 3);
        result.read_row(1).unwrap();
        assert_eq!(result.next_row_order().unwrap(), 5);
        result.read_row(1).unwrap();
        assert!(result.is_eof());
        assert!(result.next_row_order().is_err());
    }

    #[test]
    fn extract_row_ids_consumes_batch() {
        let data = one_column_batch(&[b"id1", b"id2", b"id3"]);
        let mut result = OpResult::new(data).unwrap();
        let ids = result.extract_row_ids().unwrap();
        assert_eq!(ids.len(), 3);
        assert_eq!(ids[0].as_ref(), b"id1");
        assert!(result.is_eof());
    }

    #[test]
    fn null_row_id_is_rejected() {
        let mut builder = ResultBuilder::new();
        builder.push_row([None]);
        let mut result = OpResult::new(builder.finish()).unwrap();
        assert!(matches!(
            result.extract_row_ids(),
            Err(ExecError::IllegalState(_))
        ));
    }
}
