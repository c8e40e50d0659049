//! Row-payload framing: a forward-only cursor over one response buffer.
//!
//! The storage layer returns row data as a single sidecar buffer per
//! physical operation. The framing is deliberately simple: a `u64` LE row
//! count, then for every value a one-byte null header followed, when not
//! null, by a `u64` LE length and the value payload. The cursor hands out
//! zero-copy [`Bytes`] slices of the shared buffer.

use bytes::Bytes;

use crate::error::{ExecError, ExecResult};

/// Null header marker: a non-zero header byte means the value is null.
const NULL_HEADER: u8 = 1;

/// Forward-only cursor over the value area of a decoded response buffer.
#[derive(Debug, Clone)]
pub struct RowCursor {
    data: Bytes,
    pos: usize,
}

impl RowCursor {
    /// Returns `true` when every byte of the value area has been consumed.
    pub fn is_empty(&self) -> bool {
        self.pos >= self.data.len()
    }

    /// Reads one null header byte, advancing past it.
    pub fn read_header_is_null(&mut self) -> ExecResult<bool> {
        let header = *self
            .data
            .get(self.pos)
            .ok_or_else(|| ExecError::invalid_argument("truncated row data: missing header"))?;
        self.pos += 1;
        Ok(header == NULL_HEADER)
    }

    /// Reads one length-prefixed value, returning a slice of the shared
    /// buffer.
    pub fn read_value(&mut self) -> ExecResult<Bytes> {
        let len = self.read_u64()? as usize;
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.data.len())
            .ok_or_else(|| ExecError::invalid_argument("truncated row data: short value"))?;
        let value = self.data.slice(self.pos..end);
        self.pos = end;
        Ok(value)
    }

    fn read_u64(&mut self) -> ExecResult<u64> {
        let end = self.pos + 8;
        let raw = self
            .data
            .get(self.pos..end)
            .ok_or_else(|| ExecError::invalid_argument("truncated row data: missing length"))?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(raw);
        self.pos = end;
        Ok(u64::from_le_bytes(buf))
    }
}

/// Decodes one raw response buffer into a row count and a value cursor.
pub fn decode_result(data: &Bytes) -> ExecResult<(u64, RowCursor)> {
    if data.len() < 8 {
        return Err(ExecError::invalid_argument(
            "response buffer too short for row count",
        ));
    }
    let mut count_buf = [0u8; 8];
    count_buf.copy_from_slice(&data[..8]);
    let row_count = u64::from_le_bytes(count_buf);
    let cursor = RowCursor {
        data: data.clone(),
        pos: 8,
    };
    Ok((row_count, cursor))
}

/// Builder producing buffers in the response framing, used by transports and
/// by tests to fabricate storage responses.
#[derive(Debug, Default)]
pub struct ResultBuilder {
    row_count: u64,
    values: Vec<u8>,
}

impl ResultBuilder {
    /// Creates an empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends one row of optional column values.
    pub fn push_row<'a>(&mut self, columns: impl IntoIterator<Item = Option<&'a [u8]>>) {
        for column in columns {
            match column {
                None => self.values.push(NULL_HEADER),
                Some(value) => {
                    self.values.push(0);
                    self.values
                        .extend_from_slice(&(value.len() as u64).to_le_bytes());
                    self.values.extend_from_slice(value);
                }
            }
        }
        self.row_count += 1;
    }

    /// Finalizes the buffer.
    pub fn finish(self) -> Bytes {
        let mut out = Vec::with_capacity(8 + self.values.len());
        out.extend_from_slice(&self.row_count.to_le_bytes());
        out.extend_from_slice(&self.values);
        Bytes::from(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_rows_with_nulls() {
        let mut builder = ResultBuilder::new();
        builder.push_row([Some(b"a".as_slice()), None]);
        builder.push_row([Some(b"bc".as_slice()), Some(b"".as_slice())]);
        let buffer = builder.finish();

        let (rows, mut cursor) = decode_result(&buffer).expect("decode");
        assert_eq!(rows, 2);

        assert!(!cursor.read_header_is_null().unwrap());
        assert_eq!(cursor.read_value().unwrap().as_ref(), b"a");
        assert!(cursor.read_header_is_null().unwrap());

        assert!(!cursor.read_header_is_null().unwrap());
        assert_eq!(cursor.read_value().unwrap().as_ref(), b"bc");
        assert!(!cursor.read_header_is_null().unwrap());
        assert_eq!(cursor.read_value().unwrap().as_ref(), b"");
        assert!(cursor.is_empty());
    }

    #[test]
    fn truncated_buffer_is_rejected() {
        let err = decode_result(&Bytes::from_static(b"\x01\x00")).unwrap_err();
        assert!(matches!(err, ExecError::InvalidArgument(_)));

        let mut builder = ResultBuilder::new();
        builder.push_row([Some(b"abc".as_slice())]);
        let buffer = builder.finish();
        let truncated = buffer.slice(..buffer.len() - 1);
        let (_, mut cursor) = decode_result(&truncated).expect("decode header");
        cursor.read_header_is_null().unwrap();
        assert!(matches!(
            cursor.read_value(),
            Err(ExecError::InvalidArgument(_))
        ));
    }
}
