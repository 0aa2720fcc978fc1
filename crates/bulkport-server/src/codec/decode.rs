//! Format decoders
//!
//! Each decoder turns a byte stream into a lazy sequence of rows. A row is
//! either a parsed JSON value or a per-row parse error; only unreadable
//! input or a malformed whole-file JSON document is fatal.

use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

use super::CodecError;

/// One decoded input row.
///
/// `line_number` is 1-based: the physical line for line-oriented formats,
/// the data-row index for CSV (the header does not count), the element
/// index for JSON arrays.
#[derive(Debug, Clone)]
pub struct DecodedRow {
    pub line_number: i64,
    pub result: Result<Value, String>,
}

/// Pull-based decoder over an async reader.
pub enum Decoder<R> {
    Ndjson(NdjsonDecoder<R>),
    Csv(CsvDecoder<R>),
    JsonArray(JsonArrayDecoder),
}

impl<R: AsyncBufRead + Unpin> Decoder<R> {
    /// Open a decoder for `format`.
    ///
    /// The JSON-array format reads and parses the entire input here; a
    /// non-array document is a fatal decode error.
    pub async fn open(format: super::FileFormat, reader: R) -> Result<Self, CodecError> {
        match format {
            super::FileFormat::Ndjson => Ok(Decoder::Ndjson(NdjsonDecoder::new(reader))),
            super::FileFormat::Csv => Ok(Decoder::Csv(CsvDecoder::new(reader))),
            super::FileFormat::Json => {
                Ok(Decoder::JsonArray(JsonArrayDecoder::read(reader).await?))
            },
        }
    }

    /// Next row, or `None` at end of input.
    pub async fn next_row(&mut self) -> Result<Option<DecodedRow>, CodecError> {
        match self {
            Decoder::Ndjson(d) => d.next_row().await,
            Decoder::Csv(d) => d.next_row().await,
            Decoder::JsonArray(d) => Ok(d.next_row()),
        }
    }
}

/// Line-delimited JSON: one value per line, blank lines skipped.
pub struct NdjsonDecoder<R> {
    reader: R,
    line_number: i64,
    line: String,
}

impl<R: AsyncBufRead + Unpin> NdjsonDecoder<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            line_number: 0,
            line: String::new(),
        }
    }

    pub async fn next_row(&mut self) -> Result<Option<DecodedRow>, CodecError> {
        loop {
            self.line.clear();
            // read_line also hands back a trailing line without a newline.
            let n = self.reader.read_line(&mut self.line).await?;
            if n == 0 {
                return Ok(None);
            }
            self.line_number += 1;
            let trimmed = self.line.trim();
            if trimmed.is_empty() {
                continue;
            }
            let result = serde_json::from_str::<Value>(trimmed)
                .map_err(|e| format!("invalid JSON: {}", e));
            return Ok(Some(DecodedRow {
                line_number: self.line_number,
                result,
            }));
        }
    }
}

/// CSV with a mandatory header row.
///
/// Fields follow RFC 4180 quoting: a quoted field may contain commas,
/// doubled quotes and line breaks. Values decode as trimmed raw strings
/// with no further type coercion.
pub struct CsvDecoder<R> {
    reader: R,
    headers: Option<Vec<String>>,
    row_number: i64,
}

impl<R: AsyncBufRead + Unpin> CsvDecoder<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            headers: None,
            row_number: 0,
        }
    }

    pub async fn next_row(&mut self) -> Result<Option<DecodedRow>, CodecError> {
        loop {
            let Some(record) = self.read_record().await? else {
                return Ok(None);
            };

            match record {
                Ok(fields) => {
                    if self.headers.is_none() {
                        self.headers = Some(fields);
                        continue; // header row is consumed, not emitted
                    }
                    self.row_number += 1;
                    let headers = self.headers.as_ref().map(|h| h.as_slice()).unwrap_or(&[]);
                    let mut map = serde_json::Map::new();
                    for (i, header) in headers.iter().enumerate() {
                        let value = fields.get(i).cloned().unwrap_or_default();
                        map.insert(header.clone(), Value::String(value));
                    }
                    return Ok(Some(DecodedRow {
                        line_number: self.row_number,
                        result: Ok(Value::Object(map)),
                    }));
                },
                Err(message) => {
                    if self.headers.is_none() {
                        return Err(CodecError::Fatal(format!(
                            "invalid CSV header: {}",
                            message
                        )));
                    }
                    self.row_number += 1;
                    return Ok(Some(DecodedRow {
                        line_number: self.row_number,
                        result: Err(message),
                    }));
                },
            }
        }
    }

    /// Read one logical CSV record, pulling extra physical lines while a
    /// quoted field stays open. Blank lines are skipped. `None` at EOF.
    async fn read_record(&mut self) -> Result<Option<Result<Vec<String>, String>>, CodecError> {
        let mut raw = String::new();
        loop {
            let n = self.reader.read_line(&mut raw).await?;
            if n == 0 {
                if raw.trim().is_empty() {
                    return Ok(None);
                }
                return Ok(Some(parse_csv_record(&raw)));
            }
            if raw.trim().is_empty() {
                raw.clear();
                continue;
            }
            match parse_csv_record(&raw) {
                Err(msg) if msg == UNTERMINATED_QUOTE => continue, // field spans lines
                parsed => return Ok(Some(parsed)),
            }
        }
    }
}

const UNTERMINATED_QUOTE: &str = "unterminated quoted field";

/// Split one CSV record into trimmed fields.
fn parse_csv_record(raw: &str) -> Result<Vec<String>, String> {
    let line = raw.strip_suffix('\n').unwrap_or(raw);
    let line = line.strip_suffix('\r').unwrap_or(line);

    let mut fields = Vec::new();
    let mut field = String::new();
    let mut chars = line.chars().peekable();
    let mut in_quotes = false;

    while let Some(c) = chars.next() {
        if in_quotes {
            match c {
                '"' => {
                    if chars.peek() == Some(&'"') {
                        chars.next();
                        field.push('"');
                    } else {
                        in_quotes = false;
                    }
                },
                _ => field.push(c),
            }
        } else {
            match c {
                '"' => in_quotes = true,
                ',' => {
                    fields.push(std::mem::take(&mut field));
                },
                _ => field.push(c),
            }
        }
    }

    if in_quotes {
        return Err(UNTERMINATED_QUOTE.to_string());
    }

    fields.push(field);
    Ok(fields.into_iter().map(|f| f.trim().to_string()).collect())
}

/// Whole-file JSON array, yielded element by element.
pub struct JsonArrayDecoder {
    rows: std::vec::IntoIter<Value>,
    index: i64,
}

impl JsonArrayDecoder {
    pub async fn read<R: AsyncBufRead + Unpin>(mut reader: R) -> Result<Self, CodecError> {
        let mut raw = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut reader, &mut raw).await?;

        let value: Value = serde_json::from_slice(&raw)
            .map_err(|e| CodecError::Fatal(format!("invalid JSON document: {}", e)))?;

        let Value::Array(rows) = value else {
            return Err(CodecError::Fatal(
                "JSON import must be an array of objects".to_string(),
            ));
        };

        Ok(Self {
            rows: rows.into_iter(),
            index: 0,
        })
    }

    pub fn next_row(&mut self) -> Option<DecodedRow> {
        let value = self.rows.next()?;
        self.index += 1;
        Some(DecodedRow {
            line_number: self.index,
            result: Ok(value),
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::super::FileFormat;
    use super::*;
    use serde_json::json;

    async fn collect(format: FileFormat, input: &str) -> Vec<DecodedRow> {
        let mut decoder = Decoder::open(format, input.as_bytes()).await.unwrap();
        let mut rows = Vec::new();
        while let Some(row) = decoder.next_row().await.unwrap() {
            rows.push(row);
        }
        rows
    }

    #[tokio::test]
    async fn test_ndjson_basic() {
        let rows = collect(FileFormat::Ndjson, "{\"a\":1}\n\n{\"a\":2}\n").await;
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].line_number, 1);
        assert_eq!(rows[0].result.as_ref().unwrap(), &json!({"a": 1}));
        // Blank line counts as a physical line but emits nothing.
        assert_eq!(rows[1].line_number, 3);
    }

    #[tokio::test]
    async fn test_ndjson_trailing_line_without_newline() {
        let rows = collect(FileFormat::Ndjson, "{\"a\":1}\n{\"a\":2}").await;
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].result.as_ref().unwrap(), &json!({"a": 2}));
    }

    #[tokio::test]
    async fn test_ndjson_parse_error_is_per_row() {
        let rows = collect(FileFormat::Ndjson, "{\"a\":1}\nnot json\n{\"a\":3}\n").await;
        assert_eq!(rows.len(), 3);
        assert!(rows[1].result.is_err());
        assert!(rows[2].result.is_ok());
    }

    #[tokio::test]
    async fn test_csv_header_and_rows() {
        let rows = collect(
            FileFormat::Csv,
            "email,name\nalice@example.com, Alice \nbob@example.com,Bob\n",
        )
        .await;
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].line_number, 1);
        assert_eq!(
            rows[0].result.as_ref().unwrap(),
            &json!({"email": "alice@example.com", "name": "Alice"})
        );
        assert_eq!(rows[1].line_number, 2);
    }

    #[tokio::test]
    async fn test_csv_quoting() {
        let rows = collect(
            FileFormat::Csv,
            "name,bio\n\"Smith, Jane\",\"said \"\"hi\"\"\"\n",
        )
        .await;
        assert_eq!(
            rows[0].result.as_ref().unwrap(),
            &json!({"name": "Smith, Jane", "bio": r#"said "hi""#})
        );
    }

    #[tokio::test]
    async fn test_csv_quoted_newline() {
        let rows = collect(FileFormat::Csv, "name,bio\nJane,\"line one\nline two\"\n").await;
        assert_eq!(rows.len(), 1);
        assert_eq!(
            rows[0].result.as_ref().unwrap(),
            &json!({"name": "Jane", "bio": "line one\nline two"})
        );
    }

    #[tokio::test]
    async fn test_csv_blank_lines_skipped() {
        let rows = collect(FileFormat::Csv, "a,b\n\n1,2\n\n3,4\n").await;
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].line_number, 2);
    }

    #[tokio::test]
    async fn test_csv_short_row_fills_empty() {
        let rows = collect(FileFormat::Csv, "a,b,c\n1,2\n").await;
        assert_eq!(
            rows[0].result.as_ref().unwrap(),
            &json!({"a": "1", "b": "2", "c": ""})
        );
    }

    #[tokio::test]
    async fn test_json_array() {
        let rows = collect(FileFormat::Json, r#"[{"a":1},{"a":2}]"#).await;
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].line_number, 1);
        assert_eq!(rows[1].line_number, 2);
    }

    #[tokio::test]
    async fn test_json_non_array_is_fatal() {
        let result = Decoder::open(FileFormat::Json, r#"{"a":1}"#.as_bytes()).await;
        assert!(matches!(result, Err(CodecError::Fatal(_))));
    }

    #[tokio::test]
    async fn test_json_malformed_is_fatal() {
        let result = Decoder::open(FileFormat::Json, "[{".as_bytes()).await;
        assert!(matches!(result, Err(CodecError::Fatal(_))));
    }
}
