//! Format encoders
//!
//! Encoders consume a lazy sequence of JSON object records and emit bytes
//! one record at a time, so the export pipeline can hand them straight to
//! the multipart uploader.

use serde_json::{Map, Value};

use super::{CodecError, FileFormat};

/// Incremental encoder for one export artifact.
pub struct Encoder {
    format: FileFormat,
    /// Explicit CSV column order; the first record's keys otherwise.
    fields: Option<Vec<String>>,
    records_written: u64,
}

impl Encoder {
    pub fn new(format: FileFormat, fields: Option<Vec<String>>) -> Self {
        Self {
            format,
            fields,
            records_written: 0,
        }
    }

    /// Encode one record, including any separators or headers due before it.
    pub fn encode(&mut self, record: &Map<String, Value>) -> Result<Vec<u8>, CodecError> {
        let mut out = Vec::new();
        match self.format {
            FileFormat::Ndjson => {
                serde_json::to_writer(&mut out, record)
                    .map_err(|e| CodecError::Fatal(e.to_string()))?;
                out.push(b'\n');
            },
            FileFormat::Json => {
                out.push(if self.records_written == 0 { b'[' } else { b',' });
                serde_json::to_writer(&mut out, record)
                    .map_err(|e| CodecError::Fatal(e.to_string()))?;
            },
            FileFormat::Csv => {
                if self.records_written == 0 {
                    let header: Vec<String> = match &self.fields {
                        Some(fields) => fields.clone(),
                        None => record.keys().cloned().collect(),
                    };
                    out.extend_from_slice(encode_csv_row_strs(&header).as_bytes());
                    self.fields = Some(header);
                }
                let fields = self.fields.as_deref().unwrap_or(&[]);
                let cells: Vec<String> = fields
                    .iter()
                    .map(|f| csv_cell(record.get(f).unwrap_or(&Value::Null)))
                    .collect();
                out.extend_from_slice(encode_csv_row_strs(&cells).as_bytes());
            },
        }
        self.records_written += 1;
        Ok(out)
    }

    /// Closing bytes of the artifact (the `]` of a JSON array; an empty
    /// array document when nothing was written).
    pub fn finish(&mut self) -> Vec<u8> {
        match self.format {
            FileFormat::Json => {
                if self.records_written == 0 {
                    b"[]".to_vec()
                } else {
                    b"]".to_vec()
                }
            },
            FileFormat::Ndjson | FileFormat::Csv => Vec::new(),
        }
    }

    pub fn records_written(&self) -> u64 {
        self.records_written
    }
}

/// Render a JSON value as one CSV cell.
///
/// Null and absent values become the empty string; scalars use their plain
/// rendering; lists and objects are JSON-encoded.
fn csv_cell(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        nested => nested.to_string(),
    }
}

fn encode_csv_row_strs(cells: &[String]) -> String {
    let mut row = cells
        .iter()
        .map(|c| escape_csv(c))
        .collect::<Vec<_>>()
        .join(",");
    row.push('\n');
    row
}

/// Quote a cell when it contains a comma, quote or line break; double
/// internal quotes.
fn escape_csv(cell: &str) -> String {
    if cell.contains(',') || cell.contains('"') || cell.contains('\n') || cell.contains('\r') {
        format!("\"{}\"", cell.replace('"', "\"\""))
    } else {
        cell.to_string()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    fn encode_all(format: FileFormat, fields: Option<Vec<String>>, records: &[Value]) -> String {
        let mut encoder = Encoder::new(format, fields);
        let mut out = Vec::new();
        for record in records {
            out.extend(encoder.encode(&obj(record.clone())).unwrap());
        }
        out.extend(encoder.finish());
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn test_ndjson_encoding() {
        let out = encode_all(
            FileFormat::Ndjson,
            None,
            &[json!({"a": 1}), json!({"a": 2})],
        );
        assert_eq!(out, "{\"a\":1}\n{\"a\":2}\n");
    }

    #[test]
    fn test_json_array_encoding() {
        let out = encode_all(FileFormat::Json, None, &[json!({"a": 1}), json!({"a": 2})]);
        assert_eq!(out, r#"[{"a":1},{"a":2}]"#);
    }

    #[test]
    fn test_json_array_empty() {
        let out = encode_all(FileFormat::Json, None, &[]);
        assert_eq!(out, "[]");
    }

    #[test]
    fn test_csv_header_from_first_record() {
        let out = encode_all(
            FileFormat::Csv,
            None,
            &[
                json!({"email": "a@b.c", "name": "Ann"}),
                json!({"email": "d@e.f", "name": "Dee"}),
            ],
        );
        assert_eq!(out, "email,name\na@b.c,Ann\nd@e.f,Dee\n");
    }

    #[test]
    fn test_csv_explicit_field_list() {
        let out = encode_all(
            FileFormat::Csv,
            Some(vec!["name".to_string(), "email".to_string()]),
            &[json!({"email": "a@b.c", "name": "Ann", "extra": 1})],
        );
        assert_eq!(out, "name,email\nAnn,a@b.c\n");
    }

    #[test]
    fn test_csv_escaping() {
        let out = encode_all(
            FileFormat::Csv,
            None,
            &[json!({"name": "Smith, Jane", "quote": "said \"hi\"", "multi": "a\nb"})],
        );
        assert_eq!(
            out,
            "name,quote,multi\n\"Smith, Jane\",\"said \"\"hi\"\"\",\"a\nb\"\n"
        );
    }

    #[test]
    fn test_csv_null_and_nested_values() {
        let out = encode_all(
            FileFormat::Csv,
            Some(vec![
                "a".to_string(),
                "tags".to_string(),
                "missing".to_string(),
            ]),
            &[json!({"a": null, "tags": ["x", "y"]})],
        );
        assert_eq!(out, "a,tags,missing\n,\"[\"\"x\"\",\"\"y\"\"]\",\n");
    }
}
