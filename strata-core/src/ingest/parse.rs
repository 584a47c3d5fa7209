//! Source file parsing into flat JSON rows.
//!
//! Row-level structural problems (wrong column count, malformed JSON line,
//! non-object element) are counted instead of failing the file; the caller
//! decides whether the error rate is acceptable.

use serde_json::{Map, Number, Value};

use crate::config::FileFormat;
use crate::error::IngestError;
use crate::types::Payload;

/// Row errors kept verbatim for reporting.
const MAX_ERROR_SAMPLES: usize = 5;

/// Parsed content of one source file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedFile {
    /// Column names in first-seen order.
    pub columns: Vec<String>,
    pub rows: Vec<Payload>,
    pub error_rows: u64,
    pub error_samples: Vec<String>,
}

impl ParsedFile {
    pub fn total_rows(&self) -> u64 {
        self.rows.len() as u64 + self.error_rows
    }

    /// Share of rows that failed to parse. Zero for an empty file.
    pub fn error_rate(&self) -> f64 {
        let total = self.total_rows();
        if total == 0 {
            0.0
        } else {
            self.error_rows as f64 / total as f64
        }
    }

    fn row_error(&mut self, message: String) {
        self.error_rows += 1;
        if self.error_samples.len() < MAX_ERROR_SAMPLES {
            self.error_samples.push(message);
        }
    }

    fn push_row(&mut self, row: Payload) {
        for key in row.keys() {
            if !self.columns.iter().any(|c| c == key) {
                self.columns.push(key.clone());
            }
        }
        self.rows.push(row);
    }
}

/// Parse `bytes` as `format`.
pub fn parse_file(
    file: &str,
    bytes: &[u8],
    format: FileFormat,
    delimiter: char,
) -> Result<ParsedFile, IngestError> {
    let text = std::str::from_utf8(bytes).map_err(|e| IngestError::Parse {
        file: file.to_string(),
        message: format!("not valid UTF-8: {e}"),
    })?;
    let text = text.strip_prefix('\u{feff}').unwrap_or(text);
    match format {
        FileFormat::Csv => parse_csv(file, text, delimiter),
        FileFormat::Json => parse_json(file, text),
        FileFormat::Jsonl => Ok(parse_jsonl(text)),
    }
}

// ---------------------------------------------------------------------------
// CSV
// ---------------------------------------------------------------------------

/// One physical CSV record.
struct CsvRecord {
    line: usize,
    cells: Vec<String>,
    /// The record ended inside an open quote.
    unterminated: bool,
}

/// Split CSV text into records, honouring double-quoted cells (which may
/// hold delimiters, newlines and `""` escapes).
fn split_records(text: &str, delimiter: char) -> Vec<CsvRecord> {
    let mut records = Vec::new();
    let mut cells = Vec::new();
    let mut cell = String::new();
    let mut in_quotes = false;
    let mut line = 1;
    let mut start_line = 1;
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        if in_quotes {
            match c {
                '"' if chars.peek() == Some(&'"') => {
                    chars.next();
                    cell.push('"');
                }
                '"' => in_quotes = false,
                '\n' => {
                    line += 1;
                    cell.push(c);
                }
                _ => cell.push(c),
            }
            continue;
        }
        match c {
            '"' if cell.is_empty() => in_quotes = true,
            '\r' if chars.peek() == Some(&'\n') => {}
            '\n' => {
                cells.push(std::mem::take(&mut cell));
                records.push(CsvRecord {
                    line: start_line,
                    cells: std::mem::take(&mut cells),
                    unterminated: false,
                });
                line += 1;
                start_line = line;
            }
            c if c == delimiter => cells.push(std::mem::take(&mut cell)),
            _ => cell.push(c),
        }
    }
    if in_quotes || !cell.is_empty() || !cells.is_empty() {
        cells.push(cell);
        records.push(CsvRecord {
            line: start_line,
            cells,
            unterminated: in_quotes,
        });
    }
    records.retain(|r| !(r.cells.len() == 1 && r.cells[0].trim().is_empty() && !r.unterminated));
    records
}

/// Type a CSV cell: integer, float, boolean, else string. Empty is null.
pub fn type_cell(raw: &str) -> Value {
    let s = raw.trim();
    if s.is_empty() {
        return Value::Null;
    }
    if let Ok(i) = s.parse::<i64>() {
        return Value::Number(i.into());
    }
    if let Ok(f) = s.parse::<f64>() {
        if let Some(n) = Number::from_f64(f) {
            return Value::Number(n);
        }
    }
    if s.eq_ignore_ascii_case("true") {
        return Value::Bool(true);
    }
    if s.eq_ignore_ascii_case("false") {
        return Value::Bool(false);
    }
    Value::String(s.to_string())
}

fn parse_csv(file: &str, text: &str, delimiter: char) -> Result<ParsedFile, IngestError> {
    let mut records = split_records(text, delimiter).into_iter();
    let header = records.next().ok_or_else(|| IngestError::Parse {
        file: file.to_string(),
        message: "empty CSV file".into(),
    })?;
    if header.unterminated {
        return Err(IngestError::Parse {
            file: file.to_string(),
            message: "unterminated quote in header".into(),
        });
    }
    let columns: Vec<String> = header.cells.iter().map(|c| c.trim().to_string()).collect();
    for (idx, column) in columns.iter().enumerate() {
        if column.is_empty() || columns[..idx].contains(column) {
            return Err(IngestError::Parse {
                file: file.to_string(),
                message: format!("invalid or duplicate header column '{column}'"),
            });
        }
    }

    let mut parsed = ParsedFile {
        columns: columns.clone(),
        ..Default::default()
    };
    for record in records {
        if record.unterminated {
            parsed.row_error(format!("line {}: unterminated quote", record.line));
            continue;
        }
        if record.cells.len() != columns.len() {
            parsed.row_error(format!(
                "line {}: expected {} columns, found {}",
                record.line,
                columns.len(),
                record.cells.len()
            ));
            continue;
        }
        let row: Payload = columns
            .iter()
            .cloned()
            .zip(record.cells.iter().map(|c| type_cell(c)))
            .collect();
        parsed.rows.push(row);
    }
    Ok(parsed)
}

// ---------------------------------------------------------------------------
// JSON
// ---------------------------------------------------------------------------

/// Flatten nested objects into dotted keys. Arrays become JSON strings.
pub fn flatten(object: &Map<String, Value>) -> Payload {
    let mut out = Payload::new();
    flatten_into(&mut out, "", object);
    out
}

fn flatten_into(out: &mut Payload, prefix: &str, object: &Map<String, Value>) {
    for (key, value) in object {
        let name = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{prefix}.{key}")
        };
        match value {
            Value::Object(inner) if !inner.is_empty() => flatten_into(out, &name, inner),
            Value::Object(_) => {
                out.insert(name, Value::Null);
            }
            Value::Array(_) => {
                out.insert(name, Value::String(value.to_string()));
            }
            other => {
                out.insert(name, other.clone());
            }
        }
    }
}

fn parse_json(file: &str, text: &str) -> Result<ParsedFile, IngestError> {
    let value: Value = serde_json::from_str(text).map_err(|e| IngestError::Parse {
        file: file.to_string(),
        message: e.to_string(),
    })?;
    let mut parsed = ParsedFile::default();
    match value {
        Value::Array(items) => {
            for (idx, item) in items.iter().enumerate() {
                match item {
                    Value::Object(map) => parsed.push_row(flatten(map)),
                    other => parsed.row_error(format!(
                        "element {idx}: expected an object, found {}",
                        json_kind(other)
                    )),
                }
            }
        }
        Value::Object(map) => parsed.push_row(flatten(&map)),
        other => {
            return Err(IngestError::Parse {
                file: file.to_string(),
                message: format!(
                    "JSON must be an array or object, found {}",
                    json_kind(&other)
                ),
            });
        }
    }
    Ok(parsed)
}

fn parse_jsonl(text: &str) -> ParsedFile {
    let mut parsed = ParsedFile::default();
    for (idx, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<Value>(line) {
            Ok(Value::Object(map)) => parsed.push_row(flatten(&map)),
            Ok(other) => parsed.row_error(format!(
                "line {}: expected an object, found {}",
                idx + 1,
                json_kind(&other)
            )),
            Err(e) => parsed.row_error(format!("line {}: {e}", idx + 1)),
        }
    }
    parsed
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_csv_typed_cells() {
        let text = "sensor_id,timestamp,temperature,ok,note\n\
                    S1,2024-01-01 10:00:00,21.5,true,\n\
                    S2,2024-01-01 10:01:00,22,false,hot\n";
        let parsed = parse_file("a.csv", text.as_bytes(), FileFormat::Csv, ',').unwrap();
        assert_eq!(parsed.columns, vec!["sensor_id", "timestamp", "temperature", "ok", "note"]);
        assert_eq!(parsed.rows.len(), 2);
        assert_eq!(parsed.rows[0]["temperature"], json!(21.5));
        assert_eq!(parsed.rows[1]["temperature"], json!(22));
        assert_eq!(parsed.rows[0]["ok"], json!(true));
        assert_eq!(parsed.rows[0]["note"], Value::Null);
        assert_eq!(parsed.rows[0]["timestamp"], json!("2024-01-01 10:00:00"));
        assert_eq!(parsed.error_rows, 0);
    }

    #[test]
    fn test_csv_quotes_and_delimiter() {
        let text = "id;comment\r\n1;\"a;b \"\"quoted\"\"\"\r\n2;\"multi\nline\"\r\n";
        let parsed = parse_file("a.csv", text.as_bytes(), FileFormat::Csv, ';').unwrap();
        assert_eq!(parsed.rows.len(), 2);
        assert_eq!(parsed.rows[0]["comment"], json!("a;b \"quoted\""));
        assert_eq!(parsed.rows[1]["comment"], json!("multi\nline"));
    }

    #[test]
    fn test_csv_counts_bad_rows() {
        let text = "a,b\n1,2\n3\n4,5,6\n7,8\n";
        let parsed = parse_file("a.csv", text.as_bytes(), FileFormat::Csv, ',').unwrap();
        assert_eq!(parsed.rows.len(), 2);
        assert_eq!(parsed.error_rows, 2);
        assert_eq!(parsed.total_rows(), 4);
        assert_eq!(parsed.error_rate(), 0.5);
        assert!(parsed.error_samples[0].starts_with("line 3"));
    }

    #[test]
    fn test_csv_skips_blank_lines_and_rejects_bad_header() {
        let text = "a,b\n\n1,2\n\n";
        let parsed = parse_file("a.csv", text.as_bytes(), FileFormat::Csv, ',').unwrap();
        assert_eq!(parsed.rows.len(), 1);
        assert_eq!(parsed.error_rows, 0);

        assert!(parse_file("e.csv", b"", FileFormat::Csv, ',').is_err());
        assert!(parse_file("d.csv", b"a,a\n1,2\n", FileFormat::Csv, ',').is_err());
    }

    #[test]
    fn test_json_array_flattens_nested() {
        let text = r#"[
            {"equipment_id": "EQ1", "parameters": {"cpu_usage": 41.2, "net": {"latency": 3}}, "tags": ["a", "b"]},
            {"equipment_id": "EQ2", "severity": "HIGH"},
            7
        ]"#;
        let parsed = parse_file("l.json", text.as_bytes(), FileFormat::Json, ',').unwrap();
        assert_eq!(parsed.rows.len(), 2);
        assert_eq!(parsed.error_rows, 1);
        assert_eq!(parsed.rows[0]["parameters.cpu_usage"], json!(41.2));
        assert_eq!(parsed.rows[0]["parameters.net.latency"], json!(3));
        assert_eq!(parsed.rows[0]["tags"], json!("[\"a\",\"b\"]"));
        assert!(parsed.columns.contains(&"severity".to_string()));
    }

    #[test]
    fn test_json_single_object_and_garbage() {
        let parsed = parse_file("o.json", br#"{"a": 1}"#, FileFormat::Json, ',').unwrap();
        assert_eq!(parsed.rows.len(), 1);
        assert!(parse_file("x.json", b"{not json", FileFormat::Json, ',').is_err());
        assert!(parse_file("n.json", b"42", FileFormat::Json, ',').is_err());
    }

    #[test]
    fn test_jsonl_counts_bad_lines() {
        let text = "{\"a\": 1}\n\n{broken\n[1]\n{\"a\": 2}\n";
        let parsed = parse_file("l.jsonl", text.as_bytes(), FileFormat::Jsonl, ',').unwrap();
        assert_eq!(parsed.rows.len(), 2);
        assert_eq!(parsed.error_rows, 2);
    }

    #[test]
    fn test_invalid_utf8() {
        assert!(parse_file("b.csv", &[0xff, 0xfe, 0x00], FileFormat::Csv, ',').is_err());
    }
}
