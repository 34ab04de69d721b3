//! Feed adapters: ZIP archive entries in, normalized feed records out.

use std::collections::BTreeMap;
use std::io::{Cursor, Read};
use std::path::Path;

use anyhow::Context;
use tfi_core::{ColumnType, EntityKind, FeedRecord, RunScope, Value};
use thiserror::Error;

pub const CRATE_NAME: &str = "tfi-adapters";

const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("archive is not a readable container: {0}")]
    ArchiveCorrupt(String),
    #[error("malformed table {table}: {reason}")]
    MalformedTable { table: String, reason: String },
}

impl From<zip::result::ZipError> for AdapterError {
    fn from(err: zip::result::ZipError) -> Self {
        AdapterError::ArchiveCorrupt(err.to_string())
    }
}

/// Named entries of a feed archive. Directory entries are not kept and
/// names are matched exactly.
#[derive(Debug, Clone, Default)]
pub struct FeedArchive {
    entries: BTreeMap<String, Vec<u8>>,
}

impl FeedArchive {
    pub fn from_zip_bytes(bytes: &[u8]) -> Result<Self, AdapterError> {
        let mut archive = zip::ZipArchive::new(Cursor::new(bytes))?;
        let mut entries = BTreeMap::new();
        for i in 0..archive.len() {
            let mut file = archive.by_index(i)?;
            if file.is_dir() {
                continue;
            }
            let name = file.name().to_string();
            let mut data = Vec::new();
            file.read_to_end(&mut data)
                .map_err(|err| AdapterError::ArchiveCorrupt(format!("reading {name}: {err}")))?;
            entries.insert(name, data);
        }
        tracing::debug!(entries = entries.len(), "feed archive opened");
        Ok(Self { entries })
    }

    /// Loads every regular file of an unpacked feed directory.
    pub fn from_dir(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let mut entries = BTreeMap::new();
        for entry in std::fs::read_dir(path).with_context(|| format!("reading {}", path.display()))? {
            let entry = entry.with_context(|| format!("listing {}", path.display()))?;
            if !entry.file_type().map(|ft| ft.is_file()).unwrap_or(false) {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            let data = std::fs::read(entry.path())
                .with_context(|| format!("reading {}", entry.path().display()))?;
            entries.insert(name, data);
        }
        Ok(Self { entries })
    }

    pub fn from_entries<N: Into<String>>(entries: impl IntoIterator<Item = (N, Vec<u8>)>) -> Self {
        Self {
            entries: entries.into_iter().map(|(n, d)| (n.into(), d)).collect(),
        }
    }

    pub fn entry(&self, name: &str) -> Option<&[u8]> {
        self.entries.get(name).map(Vec::as_slice)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Field name → raw string value for one delimited row.
pub type RawRow = BTreeMap<String, String>;

/// Parses header-first delimited text. Each call starts a fresh reader, so
/// the same bytes can be parsed any number of times.
pub fn parse_table<'a>(table: &str, bytes: &'a [u8]) -> Result<TableRows<'a>, AdapterError> {
    let bytes = bytes.strip_prefix(UTF8_BOM).unwrap_or(bytes);

    // Escaped quotes come in pairs, so well-formed input has an even count.
    if bytes.iter().filter(|&&b| b == b'"').count() % 2 != 0 {
        return Err(malformed(table, "unbalanced quoting"));
    }

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(false)
        .trim(csv::Trim::All)
        .from_reader(bytes);
    let headers = reader
        .headers()
        .map_err(|err| malformed(table, err))?
        .clone();

    Ok(TableRows {
        table: table.to_string(),
        headers,
        reader,
        record: csv::StringRecord::new(),
        done: false,
    })
}

fn malformed(table: &str, reason: impl ToString) -> AdapterError {
    AdapterError::MalformedTable {
        table: table.to_string(),
        reason: reason.to_string(),
    }
}

pub struct TableRows<'a> {
    table: String,
    headers: csv::StringRecord,
    reader: csv::Reader<&'a [u8]>,
    record: csv::StringRecord,
    done: bool,
}

impl TableRows<'_> {
    pub fn headers(&self) -> impl Iterator<Item = &str> {
        self.headers.iter()
    }
}

impl Iterator for TableRows<'_> {
    type Item = Result<RawRow, AdapterError>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.done {
            match self.reader.read_record(&mut self.record) {
                Ok(false) => self.done = true,
                Ok(true) => {
                    if self.record.iter().all(str::is_empty) {
                        continue;
                    }
                    let row = self
                        .headers
                        .iter()
                        .zip(self.record.iter())
                        .map(|(h, v)| (h.to_string(), v.to_string()))
                        .collect();
                    return Some(Ok(row));
                }
                Err(err) => {
                    self.done = true;
                    return Some(Err(malformed(&self.table, err)));
                }
            }
        }
        None
    }
}

/// Outcome of normalizing one row.
#[derive(Debug, Clone, PartialEq)]
pub struct Normalized {
    pub record: FeedRecord,
    /// Non-empty fields that failed numeric coercion and became null.
    pub coerced_nulls: usize,
}

/// Turns raw rows into typed records for one run scope.
#[derive(Debug, Clone, Copy)]
pub struct RecordNormalizer {
    scope: RunScope,
}

impl RecordNormalizer {
    pub fn new(scope: RunScope) -> Self {
        Self { scope }
    }

    /// Unknown tables only get the empty-to-null rule.
    pub fn normalize_table(&self, table: &str, raw: RawRow) -> Normalized {
        self.normalize(EntityKind::from_table_name(table), raw)
    }

    pub fn normalize(&self, kind: Option<EntityKind>, raw: RawRow) -> Normalized {
        let spec = kind.map(EntityKind::spec);
        let mut record = FeedRecord::new(&self.scope);
        let mut coerced_nulls = 0;

        for (name, text) in raw {
            if text.is_empty() {
                record.fields.insert(name, Value::Null);
                continue;
            }
            let ty = spec
                .and_then(|s| s.column(&name))
                .map(|c| c.ty)
                .unwrap_or(ColumnType::Text);
            let value = coerce(ty, text);
            if value.is_null() {
                coerced_nulls += 1;
            }
            record.fields.insert(name, value);
        }

        Normalized {
            record,
            coerced_nulls,
        }
    }
}

fn coerce(ty: ColumnType, text: String) -> Value {
    match ty {
        ColumnType::Text => Value::Text(text),
        ColumnType::Int => leading_int(&text).map(Value::Int).unwrap_or(Value::Null),
        ColumnType::Float => leading_float(&text).map(Value::Float).unwrap_or(Value::Null),
        ColumnType::Coordinate => leading_float(&text.replacen(',', ".", 1))
            .map(Value::Float)
            .unwrap_or(Value::Null),
    }
}

/// Length of the optional sign plus digit run at the start of `bytes`.
fn signed_digits(bytes: &[u8]) -> (usize, usize) {
    let sign = usize::from(matches!(bytes.first(), Some(b'+' | b'-')));
    let digits = bytes[sign..].iter().take_while(|b| b.is_ascii_digit()).count();
    (sign, digits)
}

/// Integer from the leading digits of `text`, so `"3.0"` is 3 and `"12abc"`
/// is 12. None when no digit leads or the value overflows.
fn leading_int(text: &str) -> Option<i64> {
    let text = text.trim_start();
    let (sign, digits) = signed_digits(text.as_bytes());
    if digits == 0 {
        return None;
    }
    text[..sign + digits].parse().ok()
}

/// Float from the longest decimal prefix of `text` (`"1.5km"` is 1.5). An
/// exponent only counts when digits follow it.
fn leading_float(text: &str) -> Option<f64> {
    let text = text.trim_start();
    let bytes = text.as_bytes();
    let (sign, int_digits) = signed_digits(bytes);
    let mut end = sign + int_digits;
    let mut mantissa_digits = int_digits;

    if bytes.get(end) == Some(&b'.') {
        let frac = bytes[end + 1..].iter().take_while(|b| b.is_ascii_digit()).count();
        if int_digits > 0 || frac > 0 {
            end += 1 + frac;
            mantissa_digits += frac;
        }
    }
    if mantissa_digits == 0 {
        return None;
    }
    if matches!(bytes.get(end), Some(b'e' | b'E')) {
        let (exp_sign, exp_digits) = signed_digits(&bytes[end + 1..]);
        if exp_digits > 0 {
            end += 1 + exp_sign + exp_digits;
        }
    }

    text[..end].parse::<f64>().ok().filter(|v| v.is_finite())
}
