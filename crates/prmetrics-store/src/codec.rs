//! Arrow/Parquet encoding of stored rows.
//!
//! Files written here carry the fixed columns plus whichever optional columns the
//! rows observed. Reading is tolerant: missing optional columns decode as
//! [`Observed::Absent`], and integer, timestamp and list columns are accepted in any
//! of the physical types older collectors produced.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arrow_array::cast::AsArray;
use arrow_array::builder::{ListBuilder, StringBuilder};
use arrow_array::types::{
    Date32Type, Float32Type, Float64Type, Int8Type, Int16Type, Int32Type, Int64Type,
    TimestampMicrosecondType, TimestampMillisecondType, TimestampNanosecondType,
    TimestampSecondType, UInt8Type, UInt16Type, UInt32Type, UInt64Type,
};
use arrow_array::{
    Array, ArrayRef, BooleanArray, Float64Array, RecordBatch, StringArray,
    TimestampMillisecondArray, UInt32Array, UInt64Array,
};
use arrow_schema::{DataType, Field, Schema, SchemaRef, TimeUnit};
use chrono::{DateTime, NaiveDateTime, Utc};
use parquet::arrow::ArrowWriter;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;
use parquet::format::KeyValue;
use prmetrics_core::{ColumnSet, Observed, OptionalColumn, PullRequestRecord, ReviewDecision};

use crate::{StoreError, StoredRow};

pub(crate) const BATCH_ID_KEY: &str = "prmetrics.batch_id";
pub(crate) const BATCH_COLLECTED_AT_KEY: &str = "prmetrics.batch_collected_at";
const ROW_COUNT_KEY: &str = "prmetrics.row_count";
const CREATED_BY: &str = "prmetrics";

/// Lists, per row, the optional columns a file carries but that row never observed.
/// Only present in files that mix rows with different column sets.
const ABSENT_COLUMNS: &str = "absent_columns";

const UTC: &str = "UTC";

pub(crate) type FileMetadata = BTreeMap<String, String>;

fn timestamp_type() -> DataType {
    DataType::Timestamp(TimeUnit::Millisecond, Some(UTC.into()))
}

fn string_list_type() -> DataType {
    DataType::List(Arc::new(Field::new("item", DataType::Utf8, true)))
}

fn optional_field(column: OptionalColumn) -> Field {
    let data_type = match column {
        OptionalColumn::ReviewsCount
        | OptionalColumn::CommentsCount
        | OptionalColumn::CommitsCount => DataType::UInt32,
        OptionalColumn::ChangedFiles => DataType::UInt64,
        OptionalColumn::Reviewers | OptionalColumn::Labels => string_list_type(),
        OptionalColumn::TimeToFirstReviewHours => DataType::Float64,
        OptionalColumn::ReviewDecision | OptionalColumn::MergedBy => DataType::Utf8,
        OptionalColumn::UpdatedAt => timestamp_type(),
    };
    Field::new(column.as_str(), data_type, true)
}

pub(crate) fn schema_for(columns: &ColumnSet, mixed: bool) -> SchemaRef {
    let mut fields = vec![
        Field::new("organization", DataType::Utf8, false),
        Field::new("repository", DataType::Utf8, false),
        Field::new("pr_number", DataType::UInt64, false),
        Field::new("author", DataType::Utf8, false),
        Field::new("created_at", timestamp_type(), true),
        Field::new("merged_at", timestamp_type(), true),
        Field::new("closed_at", timestamp_type(), true),
        Field::new("additions", DataType::UInt64, false),
        Field::new("deletions", DataType::UInt64, false),
        Field::new("is_draft", DataType::Boolean, false),
        Field::new("batch_id", DataType::Utf8, true),
        Field::new("batch_collected_at", timestamp_type(), false),
    ];
    fields.extend(columns.iter().copied().map(optional_field));
    if mixed {
        fields.push(Field::new(ABSENT_COLUMNS, string_list_type(), true));
    }
    Arc::new(Schema::new(fields))
}

pub(crate) fn encode_rows(rows: &[StoredRow]) -> Result<RecordBatch, StoreError> {
    let columns = rows
        .iter()
        .flat_map(StoredRow::columns)
        .collect::<ColumnSet>();
    let mixed = rows.iter().any(|row| row.columns() != columns);
    let schema = schema_for(&columns, mixed);

    let records = rows.iter().map(|row| &row.record).collect::<Vec<_>>();
    let mut arrays: Vec<ArrayRef> = vec![
        Arc::new(StringArray::from_iter_values(
            records.iter().map(|r| r.organization.as_str()),
        )),
        Arc::new(StringArray::from_iter_values(
            records.iter().map(|r| r.repository.as_str()),
        )),
        Arc::new(UInt64Array::from(
            records.iter().map(|r| r.pr_number).collect::<Vec<_>>(),
        )),
        Arc::new(StringArray::from_iter_values(
            records.iter().map(|r| r.author.as_str()),
        )),
        timestamps(records.iter().map(|r| r.created_at)),
        timestamps(records.iter().map(|r| r.merged_at)),
        timestamps(records.iter().map(|r| r.closed_at)),
        Arc::new(UInt64Array::from(
            records.iter().map(|r| r.additions).collect::<Vec<_>>(),
        )),
        Arc::new(UInt64Array::from(
            records.iter().map(|r| r.deletions).collect::<Vec<_>>(),
        )),
        Arc::new(BooleanArray::from(
            records.iter().map(|r| r.is_draft).collect::<Vec<_>>(),
        )),
        Arc::new(StringArray::from(
            rows.iter()
                .map(|row| row.batch_id.as_deref())
                .collect::<Vec<_>>(),
        )),
        timestamps(rows.iter().map(|row| Some(row.batch_collected_at))),
    ];

    for column in &columns {
        arrays.push(optional_array(*column, &records));
    }
    if mixed {
        let absent = rows
            .iter()
            .map(|row| {
                columns
                    .difference(&row.columns())
                    .map(|column| column.as_str().to_owned())
                    .collect::<BTreeSet<_>>()
            })
            .collect::<Vec<_>>();
        arrays.push(string_lists(absent.iter().map(Some)));
    }

    Ok(RecordBatch::try_new(schema, arrays)?)
}

fn optional_array(column: OptionalColumn, records: &[&PullRequestRecord]) -> ArrayRef {
    match column {
        OptionalColumn::ReviewsCount => counts(records.iter().map(|r| &r.reviews_count)),
        OptionalColumn::CommentsCount => counts(records.iter().map(|r| &r.comments_count)),
        OptionalColumn::CommitsCount => counts(records.iter().map(|r| &r.commits_count)),
        OptionalColumn::ChangedFiles => Arc::new(UInt64Array::from(
            records
                .iter()
                .map(|r| r.changed_files.present().copied())
                .collect::<Vec<_>>(),
        )),
        OptionalColumn::Reviewers => string_lists(records.iter().map(|r| r.reviewers.present())),
        OptionalColumn::Labels => string_lists(records.iter().map(|r| r.labels.present())),
        OptionalColumn::TimeToFirstReviewHours => Arc::new(Float64Array::from(
            records
                .iter()
                .map(|r| r.time_to_first_review_hours.present().copied().flatten())
                .collect::<Vec<_>>(),
        )),
        OptionalColumn::ReviewDecision => Arc::new(StringArray::from(
            records
                .iter()
                .map(|r| r.review_decision.present().map(|decision| decision.as_str()))
                .collect::<Vec<_>>(),
        )),
        OptionalColumn::MergedBy => Arc::new(StringArray::from(
            records
                .iter()
                .map(|r| r.merged_by.present().and_then(|login| login.as_deref()))
                .collect::<Vec<_>>(),
        )),
        OptionalColumn::UpdatedAt => timestamps(
            records
                .iter()
                .map(|r| r.updated_at.present().copied().flatten()),
        ),
    }
}

fn counts<'a>(values: impl Iterator<Item = &'a Observed<u32>>) -> ArrayRef {
    Arc::new(UInt32Array::from(
        values
            .map(|value| value.present().copied())
            .collect::<Vec<_>>(),
    ))
}

fn timestamps(values: impl Iterator<Item = Option<DateTime<Utc>>>) -> ArrayRef {
    let millis = values
        .map(|value| value.map(|at| at.timestamp_millis()))
        .collect::<Vec<_>>();
    Arc::new(TimestampMillisecondArray::from(millis).with_timezone(UTC))
}

fn string_lists<'a>(values: impl Iterator<Item = Option<&'a BTreeSet<String>>>) -> ArrayRef {
    let mut builder = ListBuilder::new(StringBuilder::new());
    for value in values {
        match value {
            Some(items) => {
                for item in items {
                    builder.values().append_value(item);
                }
                builder.append(true);
            }
            None => builder.append(false),
        }
    }
    Arc::new(builder.finish())
}

fn file_key_values(rows: &[StoredRow]) -> Vec<KeyValue> {
    let mut key_values = vec![
        KeyValue::new("created_by".to_owned(), CREATED_BY.to_owned()),
        KeyValue::new(ROW_COUNT_KEY.to_owned(), rows.len().to_string()),
    ];
    if let Some(first) = rows.first() {
        let single_batch = rows.iter().all(|row| {
            row.batch_id == first.batch_id && row.batch_collected_at == first.batch_collected_at
        });
        if single_batch {
            if let Some(batch_id) = &first.batch_id {
                key_values.push(KeyValue::new(BATCH_ID_KEY.to_owned(), batch_id.clone()));
            }
            key_values.push(KeyValue::new(
                BATCH_COLLECTED_AT_KEY.to_owned(),
                first.batch_collected_at.to_rfc3339(),
            ));
        }
    }
    key_values
}

/// Writes `rows` as `dir/file_name` through a temp file that is fsynced and then
/// renamed into place, so readers only ever see complete files.
pub(crate) fn write_rows(
    dir: &Path,
    file_name: &str,
    rows: &[StoredRow],
) -> Result<PathBuf, StoreError> {
    let batch = encode_rows(rows)?;
    let props = WriterProperties::builder()
        .set_compression(Compression::SNAPPY)
        .set_key_value_metadata(Some(file_key_values(rows)))
        .build();

    let mut temp = tempfile::Builder::new()
        .prefix(".tmp-")
        .suffix(".partial")
        .tempfile_in(dir)?;
    {
        let mut writer = ArrowWriter::try_new(temp.as_file_mut(), batch.schema(), Some(props))?;
        writer.write(&batch)?;
        writer.close()?;
    }
    temp.as_file().sync_all()?;

    let target = dir.join(file_name);
    temp.persist_noclobber(&target).map_err(|err| err.error)?;
    sync_dir(dir);
    Ok(target)
}

#[cfg(unix)]
fn sync_dir(dir: &Path) {
    if let Err(err) = File::open(dir).and_then(|handle| handle.sync_all()) {
        tracing::debug!(dir = %dir.display(), error = %err, "directory fsync failed");
    }
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) {}

pub(crate) struct ParquetContents {
    pub batches: Vec<RecordBatch>,
    pub metadata: FileMetadata,
}

pub(crate) fn read_file(path: &Path) -> Result<ParquetContents, StoreError> {
    let file = File::open(path)?;
    let builder = ParquetRecordBatchReaderBuilder::try_new(file)?;
    let metadata = builder
        .metadata()
        .file_metadata()
        .key_value_metadata()
        .map(|key_values| {
            key_values
                .iter()
                .filter_map(|kv| kv.value.clone().map(|value| (kv.key.clone(), value)))
                .collect()
        })
        .unwrap_or_default();
    let reader = builder.build()?;
    let batches = reader.collect::<Result<Vec<_>, _>>()?;
    Ok(ParquetContents { batches, metadata })
}

/// Reads every row of a partitioned data file.
pub(crate) fn read_stored_rows(path: &Path) -> Result<Vec<StoredRow>, StoreError> {
    let contents = read_file(path)?;
    let mut rows = Vec::new();
    for batch in &contents.batches {
        rows.extend(decode_rows(batch, &contents.metadata, path)?);
    }
    Ok(rows)
}

fn required<'a>(
    batch: &'a RecordBatch,
    name: &str,
    path: &Path,
) -> Result<&'a ArrayRef, StoreError> {
    batch
        .column_by_name(name)
        .ok_or_else(|| StoreError::InvalidData {
            path: path.to_path_buf(),
            message: format!("missing column '{name}'"),
        })
}

pub(crate) fn decode_rows(
    batch: &RecordBatch,
    metadata: &FileMetadata,
    path: &Path,
) -> Result<Vec<StoredRow>, StoreError> {
    let organization = required(batch, "organization", path)?;
    let repository = required(batch, "repository", path)?;
    let pr_number = required(batch, "pr_number", path)?;
    let author = required(batch, "author", path)?;
    let created_at = batch.column_by_name("created_at");
    let merged_at = batch.column_by_name("merged_at");
    let closed_at = batch.column_by_name("closed_at");
    let additions = batch.column_by_name("additions");
    let deletions = batch.column_by_name("deletions");
    let is_draft = batch.column_by_name("is_draft");
    let batch_id = batch.column_by_name("batch_id");
    let batch_collected_at = batch.column_by_name("batch_collected_at");
    let absent_columns = batch.column_by_name(ABSENT_COLUMNS);

    let fallback_batch_id = metadata.get(BATCH_ID_KEY).cloned();
    let fallback_collected_at = metadata
        .get(BATCH_COLLECTED_AT_KEY)
        .and_then(|raw| parse_timestamp_text(raw));

    let mut rows = Vec::with_capacity(batch.num_rows());
    let mut skipped = 0usize;
    for row in 0..batch.num_rows() {
        let (Some(organization), Some(repository), Some(pr_number), Some(author)) = (
            string_at(organization.as_ref(), row),
            string_at(repository.as_ref(), row),
            u64_at(pr_number.as_ref(), row),
            string_at(author.as_ref(), row),
        ) else {
            skipped += 1;
            continue;
        };

        let collected_at = batch_collected_at
            .and_then(|array| timestamp_at(array.as_ref(), row))
            .or(fallback_collected_at)
            .ok_or_else(|| StoreError::InvalidData {
                path: path.to_path_buf(),
                message: "row has no batch_collected_at".to_owned(),
            })?;

        let absent = absent_columns
            .and_then(|array| string_set_at(array.as_ref(), row))
            .unwrap_or_default();
        let optional = |column: OptionalColumn| -> Option<&dyn Array> {
            batch
                .column_by_name(column.as_str())
                .filter(|_| !absent.contains(column.as_str()))
                .map(|array| array.as_ref())
        };

        let record = PullRequestRecord {
            organization,
            repository,
            pr_number,
            author,
            created_at: created_at.and_then(|array| timestamp_at(array.as_ref(), row)),
            merged_at: merged_at.and_then(|array| timestamp_at(array.as_ref(), row)),
            closed_at: closed_at.and_then(|array| timestamp_at(array.as_ref(), row)),
            additions: additions
                .and_then(|array| u64_at(array.as_ref(), row))
                .unwrap_or(0),
            deletions: deletions
                .and_then(|array| u64_at(array.as_ref(), row))
                .unwrap_or(0),
            is_draft: is_draft
                .and_then(|array| bool_at(array.as_ref(), row))
                .unwrap_or(false),
            changed_files: observe(optional(OptionalColumn::ChangedFiles), |array| {
                u64_at(array, row).unwrap_or(0)
            }),
            review_decision: observe(optional(OptionalColumn::ReviewDecision), |array| {
                string_at(array, row)
                    .map(|value| ReviewDecision::parse(&value))
                    .unwrap_or(ReviewDecision::NoDecision)
            }),
            reviews_count: observe(optional(OptionalColumn::ReviewsCount), |array| {
                u32_at(array, row)
            }),
            reviewers: observe(optional(OptionalColumn::Reviewers), |array| {
                string_set_at(array, row).unwrap_or_default()
            }),
            merged_by: observe(optional(OptionalColumn::MergedBy), |array| {
                string_at(array, row)
            }),
            comments_count: observe(optional(OptionalColumn::CommentsCount), |array| {
                u32_at(array, row)
            }),
            commits_count: observe(optional(OptionalColumn::CommitsCount), |array| {
                u32_at(array, row)
            }),
            time_to_first_review_hours: observe(
                optional(OptionalColumn::TimeToFirstReviewHours),
                |array| f64_at(array, row),
            ),
            labels: observe(optional(OptionalColumn::Labels), |array| {
                string_set_at(array, row).unwrap_or_default()
            }),
            updated_at: observe(optional(OptionalColumn::UpdatedAt), |array| {
                timestamp_at(array, row)
            }),
        };

        rows.push(StoredRow {
            record,
            batch_id: batch_id
                .and_then(|array| string_at(array.as_ref(), row))
                .or_else(|| fallback_batch_id.clone()),
            batch_collected_at: collected_at,
            source: path.to_path_buf(),
        });
    }

    if skipped > 0 {
        tracing::warn!(
            path = %path.display(),
            skipped,
            "skipped stored rows without an identity"
        );
    }
    Ok(rows)
}

fn observe<T>(array: Option<&dyn Array>, read: impl FnOnce(&dyn Array) -> T) -> Observed<T> {
    match array {
        Some(array) => Observed::Present(read(array)),
        None => Observed::Absent,
    }
}

pub(crate) fn string_at(array: &dyn Array, row: usize) -> Option<String> {
    if array.is_null(row) {
        return None;
    }
    match array.data_type() {
        DataType::Utf8 => Some(array.as_string::<i32>().value(row).to_owned()),
        DataType::LargeUtf8 => Some(array.as_string::<i64>().value(row).to_owned()),
        DataType::Utf8View => Some(array.as_string_view().value(row).to_owned()),
        _ => None,
    }
}

fn integer_at(array: &dyn Array, row: usize) -> Option<i128> {
    if array.is_null(row) {
        return None;
    }
    let value = match array.data_type() {
        DataType::Int8 => i128::from(array.as_primitive::<Int8Type>().value(row)),
        DataType::Int16 => i128::from(array.as_primitive::<Int16Type>().value(row)),
        DataType::Int32 => i128::from(array.as_primitive::<Int32Type>().value(row)),
        DataType::Int64 => i128::from(array.as_primitive::<Int64Type>().value(row)),
        DataType::UInt8 => i128::from(array.as_primitive::<UInt8Type>().value(row)),
        DataType::UInt16 => i128::from(array.as_primitive::<UInt16Type>().value(row)),
        DataType::UInt32 => i128::from(array.as_primitive::<UInt32Type>().value(row)),
        DataType::UInt64 => i128::from(array.as_primitive::<UInt64Type>().value(row)),
        DataType::Float32 | DataType::Float64 => {
            let value = f64_at(array, row)?;
            if !value.is_finite() {
                return None;
            }
            value.round() as i128
        }
        _ => return None,
    };
    Some(value)
}

pub(crate) fn u64_at(array: &dyn Array, row: usize) -> Option<u64> {
    integer_at(array, row).and_then(|value| u64::try_from(value).ok())
}

pub(crate) fn u32_at(array: &dyn Array, row: usize) -> u32 {
    integer_at(array, row)
        .map(|value| value.clamp(0, i128::from(u32::MAX)) as u32)
        .unwrap_or(0)
}

pub(crate) fn f64_at(array: &dyn Array, row: usize) -> Option<f64> {
    if array.is_null(row) {
        return None;
    }
    let value = match array.data_type() {
        DataType::Float64 => array.as_primitive::<Float64Type>().value(row),
        DataType::Float32 => f64::from(array.as_primitive::<Float32Type>().value(row)),
        _ => integer_at(array, row)? as f64,
    };
    value.is_finite().then_some(value)
}

pub(crate) fn bool_at(array: &dyn Array, row: usize) -> Option<bool> {
    if array.is_null(row) {
        return None;
    }
    match array.data_type() {
        DataType::Boolean => Some(array.as_boolean().value(row)),
        DataType::Utf8 | DataType::LargeUtf8 | DataType::Utf8View => {
            match string_at(array, row)?.trim().to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" => Some(true),
                "false" | "0" | "no" => Some(false),
                _ => None,
            }
        }
        _ => integer_at(array, row).map(|value| value != 0),
    }
}

pub(crate) fn timestamp_at(array: &dyn Array, row: usize) -> Option<DateTime<Utc>> {
    if array.is_null(row) {
        return None;
    }
    match array.data_type() {
        DataType::Timestamp(TimeUnit::Second, _) => {
            DateTime::from_timestamp(array.as_primitive::<TimestampSecondType>().value(row), 0)
        }
        DataType::Timestamp(TimeUnit::Millisecond, _) => DateTime::from_timestamp_millis(
            array.as_primitive::<TimestampMillisecondType>().value(row),
        ),
        DataType::Timestamp(TimeUnit::Microsecond, _) => DateTime::from_timestamp_micros(
            array.as_primitive::<TimestampMicrosecondType>().value(row),
        ),
        DataType::Timestamp(TimeUnit::Nanosecond, _) => Some(DateTime::from_timestamp_nanos(
            array.as_primitive::<TimestampNanosecondType>().value(row),
        )),
        DataType::Date32 => {
            let days = i64::from(array.as_primitive::<Date32Type>().value(row));
            DateTime::from_timestamp(days.checked_mul(86_400)?, 0)
        }
        DataType::Int64 => {
            DateTime::from_timestamp_millis(array.as_primitive::<Int64Type>().value(row))
        }
        DataType::Utf8 | DataType::LargeUtf8 | DataType::Utf8View => {
            parse_timestamp_text(&string_at(array, row)?)
        }
        _ => None,
    }
}

pub(crate) fn parse_timestamp_text(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }
    ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"]
        .into_iter()
        .find_map(|format| NaiveDateTime::parse_from_str(raw, format).ok())
        .map(|naive| naive.and_utc())
}

/// Lists decode element-wise; plain strings are treated as comma-separated values.
pub(crate) fn string_set_at(array: &dyn Array, row: usize) -> Option<BTreeSet<String>> {
    if array.is_null(row) {
        return None;
    }
    let items = match array.data_type() {
        DataType::List(_) => strings_of(array.as_list::<i32>().value(row).as_ref()),
        DataType::LargeList(_) => strings_of(array.as_list::<i64>().value(row).as_ref()),
        DataType::Utf8 | DataType::LargeUtf8 | DataType::Utf8View => string_at(array, row)?
            .split(',')
            .map(str::trim)
            .filter(|item| !item.is_empty())
            .map(str::to_owned)
            .collect(),
        _ => return None,
    };
    Some(items)
}

fn strings_of(values: &dyn Array) -> BTreeSet<String> {
    (0..values.len())
        .filter_map(|index| string_at(values, index))
        .collect()
}
