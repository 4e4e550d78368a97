// Arrow conversions for the federation engine
//
// Shard rows become one RecordBatch per logic table; DataFusion output batches
// come back as rows of `Value`.

use chrono::{DateTime, NaiveDate};
use datafusion::arrow::array::*;
use datafusion::arrow::datatypes::{DataType, Field, Schema, SchemaRef, TimeUnit};
use datafusion::arrow::record_batch::RecordBatch;
use datafusion::arrow::util::display::array_value_to_string;
use std::sync::Arc;

use crate::api::middleware::AppError;
use crate::models::Value;

/// Arrow type that holds every non-null value of a column
fn column_type<'a>(values: impl Iterator<Item = &'a Value>) -> DataType {
    let mut found: Option<DataType> = None;
    for value in values {
        let candidate = match value {
            Value::Null => continue,
            Value::Bool(_) => DataType::Boolean,
            Value::Int(_) => DataType::Int64,
            Value::Float(_) => DataType::Float64,
            Value::Text(_) => DataType::Utf8,
        };
        found = Some(match (found, candidate) {
            (None, c) => c,
            (Some(a), b) if a == b => a,
            (Some(DataType::Int64), DataType::Float64) | (Some(DataType::Float64), DataType::Int64) => DataType::Float64,
            _ => DataType::Utf8,
        });
    }
    // all-null columns coerce to whatever they are compared with
    found.unwrap_or(DataType::Null)
}

fn build_array(data_type: &DataType, values: &[&Value]) -> ArrayRef {
    match data_type {
        DataType::Boolean => {
            let mut builder = BooleanBuilder::with_capacity(values.len());
            for value in values {
                match value {
                    Value::Bool(b) => builder.append_value(*b),
                    _ => builder.append_null(),
                }
            }
            Arc::new(builder.finish())
        }
        DataType::Int64 => {
            let mut builder = Int64Builder::with_capacity(values.len());
            for value in values {
                builder.append_option(value.as_i64());
            }
            Arc::new(builder.finish())
        }
        DataType::Float64 => {
            let mut builder = Float64Builder::with_capacity(values.len());
            for value in values {
                builder.append_option(value.as_f64());
            }
            Arc::new(builder.finish())
        }
        DataType::Utf8 => {
            let mut builder = StringBuilder::new();
            for value in values {
                match value {
                    Value::Null => builder.append_null(),
                    Value::Text(s) => builder.append_value(s),
                    other => builder.append_value(other.to_string()),
                }
            }
            Arc::new(builder.finish())
        }
        _ => new_null_array(&DataType::Null, values.len()),
    }
}

/// Build one batch from shard rows
///
/// # Arguments
/// * `columns` - Column labels, shared by every row
/// * `rows` - Rows gathered from all nodes of one logic table
pub fn rows_to_batch(columns: &[String], rows: &[Vec<Value>]) -> Result<RecordBatch, AppError> {
    let mut fields = Vec::with_capacity(columns.len());
    let mut arrays = Vec::with_capacity(columns.len());
    for (index, name) in columns.iter().enumerate() {
        let values: Vec<&Value> = rows
            .iter()
            .map(|row| {
                row.get(index).ok_or_else(|| {
                    AppError::MergeInvariant(format!("Row of width {} lacks column '{}'", row.len(), name))
                })
            })
            .collect::<Result<_, _>>()?;
        let data_type = column_type(values.iter().copied());
        fields.push(Field::new(name.to_lowercase(), data_type.clone(), true));
        arrays.push(build_array(&data_type, &values));
    }
    let schema: SchemaRef = Arc::new(Schema::new(fields));
    Ok(RecordBatch::try_new(schema, arrays)?)
}

macro_rules! downcast {
    ($array:expr, $ty:ty) => {
        $array.as_any().downcast_ref::<$ty>().ok_or_else(|| {
            AppError::Internal(format!("Failed to downcast to {}", stringify!($ty)))
        })?
    };
}

/// Convert one cell of an Arrow array
fn array_value(array: &ArrayRef, row: usize) -> Result<Value, AppError> {
    if array.is_null(row) {
        return Ok(Value::Null);
    }
    let value = match array.data_type() {
        DataType::Boolean => Value::Bool(downcast!(array, BooleanArray).value(row)),
        DataType::Int8 => Value::Int(i64::from(downcast!(array, Int8Array).value(row))),
        DataType::Int16 => Value::Int(i64::from(downcast!(array, Int16Array).value(row))),
        DataType::Int32 => Value::Int(i64::from(downcast!(array, Int32Array).value(row))),
        DataType::Int64 => Value::Int(downcast!(array, Int64Array).value(row)),
        DataType::UInt8 => Value::Int(i64::from(downcast!(array, UInt8Array).value(row))),
        DataType::UInt16 => Value::Int(i64::from(downcast!(array, UInt16Array).value(row))),
        DataType::UInt32 => Value::Int(i64::from(downcast!(array, UInt32Array).value(row))),
        DataType::UInt64 => {
            let v = downcast!(array, UInt64Array).value(row);
            i64::try_from(v).map(Value::Int).unwrap_or(Value::Float(v as f64))
        }
        DataType::Float32 => Value::Float(f64::from(downcast!(array, Float32Array).value(row))),
        DataType::Float64 => Value::Float(downcast!(array, Float64Array).value(row)),
        DataType::Decimal128(_, scale) => {
            let raw = downcast!(array, Decimal128Array).value(row);
            Value::Float(raw as f64 / 10_f64.powi(i32::from(*scale)))
        }
        DataType::Utf8 => Value::Text(downcast!(array, StringArray).value(row).to_string()),
        DataType::LargeUtf8 => Value::Text(downcast!(array, LargeStringArray).value(row).to_string()),
        DataType::Utf8View => Value::Text(downcast!(array, StringViewArray).value(row).to_string()),
        DataType::Date32 => {
            let days = downcast!(array, Date32Array).value(row);
            // Date32 counts days since the Unix epoch
            let date = NaiveDate::from_num_days_from_ce_opt(days + 719_163)
                .ok_or_else(|| AppError::Internal(format!("Invalid date value {}", days)))?;
            Value::Text(date.format("%Y-%m-%d").to_string())
        }
        DataType::Timestamp(unit, _) => {
            let timestamp = match unit {
                TimeUnit::Second => DateTime::from_timestamp(downcast!(array, TimestampSecondArray).value(row), 0),
                TimeUnit::Millisecond => {
                    DateTime::from_timestamp_millis(downcast!(array, TimestampMillisecondArray).value(row))
                }
                TimeUnit::Microsecond => {
                    DateTime::from_timestamp_micros(downcast!(array, TimestampMicrosecondArray).value(row))
                }
                TimeUnit::Nanosecond => Some(DateTime::from_timestamp_nanos(
                    downcast!(array, TimestampNanosecondArray).value(row),
                )),
            };
            let timestamp = timestamp.ok_or_else(|| AppError::Internal("Invalid timestamp value".to_string()))?;
            Value::Text(timestamp.to_rfc3339())
        }
        _ => Value::Text(array_value_to_string(array, row)?),
    };
    Ok(value)
}

/// Flatten output batches into rows
pub fn batches_to_rows(batches: &[RecordBatch]) -> Result<Vec<Vec<Value>>, AppError> {
    let mut rows = Vec::new();
    for batch in batches {
        for row in 0..batch.num_rows() {
            rows.push(
                batch
                    .columns()
                    .iter()
                    .map(|column| array_value(column, row))
                    .collect::<Result<Vec<_>, _>>()?,
            );
        }
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_column_types_widen() {
        let values = [Value::Int(1), Value::Null, Value::Float(2.5)];
        assert_eq!(column_type(values.iter()), DataType::Float64);
        let mixed = [Value::Int(1), Value::Text("x".into())];
        assert_eq!(column_type(mixed.iter()), DataType::Utf8);
        assert_eq!(column_type([Value::Null].iter()), DataType::Null);
    }

    #[test]
    fn test_rows_survive_batch_conversion() {
        let columns = vec!["id".to_string(), "name".to_string(), "score".to_string()];
        let rows = vec![
            vec![Value::Int(1), Value::Text("a".into()), Value::Float(1.5)],
            vec![Value::Int(2), Value::Null, Value::Null],
        ];
        let batch = rows_to_batch(&columns, &rows).unwrap();
        assert_eq!(batch.num_rows(), 2);
        assert_eq!(batch.schema().field(1).data_type(), &DataType::Utf8);
        assert_eq!(batches_to_rows(&[batch]).unwrap(), rows);
    }

    #[test]
    fn test_output_types() {
        let schema = Arc::new(Schema::new(vec![
            Field::new("small", DataType::Int32, false),
            Field::new("flag", DataType::Boolean, true),
            Field::new("day", DataType::Date32, false),
        ]));
        let batch = RecordBatch::try_new(
            schema,
            vec![
                Arc::new(Int32Array::from(vec![7])),
                Arc::new(BooleanArray::from(vec![None])),
                Arc::new(Date32Array::from(vec![0])),
            ],
        )
        .unwrap();
        assert_eq!(
            batches_to_rows(&[batch]).unwrap(),
            vec![vec![Value::Int(7), Value::Null, Value::Text("1970-01-01".into())]]
        );
    }

    #[test]
    fn test_empty_table_has_schema() {
        let batch = rows_to_batch(&["a".to_string()], &[]).unwrap();
        assert_eq!(batch.num_rows(), 0);
        assert_eq!(batch.schema().fields().len(), 1);
    }
}
