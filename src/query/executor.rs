//! Query execution
//!
//! Visits the planned files in catalog order, streams standardized chunks
//! to the sink, and answers from the catalog alone where it can: an
//! id-only projection never opens a file, and under distinct() a file whose
//! requested columns are all uniform contributes a single catalog row.

use crate::catalog::{BadFileRegistry, CatalogSnapshot, FileRecord};
use crate::config::DatasetConfig;
use crate::data::{CellValue, DatasetSchema};
use crate::engine::CancelToken;
use crate::query::standardize::{self, sort_dedup, source_batch_from_rows, Standardizer};
use crate::query::QueryPlan;
use crate::reader::{FileReader, ReadRequest, SourceTable};
use crate::sink::ResultSink;
use crate::{FuseError, Result};
use arrow::array::{ArrayRef, StringArray};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use std::sync::Arc;
use std::time::Duration;

/// Run a planned query. The executor is single-threaded; concurrency
/// across queries is the caller's business.
#[allow(clippy::too_many_arguments)]
pub fn execute_query(
    plan: &QueryPlan,
    schema: &DatasetSchema,
    config: &DatasetConfig,
    snapshot: &CatalogSnapshot,
    reader: &dyn FileReader,
    bad_files: &BadFileRegistry,
    sink: &mut dyn ResultSink,
    cancel: &CancelToken,
) -> Result<()> {
    if plan.id_only {
        return id_only_result(plan, schema, snapshot, sink);
    }

    let standardizer = Standardizer::new(schema, &snapshot.metas, plan);
    // distinct() buffers everything and finishes with one sorted,
    // deduplicated chunk
    let mut collected: Vec<RecordBatch> = Vec::new();
    let mut pending: Vec<Vec<Option<CellValue>>> = Vec::new();

    for &file_index in &plan.file_indices {
        if cancel.is_cancelled() {
            log::debug!("query cancelled between file scans");
            return sink.finish();
        }
        let row = &snapshot.files.rows()[file_index];

        if plan.distinct {
            let all_uniform = plan
                .read_cols
                .iter()
                .all(|&col| row.ranges[col].is_uniform(schema.column(col).ctype));
            if all_uniform {
                // one row per file, straight from the catalog
                pending.push(plan.read_cols.iter().map(|&col| row.ranges[col].min.clone()).collect());
                continue;
            }
            flush_pending(&mut pending, &standardizer, schema, plan, &mut collected)?;
        }

        let table = read_with_retry(plan, schema, config, snapshot, reader, bad_files, row)?;
        let id_value = schema.id_index.map(|col| row.ranges[col].min_text().to_string());
        if let Some(chunk) = standardizer.standardize(&table.batch, id_value.as_deref())? {
            if chunk.num_rows() > 0 {
                if plan.distinct {
                    collected.push(chunk);
                } else {
                    sink.write_some(chunk)?;
                }
            }
        }
        if cancel.is_cancelled() {
            log::debug!("query cancelled between chunks");
            return sink.finish();
        }
    }
    flush_pending(&mut pending, &standardizer, schema, plan, &mut collected)?;

    if plan.distinct {
        match sort_dedup(&collected)? {
            Some(batch) => sink.write_all_and_finish(batch),
            None => sink.finish(),
        }
    } else {
        sink.finish()
    }
}

/// Sole requested column is the id column: the distinct ids come straight
/// from the catalog, no file is opened.
fn id_only_result(
    plan: &QueryPlan,
    schema: &DatasetSchema,
    snapshot: &CatalogSnapshot,
    sink: &mut dyn ResultSink,
) -> Result<()> {
    let id_col = plan.result_cols[0];
    let mut ids: Vec<String> = plan
        .file_indices
        .iter()
        .map(|&fi| snapshot.files.rows()[fi].ranges[id_col].min_text().to_string())
        .collect();
    ids.sort();
    ids.dedup();
    ids.retain(|id| {
        plan.constraints
            .iter()
            .all(|c| c.col != id_col || standardize::test_text(c.op, id, &c.text, c.pattern.as_ref()))
    });

    let spec = schema.column(id_col);
    let out_schema = Arc::new(Schema::new(vec![Field::new(
        spec.dest_name.clone(),
        DataType::Utf8,
        true,
    )]));
    let array: ArrayRef = Arc::new(StringArray::from(ids));
    sink.write_all_and_finish(RecordBatch::try_new(out_schema, vec![array])?)
}

fn flush_pending(
    pending: &mut Vec<Vec<Option<CellValue>>>,
    standardizer: &Standardizer<'_>,
    schema: &DatasetSchema,
    plan: &QueryPlan,
    collected: &mut Vec<RecordBatch>,
) -> Result<()> {
    if pending.is_empty() {
        return Ok(());
    }
    let batch = source_batch_from_rows(schema, &plan.read_cols, pending)?;
    pending.clear();
    if let Some(chunk) = standardizer.standardize(&batch, None)? {
        if chunk.num_rows() > 0 {
            collected.push(chunk);
        }
    }
    Ok(())
}

/// Read one file, tolerating one transient failure. A file may be briefly
/// unavailable while it is being replaced; a second failure quarantines it
/// (local files only) and surfaces as retry-later.
fn read_with_retry(
    plan: &QueryPlan,
    schema: &DatasetSchema,
    config: &DatasetConfig,
    snapshot: &CatalogSnapshot,
    reader: &dyn FileReader,
    bad_files: &BadFileRegistry,
    row: &FileRecord,
) -> Result<SourceTable> {
    let request = ReadRequest {
        dir: snapshot.dirs.get(row.dir_index).unwrap_or("").to_string(),
        file_name: row.name.clone(),
        columns: plan
            .read_cols
            .iter()
            .filter(|&&col| !schema.is_id(col))
            .map(|&col| {
                let spec = schema.column(col);
                (spec.source_name.clone(), spec.ctype)
            })
            .collect(),
        sorted_spacing: row.sorted_spacing,
        min_sorted: plan.min_sorted,
        max_sorted: plan.max_sorted,
        get_metadata: false,
        must_get_all_data: true,
    };
    match reader.read(&request) {
        Ok(table) => Ok(table),
        Err(first) => {
            log::warn!("read of {} failed, retrying once: {}", row.name, first);
            std::thread::sleep(Duration::from_secs(1));
            match reader.read(&request) {
                Ok(table) => Ok(table),
                Err(second) => {
                    if config.files_are_local {
                        bad_files.mark(row.dir_index, &row.name, row.last_mod_ms, second.to_string());
                    }
                    Err(FuseError::RetryLater(format!("reading {}: {}", row.name, second)))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{ColumnRange, DirTable, FileTable};
    use crate::config::{DataVariableConfig, DatasetConfig};
    use crate::data::{Attributes, ColumnMeta, ColumnType};
    use crate::query::{plan_query, CompareOp, ConstraintValue, TableQuery};
    use crate::reader::test_support::{source_table, FakeReader};
    use crate::sink::BufferSink;
    use arrow::array::{Array, Float64Array};

    struct Fixture {
        config: DatasetConfig,
        schema: DatasetSchema,
        snapshot: CatalogSnapshot,
        reader: FakeReader,
        bad_files: BadFileRegistry,
    }

    fn fixture() -> Fixture {
        let config = DatasetConfig {
            dataset_id: "test_ds".to_string(),
            file_dir: "/data".to_string(),
            sorted_column_source_name: "TIME".to_string(),
            column_name_for_extract: "station".to_string(),
            extract_regex: "[a-z]+".to_string(),
            data_variables: vec![
                DataVariableConfig {
                    source_name: "TIME".to_string(),
                    dest_name: Some("time".to_string()),
                    data_type: ColumnType::Float64,
                    add_attributes: Attributes::new(),
                },
                DataVariableConfig {
                    source_name: "TEMP".to_string(),
                    dest_name: None,
                    data_type: ColumnType::Float64,
                    add_attributes: Attributes::new(),
                },
                DataVariableConfig {
                    source_name: "station".to_string(),
                    dest_name: None,
                    data_type: ColumnType::Text,
                    add_attributes: Attributes::new(),
                },
            ],
            ..Default::default()
        };
        let schema = config.resolve_schema().unwrap();

        let file = |name: &str, t: (f64, f64), temp: (f64, f64), id: &str| FileRecord {
            dir_index: 0,
            name: name.to_string(),
            last_mod_ms: 1000.0,
            sorted_spacing: 0.0,
            ranges: vec![
                ColumnRange {
                    min: Some(CellValue::Float64(t.0)),
                    max: Some(CellValue::Float64(t.1)),
                    has_missing: false,
                },
                ColumnRange {
                    min: Some(CellValue::Float64(temp.0)),
                    max: Some(CellValue::Float64(temp.1)),
                    has_missing: false,
                },
                ColumnRange {
                    min: Some(CellValue::Text(id.to_string())),
                    max: Some(CellValue::Text(id.to_string())),
                    has_missing: false,
                },
            ],
        };
        let files = FileTable::from_rows(
            3,
            vec![
                file("a.dat", (0.0, 10.0), (1.0, 3.0), "a"),
                file("b.dat", (20.0, 30.0), (4.0, 4.0), "b"),
            ],
        );
        let aggregate = files.aggregate();
        let snapshot = CatalogSnapshot {
            dirs: DirTable::from_dirs(vec!["/data".to_string()]),
            files,
            aggregate,
            metas: vec![ColumnMeta::default(), ColumnMeta::default(), ColumnMeta::default()],
            global_attrs: Attributes::new(),
        };

        let reader = FakeReader::new();
        reader.insert(
            "/data",
            "a.dat",
            source_table(
                &[
                    ("TIME", vec![Some(0.0), Some(5.0), Some(10.0)]),
                    ("TEMP", vec![Some(1.0), Some(2.0), Some(3.0)]),
                ],
                &[],
            ),
        );
        reader.insert(
            "/data",
            "b.dat",
            source_table(
                &[
                    ("TIME", vec![Some(20.0), Some(30.0)]),
                    ("TEMP", vec![Some(4.0), Some(4.0)]),
                ],
                &[],
            ),
        );

        Fixture { config, schema, snapshot, reader, bad_files: BadFileRegistry::new() }
    }

    fn run(fixture: &Fixture, query: &TableQuery) -> Result<BufferSink> {
        let plan = plan_query(query, &fixture.schema, &fixture.config, &fixture.snapshot)?;
        let mut sink = BufferSink::new();
        execute_query(
            &plan,
            &fixture.schema,
            &fixture.config,
            &fixture.snapshot,
            &fixture.reader,
            &fixture.bad_files,
            &mut sink,
            &CancelToken::new(),
        )?;
        Ok(sink)
    }

    #[test]
    fn test_point_query_between_files_opens_nothing() {
        let fixture = fixture();
        let query = TableQuery::select(&["time"]).with_constraint(
            "time",
            CompareOp::Eq,
            ConstraintValue::Number(15.0),
        );
        let sink = run(&fixture, &query).unwrap();
        assert!(sink.finished);
        assert_eq!(sink.total_rows(), 0);
        assert_eq!(fixture.reader.read_count("/data", "a.dat"), 0);
        assert_eq!(fixture.reader.read_count("/data", "b.dat"), 0);
    }

    #[test]
    fn test_uniform_text_file_returns_all_rows() {
        let fixture = fixture();
        let query = TableQuery::select(&["time", "station"]).with_constraint(
            "station",
            CompareOp::Eq,
            ConstraintValue::Text("a".to_string()),
        );
        let sink = run(&fixture, &query).unwrap();
        // only a.dat matches; it is scanned and the precise re-filter keeps
        // every row because the id is uniform
        assert_eq!(fixture.reader.read_count("/data", "a.dat"), 1);
        assert_eq!(fixture.reader.read_count("/data", "b.dat"), 0);
        assert_eq!(sink.total_rows(), 3);
        let batch = &sink.batches[0];
        assert_eq!(batch.schema().field(0).name(), "time");
        assert_eq!(batch.schema().field(1).name(), "station");
        let stations = batch.column(1).as_any().downcast_ref::<StringArray>().unwrap();
        assert_eq!(stations.value(0), "a");
    }

    #[test]
    fn test_precise_refilter_drops_rows_inside_admitted_file() {
        let fixture = fixture();
        let query = TableQuery::select(&["time"]).with_constraint(
            "time",
            CompareOp::Ge,
            ConstraintValue::Number(5.0),
        );
        let sink = run(&fixture, &query).unwrap();
        // a.dat is admitted by its range [0, 10] but only rows 5 and 10
        // survive; b.dat contributes both rows
        assert_eq!(sink.total_rows(), 4);
        let times = sink.batches[0].column(0).as_any().downcast_ref::<Float64Array>().unwrap();
        assert_eq!(times.value(0), 5.0);
    }

    #[test]
    fn test_retry_then_quarantine() {
        let fixture = fixture();
        fixture.reader.fail_times("/data", "a.dat", 2);
        let query = TableQuery::select(&["time"]);
        let err = run(&fixture, &query).unwrap_err();
        assert!(matches!(err, FuseError::RetryLater(_)));
        assert_eq!(fixture.reader.read_count("/data", "a.dat"), 2);
        assert!(fixture.bad_files.is_bad(0, "a.dat", 1000.0));
    }

    #[test]
    fn test_single_transient_failure_recovers() {
        let fixture = fixture();
        fixture.reader.fail_times("/data", "a.dat", 1);
        let query = TableQuery::select(&["time"]);
        let sink = run(&fixture, &query).unwrap();
        assert_eq!(sink.total_rows(), 5);
        assert_eq!(fixture.reader.read_count("/data", "a.dat"), 2);
        assert!(fixture.bad_files.is_empty());
    }

    #[test]
    fn test_remote_failure_not_quarantined() {
        let mut fixture = fixture();
        fixture.config.files_are_local = false;
        fixture.reader.fail_times("/data", "a.dat", 2);
        let query = TableQuery::select(&["time"]);
        assert!(run(&fixture, &query).is_err());
        assert!(fixture.bad_files.is_empty());
    }

    #[test]
    fn test_id_only_short_circuit() {
        let fixture = fixture();
        let query = TableQuery::select(&["station"]);
        let sink = run(&fixture, &query).unwrap();
        assert_eq!(fixture.reader.read_count("/data", "a.dat"), 0);
        assert_eq!(sink.total_rows(), 2);
        let ids = sink.batches[0].column(0).as_any().downcast_ref::<StringArray>().unwrap();
        assert_eq!(ids.value(0), "a");
        assert_eq!(ids.value(1), "b");
    }

    #[test]
    fn test_distinct_uniform_files_answered_from_catalog() {
        let fixture = fixture();
        // station is uniform in both files; TEMP is uniform only in b.dat
        let query = TableQuery::select(&["station", "TEMP"]).distinct();
        let sink = run(&fixture, &query).unwrap();
        // a.dat has TEMP range [1, 3]: not uniform, so it is scanned;
        // b.dat is uniform in both columns and never opened
        assert_eq!(fixture.reader.read_count("/data", "a.dat"), 1);
        assert_eq!(fixture.reader.read_count("/data", "b.dat"), 0);
        assert!(sink.finished);

        // one batch, sorted and deduplicated
        assert_eq!(sink.batches.len(), 1);
        let batch = &sink.batches[0];
        assert_eq!(batch.num_rows(), 4);
        let stations = batch.column(0).as_any().downcast_ref::<StringArray>().unwrap();
        assert_eq!(stations.value(0), "a");
        assert_eq!(stations.value(3), "b");
    }

    #[test]
    fn test_distinct_equals_sorted_dedup_of_plain_query() {
        let fixture = fixture();
        let plain = TableQuery::select(&["station", "TEMP"]);
        let distinct = plain.clone().distinct();

        let plain_sink = run(&fixture, &plain).unwrap();
        let expected = sort_dedup(&plain_sink.batches).unwrap().unwrap();

        let distinct_sink = run(&fixture, &distinct).unwrap();
        assert_eq!(distinct_sink.batches.len(), 1);
        assert_eq!(distinct_sink.batches[0], expected);
    }

    #[test]
    fn test_cancellation_is_clean() {
        let fixture = fixture();
        let query = TableQuery::select(&["time"]);
        let plan = plan_query(&query, &fixture.schema, &fixture.config, &fixture.snapshot).unwrap();
        let cancel = CancelToken::new();
        cancel.cancel();
        let mut sink = BufferSink::new();
        execute_query(
            &plan,
            &fixture.schema,
            &fixture.config,
            &fixture.snapshot,
            &fixture.reader,
            &fixture.bad_files,
            &mut sink,
            &cancel,
        )
        .unwrap();
        assert!(sink.finished);
        assert_eq!(sink.total_rows(), 0);
        assert_eq!(fixture.reader.read_count("/data", "a.dat"), 0);
    }
}
