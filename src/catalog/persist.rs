//! Atomic persistence of catalog state
//!
//! The per-dataset state directory holds three self-describing columnar
//! containers (Arrow IPC stream files): `directoryTable`, `fileTable` and
//! `badFiles`. Saves write temp files and rename them into place so a crash
//! at any point leaves the previous state readable.

use crate::catalog::{BadFileEntry, BadFileRegistry, ColumnRange, DirTable, FileRecord, FileTable};
use crate::data::{CellValue, ColumnSpec, ColumnType};
use crate::{FuseError, Result};
use arrow::array::{
    Array, ArrayRef, Float32Array, Float64Array, Int16Array, Int32Array, Int64Array, Int8Array,
    StringArray,
};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::ipc::reader::StreamReader;
use arrow::ipc::writer::StreamWriter;
use arrow::record_batch::RecordBatch;
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

pub const DIR_TABLE_FILENAME: &str = "directoryTable";
pub const FILE_TABLE_FILENAME: &str = "fileTable";
pub const BAD_FILES_FILENAME: &str = "badFiles";

fn arrow_type(ctype: ColumnType) -> DataType {
    match ctype {
        ColumnType::Int8 => DataType::Int8,
        ColumnType::Int16 => DataType::Int16,
        ColumnType::Int32 => DataType::Int32,
        ColumnType::Int64 => DataType::Int64,
        ColumnType::Float32 => DataType::Float32,
        ColumnType::Float64 => DataType::Float64,
        ColumnType::Text => DataType::Utf8,
    }
}

/// Save catalog, directory table and bad-file registry. All three are
/// written to temp paths first, then renamed into place: badFiles first (or
/// deleted when the registry is empty), directoryTable second, fileTable
/// last, so a partial failure never leaves the catalog referencing an
/// undefined directory. On failure the temps are deleted and the previous
/// files remain untouched.
pub fn save_state(
    state_dir: &Path,
    dirs: &DirTable,
    files: &FileTable,
    columns: &[ColumnSpec],
    bad: &BadFileRegistry,
) -> Result<()> {
    std::fs::create_dir_all(state_dir)?;
    let nonce = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);

    let dir_path = state_dir.join(DIR_TABLE_FILENAME);
    let file_path = state_dir.join(FILE_TABLE_FILENAME);
    let bad_path = state_dir.join(BAD_FILES_FILENAME);
    let tmp = |path: &Path| -> PathBuf {
        let mut name = path.file_name().unwrap_or_default().to_os_string();
        name.push(format!(".{:x}.tmp", nonce));
        path.with_file_name(name)
    };
    let (dir_tmp, file_tmp, bad_tmp) = (tmp(&dir_path), tmp(&file_path), tmp(&bad_path));

    let cleanup = |paths: &[&PathBuf]| {
        for p in paths {
            let _ = std::fs::remove_file(p);
        }
    };

    let result = (|| -> Result<()> {
        write_batch(&dir_tmp, &dir_table_batch(dirs)?)?;
        write_batch(&file_tmp, &file_table_batch(files, columns)?)?;
        if !bad.is_empty() {
            write_batch(&bad_tmp, &bad_files_batch(bad)?)?;
        }

        // Rename order matters; see module docs.
        if bad.is_empty() {
            match std::fs::remove_file(&bad_path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        } else {
            std::fs::rename(&bad_tmp, &bad_path)?;
        }
        std::fs::rename(&dir_tmp, &dir_path)?;
        std::fs::rename(&file_tmp, &file_path)?;
        Ok(())
    })();

    if let Err(e) = result {
        cleanup(&[&dir_tmp, &file_tmp, &bad_tmp]);
        return Err(FuseError::Persist(format!(
            "saving catalog state under {}: {}",
            state_dir.display(),
            e
        )));
    }
    Ok(())
}

/// Load previously persisted state. Missing or corrupt directoryTable /
/// fileTable yields None for that part (the caller rebuilds); the bad-file
/// map defaults to empty.
#[allow(clippy::type_complexity)]
pub fn load_state(
    state_dir: &Path,
    columns: &[ColumnSpec],
) -> (Option<DirTable>, Option<FileTable>, HashMap<(u16, String), BadFileEntry>) {
    let dirs = match read_batch(&state_dir.join(DIR_TABLE_FILENAME)) {
        Ok(Some(batch)) => parse_dir_table(&batch),
        Ok(None) => None,
        Err(e) => {
            log::warn!("discarding unreadable directoryTable: {}", e);
            None
        }
    };
    let files = match read_batch(&state_dir.join(FILE_TABLE_FILENAME)) {
        Ok(Some(batch)) => parse_file_table(&batch, columns),
        Ok(None) => None,
        Err(e) => {
            log::warn!("discarding unreadable fileTable: {}", e);
            None
        }
    };
    let bad = match read_batch(&state_dir.join(BAD_FILES_FILENAME)) {
        Ok(Some(batch)) => parse_bad_files(&batch).unwrap_or_default(),
        Ok(None) => HashMap::new(),
        Err(e) => {
            log::warn!("discarding unreadable badFiles: {}", e);
            HashMap::new()
        }
    };
    (dirs, files, bad)
}

// ======================== batch construction ========================

fn dir_table_batch(dirs: &DirTable) -> Result<RecordBatch> {
    let schema = Arc::new(Schema::new(vec![Field::new("dirName", DataType::Utf8, false)]));
    let names: Vec<&str> = dirs.dirs().iter().map(|s| s.as_str()).collect();
    let array: ArrayRef = Arc::new(StringArray::from(names));
    Ok(RecordBatch::try_new(schema, vec![array])?)
}

fn file_table_batch(files: &FileTable, columns: &[ColumnSpec]) -> Result<RecordBatch> {
    let rows = files.rows();
    let mut fields = vec![
        Field::new("dirIndex", DataType::Int16, false),
        Field::new("fileName", DataType::Utf8, false),
        Field::new("lastMod", DataType::Float64, false),
        Field::new("sortedSpacing", DataType::Float64, false),
    ];
    let mut arrays: Vec<ArrayRef> = vec![
        Arc::new(Int16Array::from(
            rows.iter().map(|r| r.dir_index as i16).collect::<Vec<_>>(),
        )),
        Arc::new(StringArray::from(
            rows.iter().map(|r| r.name.as_str()).collect::<Vec<_>>(),
        )),
        Arc::new(Float64Array::from(
            rows.iter().map(|r| r.last_mod_ms).collect::<Vec<_>>(),
        )),
        Arc::new(Float64Array::from(
            rows.iter().map(|r| r.sorted_spacing).collect::<Vec<_>>(),
        )),
    ];

    for (col, spec) in columns.iter().enumerate() {
        let dtype = arrow_type(spec.ctype);
        fields.push(Field::new(format!("{}_min", spec.source_name), dtype.clone(), true));
        fields.push(Field::new(format!("{}_max", spec.source_name), dtype, true));
        fields.push(Field::new(format!("{}_hasNaN", spec.source_name), DataType::Int8, false));

        arrays.push(range_array(rows, col, spec.ctype, |r| r.min.as_ref()));
        arrays.push(range_array(rows, col, spec.ctype, |r| r.max.as_ref()));
        arrays.push(Arc::new(Int8Array::from(
            rows.iter()
                .map(|r| r.ranges[col].has_missing as i8)
                .collect::<Vec<_>>(),
        )));
    }

    Ok(RecordBatch::try_new(Arc::new(Schema::new(fields)), arrays)?)
}

fn range_array<'a>(
    rows: &'a [FileRecord],
    col: usize,
    ctype: ColumnType,
    pick: impl Fn(&'a ColumnRange) -> Option<&'a CellValue>,
) -> ArrayRef {
    macro_rules! numeric {
        ($arr_ty:ty, $prim:ty) => {{
            let values: Vec<Option<$prim>> = rows
                .iter()
                .map(|r| pick(&r.ranges[col]).map(|v| v.as_f64() as $prim))
                .collect();
            Arc::new(<$arr_ty>::from(values)) as ArrayRef
        }};
    }
    match ctype {
        ColumnType::Int8 => numeric!(Int8Array, i8),
        ColumnType::Int16 => numeric!(Int16Array, i16),
        ColumnType::Int32 => numeric!(Int32Array, i32),
        ColumnType::Int64 => numeric!(Int64Array, i64),
        ColumnType::Float32 => numeric!(Float32Array, f32),
        ColumnType::Float64 => numeric!(Float64Array, f64),
        ColumnType::Text => {
            let values: Vec<Option<&str>> = rows
                .iter()
                .map(|r| pick(&r.ranges[col]).and_then(|v| v.as_text()))
                .collect();
            Arc::new(StringArray::from(values)) as ArrayRef
        }
    }
}

fn bad_files_batch(bad: &BadFileRegistry) -> Result<RecordBatch> {
    let entries = bad.snapshot();
    let schema = Arc::new(Schema::new(vec![
        Field::new("dirIndex", DataType::Int16, false),
        Field::new("fileName", DataType::Utf8, false),
        Field::new("lastMod", DataType::Float64, false),
        Field::new("reason", DataType::Utf8, false),
    ]));
    let arrays: Vec<ArrayRef> = vec![
        Arc::new(Int16Array::from(
            entries.iter().map(|((d, _), _)| *d as i16).collect::<Vec<_>>(),
        )),
        Arc::new(StringArray::from(
            entries.iter().map(|((_, n), _)| n.as_str()).collect::<Vec<_>>(),
        )),
        Arc::new(Float64Array::from(
            entries.iter().map(|(_, e)| e.last_mod_ms).collect::<Vec<_>>(),
        )),
        Arc::new(StringArray::from(
            entries.iter().map(|(_, e)| e.reason.as_str()).collect::<Vec<_>>(),
        )),
    ];
    Ok(RecordBatch::try_new(schema, arrays)?)
}

// ======================== parsing ========================

fn parse_dir_table(batch: &RecordBatch) -> Option<DirTable> {
    if batch.num_columns() != 1 || batch.schema().field(0).name() != "dirName" {
        log::warn!("directoryTable has unexpected column arrangement, discarding");
        return None;
    }
    let names = batch.column(0).as_any().downcast_ref::<StringArray>()?;
    Some(DirTable::from_dirs(
        (0..names.len()).map(|i| names.value(i).to_string()).collect(),
    ))
}

fn parse_file_table(batch: &RecordBatch, columns: &[ColumnSpec]) -> Option<FileTable> {
    let schema = batch.schema();
    let expect = |idx: usize, name: &str, dtype: &DataType| -> bool {
        idx < batch.num_columns()
            && schema.field(idx).name() == name
            && schema.field(idx).data_type() == dtype
    };
    let mut ok = expect(0, "dirIndex", &DataType::Int16)
        && expect(1, "fileName", &DataType::Utf8)
        && expect(2, "lastMod", &DataType::Float64)
        && expect(3, "sortedSpacing", &DataType::Float64)
        && batch.num_columns() == 4 + 3 * columns.len();
    if ok {
        for (col, spec) in columns.iter().enumerate() {
            let dtype = arrow_type(spec.ctype);
            ok = ok
                && expect(4 + col * 3, &format!("{}_min", spec.source_name), &dtype)
                && expect(5 + col * 3, &format!("{}_max", spec.source_name), &dtype)
                && expect(6 + col * 3, &format!("{}_hasNaN", spec.source_name), &DataType::Int8);
        }
    }
    if !ok {
        log::warn!("fileTable has unexpected column arrangement, discarding");
        return None;
    }

    let dir_index = batch.column(0).as_any().downcast_ref::<Int16Array>()?;
    let file_name = batch.column(1).as_any().downcast_ref::<StringArray>()?;
    let last_mod = batch.column(2).as_any().downcast_ref::<Float64Array>()?;
    let sorted_spacing = batch.column(3).as_any().downcast_ref::<Float64Array>()?;

    let mut rows = Vec::with_capacity(batch.num_rows());
    for row in 0..batch.num_rows() {
        let mut ranges = Vec::with_capacity(columns.len());
        for (col, spec) in columns.iter().enumerate() {
            let min = parse_cell(batch.column(4 + col * 3), spec.ctype, row)?;
            let max = parse_cell(batch.column(5 + col * 3), spec.ctype, row)?;
            let has_missing = batch
                .column(6 + col * 3)
                .as_any()
                .downcast_ref::<Int8Array>()?
                .value(row)
                != 0;
            ranges.push(ColumnRange { min, max, has_missing });
        }
        rows.push(FileRecord {
            dir_index: dir_index.value(row) as u16,
            name: file_name.value(row).to_string(),
            last_mod_ms: last_mod.value(row),
            sorted_spacing: sorted_spacing.value(row),
            ranges,
        });
    }
    Some(FileTable::from_rows(columns.len(), rows))
}

fn parse_cell(array: &ArrayRef, ctype: ColumnType, row: usize) -> Option<Option<CellValue>> {
    macro_rules! numeric {
        ($arr_ty:ty, $variant:ident) => {{
            let arr = array.as_any().downcast_ref::<$arr_ty>()?;
            if arr.is_null(row) {
                Some(None)
            } else {
                Some(Some(CellValue::$variant(arr.value(row))))
            }
        }};
    }
    match ctype {
        ColumnType::Int8 => numeric!(Int8Array, Int8),
        ColumnType::Int16 => numeric!(Int16Array, Int16),
        ColumnType::Int32 => numeric!(Int32Array, Int32),
        ColumnType::Int64 => numeric!(Int64Array, Int64),
        ColumnType::Float32 => numeric!(Float32Array, Float32),
        ColumnType::Float64 => numeric!(Float64Array, Float64),
        ColumnType::Text => {
            let arr = array.as_any().downcast_ref::<StringArray>()?;
            if arr.is_null(row) {
                Some(None)
            } else {
                Some(Some(CellValue::Text(arr.value(row).to_string())))
            }
        }
    }
}

fn parse_bad_files(batch: &RecordBatch) -> Option<HashMap<(u16, String), BadFileEntry>> {
    let dir_index = batch.column(0).as_any().downcast_ref::<Int16Array>()?;
    let file_name = batch.column(1).as_any().downcast_ref::<StringArray>()?;
    let last_mod = batch.column(2).as_any().downcast_ref::<Float64Array>()?;
    let reason = batch.column(3).as_any().downcast_ref::<StringArray>()?;
    let mut out = HashMap::new();
    for row in 0..batch.num_rows() {
        out.insert(
            (dir_index.value(row) as u16, file_name.value(row).to_string()),
            BadFileEntry {
                last_mod_ms: last_mod.value(row),
                reason: reason.value(row).to_string(),
            },
        );
    }
    Some(out)
}

// ======================== IPC plumbing ========================

fn write_batch(path: &Path, batch: &RecordBatch) -> Result<()> {
    let file = File::create(path)?;
    let mut writer = BufWriter::with_capacity(64 * 1024, file);
    let mut stream_writer = StreamWriter::try_new(&mut writer, &batch.schema())?;
    stream_writer.write(batch)?;
    stream_writer.finish()?;
    Ok(())
}

fn read_batch(path: &Path) -> Result<Option<RecordBatch>> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let reader = StreamReader::try_new(BufReader::new(file), None)?;
    let mut batches = Vec::new();
    for batch in reader {
        batches.push(batch?);
    }
    if batches.len() > 1 {
        return Err(FuseError::Persist(format!(
            "{} holds more than one batch",
            path.display()
        )));
    }
    Ok(batches.pop())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Attributes;
    use tempfile::tempdir;

    fn columns() -> Vec<ColumnSpec> {
        vec![
            ColumnSpec {
                source_name: "TIME".into(),
                dest_name: "time".into(),
                ctype: ColumnType::Float64,
                add_attrs: Attributes::new(),
            },
            ColumnSpec {
                source_name: "station".into(),
                dest_name: "station".into(),
                ctype: ColumnType::Text,
                add_attrs: Attributes::new(),
            },
        ]
    }

    fn sample_table() -> (DirTable, FileTable) {
        let mut dirs = DirTable::new();
        dirs.intern("/data").unwrap();
        let rows = vec![FileRecord {
            dir_index: 0,
            name: "a.dat".into(),
            last_mod_ms: 123456.0,
            sorted_spacing: 10.0,
            ranges: vec![
                ColumnRange {
                    min: Some(CellValue::Float64(0.0)),
                    max: Some(CellValue::Float64(10.0)),
                    has_missing: false,
                },
                ColumnRange {
                    min: Some(CellValue::Text("A".into())),
                    max: Some(CellValue::Text("A".into())),
                    has_missing: true,
                },
            ],
        }];
        (dirs, FileTable::from_rows(2, rows))
    }

    #[test]
    fn test_save_load_round_trip() {
        let dir = tempdir().unwrap();
        let (dirs, files) = sample_table();
        let bad = BadFileRegistry::new();
        bad.mark(0, "broken.dat", 99.0, "unreadable");

        save_state(dir.path(), &dirs, &files, &columns(), &bad).unwrap();
        let (loaded_dirs, loaded_files, loaded_bad) = load_state(dir.path(), &columns());

        assert_eq!(loaded_dirs.unwrap(), dirs);
        assert_eq!(loaded_files.unwrap(), files);
        assert_eq!(loaded_bad.len(), 1);
        assert_eq!(loaded_bad[&(0, "broken.dat".to_string())].reason, "unreadable");
    }

    #[test]
    fn test_empty_bad_registry_deletes_file() {
        let dir = tempdir().unwrap();
        let (dirs, files) = sample_table();
        let bad = BadFileRegistry::new();
        bad.mark(0, "broken.dat", 99.0, "unreadable");
        save_state(dir.path(), &dirs, &files, &columns(), &bad).unwrap();
        assert!(dir.path().join(BAD_FILES_FILENAME).exists());

        bad.clear();
        save_state(dir.path(), &dirs, &files, &columns(), &bad).unwrap();
        assert!(!dir.path().join(BAD_FILES_FILENAME).exists());
    }

    #[test]
    fn test_missing_state_loads_as_none() {
        let dir = tempdir().unwrap();
        let (dirs, files, bad) = load_state(dir.path(), &columns());
        assert!(dirs.is_none());
        assert!(files.is_none());
        assert!(bad.is_empty());
    }

    #[test]
    fn test_wrong_arrangement_discarded() {
        let dir = tempdir().unwrap();
        let (dirs, files) = sample_table();
        let bad = BadFileRegistry::new();
        save_state(dir.path(), &dirs, &files, &columns(), &bad).unwrap();

        // reload against a different column list: arrangement check fails
        let other = vec![ColumnSpec {
            source_name: "DEPTH".into(),
            dest_name: "depth".into(),
            ctype: ColumnType::Float32,
            add_attrs: Attributes::new(),
        }];
        let (loaded_dirs, loaded_files, _) = load_state(dir.path(), &other);
        assert!(loaded_dirs.is_some());
        assert!(loaded_files.is_none());
    }

    #[test]
    fn test_leftover_temp_files_are_ignored() {
        // a crash between temp-write and rename leaves *.tmp files behind;
        // they must not shadow the real state
        let dir = tempdir().unwrap();
        let (dirs, files) = sample_table();
        let bad = BadFileRegistry::new();
        save_state(dir.path(), &dirs, &files, &columns(), &bad).unwrap();
        std::fs::write(dir.path().join("fileTable.deadbeef.tmp"), b"partial write").unwrap();

        let (loaded_dirs, loaded_files, _) = load_state(dir.path(), &columns());
        assert_eq!(loaded_dirs.unwrap(), dirs);
        assert_eq!(loaded_files.unwrap(), files);
    }

    #[test]
    fn test_corrupt_file_discarded() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join(FILE_TABLE_FILENAME), b"not an ipc stream").unwrap();
        let (_, files, _) = load_state(dir.path(), &columns());
        assert!(files.is_none());
    }
}
