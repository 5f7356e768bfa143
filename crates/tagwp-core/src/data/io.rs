//! Event-table backends and the sample cache artifact.

use super::*;
use arrow::{
    array::{Array, ArrayRef, AsArray, FixedSizeListArray, Float64Array, ListArray},
    compute::cast,
    datatypes::{DataType, Field, Float64Type, Schema},
    record_batch::RecordBatch,
};
use indexmap::IndexMap;
use oxyroot::{Branch, Named, ReaderTree, RootFile};
use parquet::arrow::{arrow_reader::ParquetRecordBatchReaderBuilder, ArrowWriter, ProjectionMask};
use std::{
    collections::HashMap,
    fs::{self, File},
    path::PathBuf,
    sync::Arc,
};
use tracing::debug;

/// Name of the event table read from ROOT files unless configured otherwise.
pub const DEFAULT_TREE: &str = "Friends";

const CACHE_CTAU_KEY: &str = "tagwp.tagger.ctau";
const CACHE_STAGES_KEY: &str = "tagwp.tagger.stages";
const CACHE_BATCH_SIZE: usize = 10_000;
const SCALAR_COLUMNS: [&str; 5] = ["ht", "pt", "mht", "njets", "weights"];

fn open_error<E: std::fmt::Display>(path: &Path, err: E) -> TagwpError {
    TagwpError::FileOpen {
        path: path.display().to_string(),
        reason: err.to_string(),
    }
}

fn field_not_found(path: &Path, name: &str) -> TagwpError {
    TagwpError::FieldNotFound {
        name: name.to_string(),
        path: path.display().to_string(),
    }
}

/// Opens Parquet files. Every file holds exactly one event table.
#[derive(Debug, Clone, Copy, Default)]
pub struct ParquetReader;

struct ParquetTable {
    path: PathBuf,
    schema: Arc<Schema>,
    n_events: usize,
}

impl TableReader for ParquetReader {
    fn open(&self, path: &Path) -> TagwpResult<Box<dyn EventTable>> {
        let file = File::open(path).map_err(|err| open_error(path, err))?;
        let builder =
            ParquetRecordBatchReaderBuilder::try_new(file).map_err(|err| open_error(path, err))?;
        let n_events = builder.metadata().file_metadata().num_rows() as usize;
        Ok(Box::new(ParquetTable {
            path: path.to_path_buf(),
            schema: builder.schema().clone(),
            n_events,
        }))
    }
}

impl EventTable for ParquetTable {
    fn path(&self) -> &Path {
        &self.path
    }

    fn n_events(&self) -> usize {
        self.n_events
    }

    fn load_column(&self, name: &str) -> TagwpResult<Column> {
        let index = self
            .schema
            .index_of(name)
            .map_err(|_| field_not_found(&self.path, name))?;
        let builder = ParquetRecordBatchReaderBuilder::try_new(File::open(&self.path)?)?;
        let mask = ProjectionMask::roots(builder.parquet_schema(), [index]);
        let reader = builder.with_projection(mask).build()?;
        let mut column = match self.schema.field(index).data_type() {
            DataType::List(_) | DataType::LargeList(_) | DataType::FixedSizeList(_, _) => {
                Column::List(Vec::with_capacity(self.n_events))
            }
            _ => Column::Scalar(Vec::with_capacity(self.n_events)),
        };
        for batch in reader {
            let batch = batch?;
            append_array(&mut column, batch.column(0))?;
        }
        debug!(
            "Loaded field \"{}\" ({} values) from {}",
            name,
            column.len(),
            self.path.display()
        );
        Ok(column)
    }
}

fn to_f64_values(array: &ArrayRef) -> TagwpResult<Vec<f64>> {
    let array = cast(array, &DataType::Float64)?;
    Ok(array
        .as_primitive::<Float64Type>()
        .iter()
        .map(|value| value.unwrap_or(f64::NAN))
        .collect())
}

fn append_array(column: &mut Column, array: &ArrayRef) -> TagwpResult<()> {
    match column {
        Column::Scalar(values) => values.extend(to_f64_values(array)?),
        Column::List(values) => match array.data_type() {
            DataType::List(_) => {
                let lists = array.as_list::<i32>();
                for i in 0..lists.len() {
                    values.push(if lists.is_null(i) {
                        Vec::new()
                    } else {
                        to_f64_values(&lists.value(i))?
                    });
                }
            }
            DataType::LargeList(_) => {
                let lists = array.as_list::<i64>();
                for i in 0..lists.len() {
                    values.push(if lists.is_null(i) {
                        Vec::new()
                    } else {
                        to_f64_values(&lists.value(i))?
                    });
                }
            }
            DataType::FixedSizeList(_, _) => {
                let lists = array.as_fixed_size_list();
                for i in 0..lists.len() {
                    values.push(to_f64_values(&lists.value(i))?);
                }
            }
            other => {
                return Err(TagwpError::Custom(format!(
                    "Cannot read a list column from Arrow type {other}"
                )))
            }
        },
    }
    Ok(())
}

/// Opens ROOT files through the oxyroot backend and reads one named tree from each.
#[derive(Debug, Clone)]
pub struct RootReader {
    tree: String,
}

impl Default for RootReader {
    fn default() -> Self {
        Self::new(DEFAULT_TREE)
    }
}

impl RootReader {
    /// Read the tree called `tree` from every file.
    pub fn new<S: Into<String>>(tree: S) -> Self {
        Self { tree: tree.into() }
    }

    /// The name of the tree read from each file.
    pub fn tree(&self) -> &str {
        &self.tree
    }
}

struct RootTable {
    path: PathBuf,
    tree: ReaderTree,
    n_events: usize,
}

impl TableReader for RootReader {
    fn open(&self, path: &Path) -> TagwpResult<Box<dyn EventTable>> {
        let mut file = RootFile::open(path).map_err(|err| open_error(path, err))?;
        let tree = file
            .get_tree(&self.tree)
            .map_err(|_| TagwpError::MissingTable {
                path: path.display().to_string(),
                table: self.tree.clone(),
            })?;
        let n_events = tree.entries().max(0) as usize;
        Ok(Box::new(RootTable {
            path: path.to_path_buf(),
            tree,
            n_events,
        }))
    }
}

#[derive(Clone, Copy)]
enum RootKind {
    F32,
    F64,
    I32,
    I64,
    U32,
    Bool,
    VecF32,
    VecF64,
}

fn branch_kind(branch: &Branch) -> Option<RootKind> {
    let lower = branch.item_type_name().to_ascii_lowercase();
    match lower.as_str() {
        "float" | "float_t" | "float32_t" => Some(RootKind::F32),
        "double" | "double_t" | "double32_t" => Some(RootKind::F64),
        "int" | "int_t" | "int32_t" => Some(RootKind::I32),
        "long64_t" | "int64_t" | "long" => Some(RootKind::I64),
        "unsigned int" | "uint_t" | "uint32_t" => Some(RootKind::U32),
        "bool" | "bool_t" => Some(RootKind::Bool),
        "vector<float>" => Some(RootKind::VecF32),
        "vector<double>" => Some(RootKind::VecF64),
        _ => None,
    }
}

impl RootTable {
    fn read_error<E: std::fmt::Display>(&self, name: &str, err: E) -> TagwpError {
        TagwpError::Custom(format!(
            "Failed to read branch '{name}' of {}: {err}",
            self.path.display()
        ))
    }
}

impl EventTable for RootTable {
    fn path(&self) -> &Path {
        &self.path
    }

    fn n_events(&self) -> usize {
        self.n_events
    }

    fn load_column(&self, name: &str) -> TagwpResult<Column> {
        let branch = self
            .tree
            .branches()
            .find(|branch| branch.name() == name)
            .ok_or_else(|| field_not_found(&self.path, name))?;
        let kind = branch_kind(branch).ok_or_else(|| {
            TagwpError::Custom(format!(
                "Branch '{name}' of {} has unsupported type '{}'",
                self.path.display(),
                branch.item_type_name()
            ))
        })?;
        let column = match kind {
            RootKind::F32 => Column::Scalar(
                branch
                    .as_iter::<f32>()
                    .map_err(|err| self.read_error(name, err))?
                    .map(f64::from)
                    .collect(),
            ),
            RootKind::F64 => Column::Scalar(
                branch
                    .as_iter::<f64>()
                    .map_err(|err| self.read_error(name, err))?
                    .collect(),
            ),
            RootKind::I32 => Column::Scalar(
                branch
                    .as_iter::<i32>()
                    .map_err(|err| self.read_error(name, err))?
                    .map(f64::from)
                    .collect(),
            ),
            RootKind::I64 => Column::Scalar(
                branch
                    .as_iter::<i64>()
                    .map_err(|err| self.read_error(name, err))?
                    .map(|value| value as f64)
                    .collect(),
            ),
            RootKind::U32 => Column::Scalar(
                branch
                    .as_iter::<u32>()
                    .map_err(|err| self.read_error(name, err))?
                    .map(f64::from)
                    .collect(),
            ),
            RootKind::Bool => Column::Scalar(
                branch
                    .as_iter::<bool>()
                    .map_err(|err| self.read_error(name, err))?
                    .map(|value| if value { 1.0 } else { 0.0 })
                    .collect(),
            ),
            RootKind::VecF32 => Column::List(
                branch
                    .as_iter::<Vec<f32>>()
                    .map_err(|err| self.read_error(name, err))?
                    .map(|values| values.into_iter().map(f64::from).collect())
                    .collect(),
            ),
            RootKind::VecF64 => Column::List(
                branch
                    .as_iter::<Vec<f64>>()
                    .map_err(|err| self.read_error(name, err))?
                    .collect(),
            ),
        };
        debug!(
            "Loaded branch \"{}\" ({} values) from {}",
            name,
            column.len(),
            self.path.display()
        );
        Ok(column)
    }
}

/// Chooses a backend from the file extension: `.parquet`/`.pq` files are read with
/// [`ParquetReader`] and `.root` files with [`RootReader`].
#[derive(Debug, Clone, Default)]
pub struct FileReader {
    root: RootReader,
}

impl FileReader {
    /// Read ROOT files from the tree called `tree`.
    pub fn with_tree<S: Into<String>>(tree: S) -> Self {
        Self {
            root: RootReader::new(tree),
        }
    }
}

impl TableReader for FileReader {
    fn open(&self, path: &Path) -> TagwpResult<Box<dyn EventTable>> {
        let extension = path
            .extension()
            .map(|ext| ext.to_string_lossy().to_ascii_lowercase());
        match extension.as_deref() {
            Some("parquet" | "pq") => ParquetReader.open(path),
            Some("root") => self.root.open(path),
            _ => Err(open_error(path, "unsupported file extension")),
        }
    }
}

/// Whether a path has an extension understood by [`FileReader`].
pub fn is_event_file(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext.to_string_lossy().to_ascii_lowercase())
        .is_some_and(|ext| matches!(ext.as_str(), "parquet" | "pq" | "root"))
}

/// Write a set of named columns as a single Parquet event table.
///
/// Scalar columns are stored as `Float64` and list columns as `List<Float64>`.
pub fn write_parquet_table(path: &Path, columns: &IndexMap<String, Column>) -> TagwpResult<()> {
    let mut fields = Vec::with_capacity(columns.len());
    let mut arrays: Vec<ArrayRef> = Vec::with_capacity(columns.len());
    for (name, column) in columns {
        let array: ArrayRef = match column {
            Column::Scalar(values) => Arc::new(Float64Array::from(values.clone())),
            Column::List(values) => Arc::new(ListArray::from_iter_primitive::<Float64Type, _, _>(
                values
                    .iter()
                    .map(|list| Some(list.iter().copied().map(Some).collect::<Vec<_>>())),
            )),
        };
        fields.push(Field::new(name, array.data_type().clone(), true));
        arrays.push(array);
    }
    let schema = Arc::new(Schema::new(fields));
    let batch = RecordBatch::try_new(schema.clone(), arrays)?;
    let file = File::create(path)?;
    let mut writer = ArrowWriter::try_new(file, schema, None)?;
    writer.write(&batch)?;
    writer.close()?;
    Ok(())
}

fn cache_schema(n_ctau: usize, n_stages: usize) -> Schema {
    let mut fields = vec![Field::new(
        "tagger",
        DataType::FixedSizeList(
            Arc::new(Field::new("item", DataType::Float64, false)),
            (n_ctau * n_stages) as i32,
        ),
        false,
    )];
    fields.extend(
        SCALAR_COLUMNS
            .iter()
            .map(|name| Field::new(*name, DataType::Float64, false)),
    );
    let metadata = HashMap::from([
        (CACHE_CTAU_KEY.to_string(), n_ctau.to_string()),
        (CACHE_STAGES_KEY.to_string(), n_stages.to_string()),
    ]);
    Schema::new_with_metadata(fields, metadata)
}

/// Persist an [`ExtractedSample`] as a cache artifact.
///
/// The artifact is written next to `path` first and renamed into place once complete, so a
/// reader never observes a partially written cache.
pub fn write_sample(sample: &ExtractedSample, path: &Path) -> TagwpResult<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let block = sample.n_ctau() * sample.n_stages();
    let schema = Arc::new(cache_schema(sample.n_ctau(), sample.n_stages()));
    let partial = path.with_extension(format!("partial.{:016x}", fastrand::u64(..)));
    let file = File::create(&partial)?;
    let mut writer = ArrowWriter::try_new(file, schema.clone(), None)?;
    let mut start = 0;
    while start < sample.n_events() {
        let end = (start + CACHE_BATCH_SIZE).min(sample.n_events());
        let tagger = FixedSizeListArray::try_new(
            Arc::new(Field::new("item", DataType::Float64, false)),
            block as i32,
            Arc::new(Float64Array::from(
                sample.tagger()[start * block..end * block].to_vec(),
            )),
            None,
        )?;
        let mut columns: Vec<ArrayRef> = vec![Arc::new(tagger)];
        for values in [
            sample.ht(),
            sample.pt(),
            sample.mht(),
            sample.njets(),
            sample.weights(),
        ] {
            columns.push(Arc::new(Float64Array::from(values[start..end].to_vec())));
        }
        writer.write(&RecordBatch::try_new(schema.clone(), columns)?)?;
        start = end;
    }
    writer.close()?;
    fs::rename(&partial, path)?;
    Ok(())
}

/// Load an [`ExtractedSample`] from a cache artifact written by [`write_sample`].
pub fn read_sample(path: &Path) -> TagwpResult<ExtractedSample> {
    let malformed = |reason: String| TagwpError::CacheFormat {
        path: path.display().to_string(),
        reason,
    };
    let builder = ParquetRecordBatchReaderBuilder::try_new(File::open(path)?)?;
    let metadata = builder.schema().metadata();
    let shape_entry = |key: &str| -> TagwpResult<usize> {
        metadata
            .get(key)
            .and_then(|value| value.parse::<usize>().ok())
            .ok_or_else(|| malformed(format!("missing or invalid metadata key '{key}'")))
    };
    let n_ctau = shape_entry(CACHE_CTAU_KEY)?;
    let n_stages = shape_entry(CACHE_STAGES_KEY)?;
    let n_rows = builder.metadata().file_metadata().num_rows() as usize;

    let mut tagger = Vec::with_capacity(n_rows * n_ctau * n_stages);
    let mut scalars: [Vec<f64>; 5] = Default::default();
    for batch in builder.build()? {
        let batch = batch?;
        let column = batch
            .column_by_name("tagger")
            .ok_or_else(|| malformed("missing column 'tagger'".to_string()))?;
        let lists = column
            .as_fixed_size_list_opt()
            .ok_or_else(|| malformed("column 'tagger' is not a fixed-size list".to_string()))?;
        if lists.value_length() as usize != n_ctau * n_stages {
            return Err(malformed(format!(
                "tagger blocks hold {} scores but the shape is {n_ctau}x{n_stages}",
                lists.value_length()
            )));
        }
        tagger.extend(to_f64_values(lists.values())?);
        for (name, values) in SCALAR_COLUMNS.iter().zip(scalars.iter_mut()) {
            let column = batch
                .column_by_name(name)
                .ok_or_else(|| malformed(format!("missing column '{name}'")))?;
            values.extend(to_f64_values(column)?);
        }
    }
    let [ht, pt, mht, njets, weights] = scalars;
    ExtractedSample::from_columns(n_ctau, n_stages, tagger, ht, pt, mht, njets, weights)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{data::EventScalars, tests::make_temp_dir};
    use approx::assert_relative_eq;

    #[test]
    fn test_parquet_table_loads_scalars_and_lists() {
        let dir = make_temp_dir();
        let path = dir.join("events.parquet");
        let columns = IndexMap::from([
            ("nominal_ht".to_string(), Column::Scalar(vec![850.0, 1100.0, 640.0])),
            (
                "selectedJets_nominal_pt".to_string(),
                Column::List(vec![vec![300.0, 120.0], vec![410.0], vec![]]),
            ),
        ]);
        write_parquet_table(&path, &columns).unwrap();

        let table = FileReader::default().open(&path).unwrap();
        assert_eq!(table.n_events(), 3);
        let ht = table.load_column("nominal_ht").unwrap();
        assert_eq!(ht, Column::Scalar(vec![850.0, 1100.0, 640.0]));
        let pt = table.load_column("selectedJets_nominal_pt").unwrap();
        assert_eq!(pt.get(0, Some(1)), Some(120.0));
        assert_eq!(pt.get(2, Some(0)), None);
        assert!(matches!(
            table.load_column("nominal_met"),
            Err(TagwpError::FieldNotFound { .. })
        ));
        fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn test_file_reader_rejects_unknown_extensions() {
        let result = FileReader::default().open(Path::new("events.csv"));
        assert!(matches!(result, Err(TagwpError::FileOpen { .. })));
        assert!(is_event_file(Path::new("a/b/c.ROOT")));
        assert!(!is_event_file(Path::new("a/b/c.json")));
    }

    #[test]
    fn test_missing_file_is_a_file_open_error() {
        let result = ParquetReader.open(Path::new("/nonexistent/tagwp/events.parquet"));
        assert!(matches!(result, Err(TagwpError::FileOpen { .. })));
    }

    #[test]
    fn test_sample_cache_preserves_contents() {
        let dir = make_temp_dir();
        let path = dir.join("nested").join("background.parquet");
        let mut sample = ExtractedSample::new(2, 2);
        for i in 0..25 {
            let x = i as f64;
            sample.push(
                &[x / 25.0, x / 50.0, 1.0 - x / 25.0, 0.5],
                EventScalars {
                    ht: 400.0 + 20.0 * x,
                    pt: 100.0 + x,
                    mht: 300.0 + x,
                    njets: (3 + i % 5) as f64,
                    weight: 0.01 * x,
                },
            );
        }
        write_sample(&sample, &path).unwrap();
        let restored = read_sample(&path).unwrap();
        assert_eq!(restored.n_ctau(), 2);
        assert_eq!(restored.n_stages(), 2);
        assert_eq!(restored, sample);
        assert_relative_eq!(restored.score(7, 1, 0), 1.0 - 7.0 / 25.0);
        fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn test_sample_writes_leave_no_partial_files() {
        let dir = make_temp_dir();
        let path = dir.join("signal.parquet");
        let mut sample = ExtractedSample::new(1, 1);
        sample.push(&[0.5], EventScalars::default());
        write_sample(&sample, &path).unwrap();
        write_sample(&sample, &path).unwrap();
        let names: Vec<String> = fs::read_dir(&dir)
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["signal.parquet".to_string()]);
        assert_eq!(read_sample(&path).unwrap(), sample);
        fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn test_plain_event_table_is_not_a_cache() {
        let dir = make_temp_dir();
        let path = dir.join("events.parquet");
        let columns = IndexMap::from([("ht".to_string(), Column::Scalar(vec![1.0]))]);
        write_parquet_table(&path, &columns).unwrap();
        assert!(matches!(
            read_sample(&path),
            Err(TagwpError::CacheFormat { .. })
        ));
        fs::remove_dir_all(dir).unwrap();
    }
}
