//! Incremental archive of refined results.
//!
//! A `DatasetArchive` is a SQLite file of named, growable datasets. Each
//! dataset has an element type and a fixed trailing shape; appends add rows
//! along the leading dimension as stored chunks. Every append is its own
//! committed transaction.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, OptionalExtension};

use super::SinkWriter;
use crate::codec::{compress, CodecAdapter, CodecKind};
use crate::frame::{PixelBuffer, PixelType, RefinedResult, PLOC_COLUMNS};

pub const PATCHES_DATASET: &str = "patches";
pub const PLOC_DATASET: &str = "ploc";
pub const FRAME_ID_DATASET: &str = "frame_id";

/// Rows to append to one dataset.
#[derive(Clone, Debug, PartialEq)]
pub struct ColumnData {
    pub name: String,
    pub dtype: PixelType,
    pub trailing_shape: Vec<usize>,
    pub values: PixelBuffer,
}

impl ColumnData {
    pub fn new(name: &str, trailing_shape: &[usize], values: PixelBuffer) -> Self {
        Self {
            name: name.to_string(),
            dtype: values.pixel_type(),
            trailing_shape: trailing_shape.to_vec(),
            values,
        }
    }

    fn row_len(&self) -> usize {
        self.trailing_shape.iter().product()
    }

    fn rows(&self) -> Result<usize> {
        let row_len = self.row_len();
        if row_len == 0 || self.values.len() % row_len != 0 {
            return Err(anyhow!(
                "{} values do not fill whole rows of shape {:?} for '{}'",
                self.values.len(),
                self.trailing_shape,
                self.name
            ));
        }
        Ok(self.values.len() / row_len)
    }
}

pub struct DatasetArchive {
    conn: Connection,
    path: PathBuf,
    compression: bool,
}

impl DatasetArchive {
    /// Create a fresh archive, replacing any file at `path`.
    pub fn create<P: AsRef<Path>>(path: P, compression: bool) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        for suffix in ["", "-wal", "-shm"] {
            let existing = PathBuf::from(format!("{}{}", path.display(), suffix));
            if existing.exists() {
                std::fs::remove_file(&existing)
                    .with_context(|| format!("failed to replace archive {}", existing.display()))?;
            }
        }
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let conn = Connection::open(&path)
            .with_context(|| format!("failed to create archive {}", path.display()))?;
        let archive = Self {
            conn,
            path,
            compression,
        };
        archive.ensure_schema()?;
        Ok(archive)
    }

    /// Open an existing archive for reading or further appends.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if !path.exists() {
            return Err(anyhow!("archive {} does not exist", path.display()));
        }
        let conn = Connection::open(&path)
            .with_context(|| format!("failed to open archive {}", path.display()))?;
        let archive = Self {
            conn,
            path,
            compression: false,
        };
        archive.ensure_schema()?;
        Ok(archive)
    }

    fn ensure_schema(&self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=FULL;

            CREATE TABLE IF NOT EXISTS datasets (
              name TEXT PRIMARY KEY,
              dtype TEXT NOT NULL,
              trailing_shape TEXT NOT NULL,
              rows INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS chunks (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              dataset TEXT NOT NULL,
              start_row INTEGER NOT NULL,
              rows INTEGER NOT NULL,
              codec TEXT NOT NULL,
              raw_len INTEGER NOT NULL,
              data BLOB NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_chunks_dataset ON chunks(dataset, id);
            "#,
        )?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append rows to several datasets in one transaction, creating datasets
    /// on first use. Returns the new leading dimension of each.
    pub fn append(&mut self, columns: &[ColumnData]) -> Result<Vec<usize>> {
        let codec = if self.compression {
            CodecKind::Lz4
        } else {
            CodecKind::None
        };
        let tx = self.conn.transaction()?;
        let mut lengths = Vec::with_capacity(columns.len());
        for column in columns {
            let rows = column.rows()?;
            let trailing_json = serde_json::to_string(&column.trailing_shape)?;
            let existing: Option<(String, String, i64)> = tx
                .query_row(
                    "SELECT dtype, trailing_shape, rows FROM datasets WHERE name = ?1",
                    params![column.name],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                )
                .optional()?;
            let start_row = match existing {
                Some((dtype, trailing, stored)) => {
                    if dtype != column.dtype.to_string() || trailing != trailing_json {
                        return Err(anyhow!(
                            "dataset '{}' is {} with trailing shape {}, cannot append {} with {:?}",
                            column.name,
                            dtype,
                            trailing,
                            column.dtype,
                            column.trailing_shape
                        ));
                    }
                    stored as usize
                }
                None => {
                    tx.execute(
                        "INSERT INTO datasets(name, dtype, trailing_shape, rows) VALUES (?1, ?2, ?3, 0)",
                        params![column.name, column.dtype.to_string(), trailing_json],
                    )?;
                    0
                }
            };

            let raw = column.values.to_le_bytes();
            let data = compress(&codec, &raw)?;
            tx.execute(
                r#"
                INSERT INTO chunks(dataset, start_row, rows, codec, raw_len, data)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                "#,
                params![
                    column.name,
                    start_row as i64,
                    rows as i64,
                    codec.name(),
                    raw.len() as i64,
                    data
                ],
            )?;
            let total = start_row + rows;
            tx.execute(
                "UPDATE datasets SET rows = ?1 WHERE name = ?2",
                params![total as i64, column.name],
            )?;
            lengths.push(total);
        }
        tx.commit()?;
        Ok(lengths)
    }

    /// `[rows, trailing...]`, or `None` when the dataset does not exist.
    pub fn shape(&self, name: &str) -> Result<Option<Vec<usize>>> {
        let found: Option<(String, i64)> = self
            .conn
            .query_row(
                "SELECT trailing_shape, rows FROM datasets WHERE name = ?1",
                params![name],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        match found {
            Some((trailing, rows)) => {
                let trailing: Vec<usize> = serde_json::from_str(&trailing)
                    .with_context(|| format!("corrupt shape for dataset '{}'", name))?;
                let mut shape = vec![rows as usize];
                shape.extend(trailing);
                Ok(Some(shape))
            }
            None => Ok(None),
        }
    }

    pub fn datasets(&self) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare("SELECT name FROM datasets ORDER BY name ASC")?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(names)
    }

    /// Every value of a dataset, in append order.
    pub fn read(&self, name: &str) -> Result<PixelBuffer> {
        let dtype: String = self
            .conn
            .query_row(
                "SELECT dtype FROM datasets WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| anyhow!("dataset '{}' does not exist", name))?;
        let dtype = PixelType::ALL
            .into_iter()
            .find(|t| t.to_string() == dtype)
            .ok_or_else(|| anyhow!("dataset '{}' has unknown type {}", name, dtype))?;

        let mut stmt = self
            .conn
            .prepare("SELECT codec, raw_len, data FROM chunks WHERE dataset = ?1 ORDER BY id ASC")?;
        let mut rows = stmt.query(params![name])?;
        let mut adapter = CodecAdapter::new();
        let mut bytes = Vec::new();
        while let Some(row) = rows.next()? {
            let codec: String = row.get(0)?;
            let raw_len: i64 = row.get(1)?;
            let data: Vec<u8> = row.get(2)?;
            let codec = CodecKind::from_name(&codec);
            if codec.is_compressed() {
                adapter.decompress(&data, &codec, data.len(), raw_len as usize)?;
                bytes.extend_from_slice(adapter.data());
            } else {
                bytes.extend_from_slice(&data);
            }
        }
        PixelBuffer::from_le_bytes(dtype, &bytes)
    }

    pub fn read_f32(&self, name: &str) -> Result<Vec<f32>> {
        match self.read(name)? {
            PixelBuffer::F32(values) => Ok(values),
            other => Err(anyhow!(
                "dataset '{}' holds {}, not f32",
                name,
                other.pixel_type()
            )),
        }
    }

    pub fn read_i64(&self, name: &str) -> Result<Vec<i64>> {
        match self.read(name)? {
            PixelBuffer::I64(values) => Ok(values),
            other => Err(anyhow!(
                "dataset '{}' holds {}, not i64",
                name,
                other.pixel_type()
            )),
        }
    }
}

/// What the archive keeps of one refined result.
#[derive(Clone, Debug, PartialEq)]
pub struct ArchiveBlock {
    pub frame_id: i64,
    pub psz: usize,
    /// `n * psz * psz` patch pixels.
    pub patches: Vec<f32>,
    pub ploc: Vec<[f32; PLOC_COLUMNS]>,
    /// Source frame of each patch.
    pub frame_ids: Vec<i64>,
}

impl ArchiveBlock {
    pub fn from_result(result: &RefinedResult) -> Self {
        let batch = &result.batch;
        Self {
            frame_id: result.frame_id,
            psz: batch.psz,
            patches: batch
                .patches
                .iter()
                .flat_map(|p| p.pixels.iter().copied())
                .collect(),
            ploc: result.ploc(),
            frame_ids: batch.patches.iter().map(|p| p.origin.frame_id).collect(),
        }
    }

    pub fn columns(self) -> Vec<ColumnData> {
        vec![
            ColumnData::new(
                PATCHES_DATASET,
                &[self.psz, self.psz],
                PixelBuffer::F32(self.patches),
            ),
            ColumnData::new(
                PLOC_DATASET,
                &[PLOC_COLUMNS],
                PixelBuffer::F32(self.ploc.into_iter().flatten().collect()),
            ),
            ColumnData::new(FRAME_ID_DATASET, &[], PixelBuffer::I64(self.frame_ids)),
        ]
    }
}

/// Archive sink. The file is created on the first result.
pub struct ArchiveWriter {
    path: PathBuf,
    compression: bool,
    archive: Option<DatasetArchive>,
}

impl ArchiveWriter {
    pub fn new<P: AsRef<Path>>(path: P, compression: bool) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            compression,
            archive: None,
        }
    }
}

impl SinkWriter for ArchiveWriter {
    type Message = ArchiveBlock;

    fn name(&self) -> String {
        self.path.display().to_string()
    }

    fn prepare(result: &RefinedResult) -> Vec<ArchiveBlock> {
        vec![ArchiveBlock::from_result(result)]
    }

    fn write(&mut self, block: ArchiveBlock) -> Result<()> {
        if self.archive.is_none() {
            self.archive = Some(DatasetArchive::create(&self.path, self.compression)?);
        }
        let archive = self
            .archive
            .as_mut()
            .ok_or_else(|| anyhow!("archive {} not open", self.path.display()))?;
        let frame_id = block.frame_id;
        let n = block.frame_ids.len();
        let columns = block.columns();
        let lengths = archive.append(&columns)?;
        for (column, total) in columns.iter().zip(lengths) {
            log::info!(
                "({}, {:?}) samples of frame {} added to '{}' of {}, now has {} rows",
                n,
                column.trailing_shape,
                frame_id,
                column.name,
                self.path.display(),
                total
            );
        }
        Ok(())
    }
}
