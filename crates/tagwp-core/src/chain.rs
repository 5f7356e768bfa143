use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};

use tracing::{debug, warn};

use crate::{
    data::{Column, EventTable, FieldRef, TableReader},
    selection::FieldSource,
    TagwpError, TagwpResult,
};

/// Columns loaded from the active file, keyed by field name.
#[derive(Default)]
struct ColumnCache {
    columns: HashMap<String, Column>,
}

/// The file an [`EventChain`] is currently positioned in.
struct ActiveFile {
    index: usize,
    offset: usize,
    n_events: usize,
    table: Box<dyn EventTable>,
    cache: ColumnCache,
}

/// Many event files presented as one contiguous, randomly addressable sequence.
///
/// Only one file is open at a time. Fields are loaded lazily: the first access to a field after
/// a file switch loads the whole column of the new file, and every later access within that
/// file is served from memory. Switching files drops the previous table and all of its columns.
pub struct EventChain<R: TableReader> {
    reader: R,
    files: Vec<(PathBuf, usize)>,
    total: usize,
    active: Option<ActiveFile>,
    entry: usize,
    out_of_range: usize,
}

impl<R: TableReader> EventChain<R> {
    /// Create a chain over `files`, opening each one only to read its event count.
    ///
    /// # Errors
    ///
    /// Fails with [`TagwpError::FileOpen`] or [`TagwpError::MissingTable`] if any file cannot
    /// provide an event table.
    pub fn new<I, P>(reader: R, files: I) -> TagwpResult<Self>
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        let mut list = Vec::new();
        let mut total = 0;
        for path in files {
            let path = path.as_ref();
            let n_events = reader.count_events(path)?;
            debug!("{}: {} events", path.display(), n_events);
            total += n_events;
            list.push((path.to_path_buf(), n_events));
        }
        Ok(Self {
            reader,
            files: list,
            total,
            active: None,
            entry: 0,
            out_of_range: 0,
        })
    }

    /// Total number of events across all files.
    pub fn n_events(&self) -> usize {
        self.total
    }

    /// Returns `true` if the chain holds no events.
    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    /// The files of the chain with their event counts.
    pub fn files(&self) -> &[(PathBuf, usize)] {
        &self.files
    }

    /// Index of the file holding the current entry, if any seek happened yet.
    pub fn active_file_index(&self) -> Option<usize> {
        self.active.as_ref().map(|active| active.index)
    }

    /// Path of the file holding the current entry.
    pub fn active_path(&self) -> Option<&Path> {
        self.active.as_ref().map(|active| active.table.path())
    }

    /// Position of the current entry within its file.
    pub fn local_entry(&self) -> usize {
        self.entry
    }

    /// Number of field reads that fell outside the loaded column and returned the `0.0`
    /// sentinel.
    pub fn out_of_range_count(&self) -> usize {
        self.out_of_range
    }

    /// Resolve a global index to `(file index, global offset of that file)`.
    fn locate(&self, index: usize) -> Option<(usize, usize)> {
        let mut offset = 0;
        for (file_index, (_, n_events)) in self.files.iter().enumerate() {
            if index < offset + n_events {
                return Some((file_index, offset));
            }
            offset += n_events;
        }
        None
    }

    /// Position the chain at `index`.
    ///
    /// Negative indices are clamped to `0` with a warning and indices past the end wrap around
    /// modulo [`EventChain::n_events`]. Files without events are never selected.
    ///
    /// # Errors
    ///
    /// Returns [`TagwpError::EmptyChain`] if the chain has no events, or an open error if the
    /// target file can no longer be read.
    pub fn seek(&mut self, index: i64) -> TagwpResult<()> {
        if self.total == 0 {
            return Err(TagwpError::EmptyChain);
        }
        let index = if index < 0 {
            warn!("Negative chain index {index} clamped to 0");
            0
        } else {
            index as usize % self.total
        };
        if let Some(active) = &self.active {
            if (active.offset..active.offset + active.n_events).contains(&index) {
                self.entry = index - active.offset;
                return Ok(());
            }
        }
        let (file_index, offset) = self.locate(index).ok_or(TagwpError::EmptyChain)?;
        let (path, n_events) = &self.files[file_index];
        // drop the old table and its columns before opening the next one
        self.active = None;
        debug!("Switching to file {} ({})", file_index, path.display());
        let table = self.reader.open(path)?;
        self.active = Some(ActiveFile {
            index: file_index,
            offset,
            n_events: *n_events,
            table,
            cache: ColumnCache::default(),
        });
        self.entry = index - offset;
        Ok(())
    }

    fn active_mut(&mut self) -> TagwpResult<&mut ActiveFile> {
        if self.active.is_none() {
            self.seek(0)?;
        }
        self.active.as_mut().ok_or(TagwpError::EmptyChain)
    }

    /// The value of `field` at the current entry, or `None` if the entry lies outside the
    /// loaded column.
    fn lookup(&mut self, field: &FieldRef) -> TagwpResult<(Option<f64>, usize)> {
        let entry = self.entry;
        let active = self.active_mut()?;
        if !active.cache.columns.contains_key(field.name()) {
            let column = active.table.load_column(field.name())?;
            active.cache.columns.insert(field.name().to_string(), column);
        }
        let column = &active.cache.columns[field.name()];
        Ok((column.get(entry, field.element_index()), column.len()))
    }

    /// The value of `field` at the current entry.
    ///
    /// If the entry lies beyond the loaded column (or the requested list element does not
    /// exist) a warning is logged, the chain's out-of-range counter is incremented and `0.0` is
    /// returned.
    ///
    /// # Errors
    ///
    /// Returns [`TagwpError::FieldNotFound`] if the active file has no such field.
    pub fn field(&mut self, field: &FieldRef) -> TagwpResult<f64> {
        let (value, length) = self.lookup(field)?;
        Ok(value.unwrap_or_else(|| {
            self.out_of_range += 1;
            warn!(
                "Entry {} of field \"{}\" out of range (length {}) in {}; using 0.0",
                self.entry,
                field,
                length,
                self.active_path().map(|p| p.display().to_string()).unwrap_or_default()
            );
            0.0
        }))
    }

    /// Like [`EventChain::field`], but reports an out-of-range read as
    /// [`TagwpError::OutOfRange`].
    pub fn field_checked(&mut self, field: &FieldRef) -> TagwpResult<f64> {
        let (value, length) = self.lookup(field)?;
        value.ok_or_else(|| TagwpError::OutOfRange {
            name: field.to_string(),
            entry: self.entry,
            length,
        })
    }
}

impl<R: TableReader> FieldSource for EventChain<R> {
    fn value(&mut self, field: &FieldRef) -> TagwpResult<f64> {
        self.field(field)
    }
}
