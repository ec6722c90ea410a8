use log::{debug, error, info};
use serde::{de::DeserializeOwned, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::FlyError;

/// Buffered JSONL sink for run records.
///
/// Records are appended as one JSON object per line whenever the buffer
/// fills. With `final_json` set, the file is rewritten as a single JSON
/// array when the recorder is finalized or dropped.
#[derive(Debug)]
pub struct RunRecorder<T>
where
    T: Serialize + DeserializeOwned,
{
    buffer: Vec<T>,
    buffer_size: usize,
    path: PathBuf,
    final_json: bool,
    failures: usize,
    max_failures: usize,
}

impl<T> RunRecorder<T>
where
    T: Serialize + DeserializeOwned,
{
    pub fn new<P: Into<PathBuf>>(path: P, buffer_size: usize, final_json: bool) -> Self {
        let mut path = path.into();
        let ext = if final_json { "json" } else { "jsonl" };
        if path.extension() != Some(std::ffi::OsStr::new(ext)) {
            path.set_extension(ext);
        }

        Self {
            buffer: Vec::with_capacity(buffer_size.max(1)),
            buffer_size: buffer_size.max(1),
            path,
            final_json,
            failures: 0,
            max_failures: 10,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn add(&mut self, record: T) -> Result<(), FlyError> {
        self.buffer.push(record);
        if self.buffer.len() >= self.buffer_size {
            self.flush()?;
        }
        Ok(())
    }

    fn append_buffer(&self) -> Result<(), FlyError> {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| FlyError::io(e, format!("opening {}", self.path.display())))?;
        let mut writer = std::io::BufWriter::new(file);
        for record in &self.buffer {
            writeln!(writer, "{}", serde_json::to_string(record)?)?;
        }
        writer.flush()?;
        Ok(())
    }

    /// Write buffered records out. Transient failures keep the buffer and
    /// are only reported once they repeat `max_failures` times in a row.
    pub fn flush(&mut self) -> Result<(), FlyError> {
        if self.buffer.is_empty() {
            return Ok(());
        }

        match self.append_buffer() {
            Ok(()) => {
                debug!("Flushed {} records to {}", self.buffer.len(), self.path.display());
                self.failures = 0;
                self.buffer.clear();
                Ok(())
            }
            Err(e) => {
                self.failures += 1;
                error!("Flush failure {}/{}: {e}", self.failures, self.max_failures);
                if self.failures >= self.max_failures {
                    return Err(e);
                }
                Ok(())
            }
        }
    }

    /// Rewrite the JSONL file as a pretty JSON array.
    pub fn finalize(&mut self) -> Result<(), FlyError> {
        self.flush()?;
        if !self.final_json || !self.path.exists() {
            return Ok(());
        }

        let content = std::fs::read_to_string(&self.path)
            .map_err(|e| FlyError::io(e, format!("reading {}", self.path.display())))?;
        let records = content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(serde_json::from_str::<T>)
            .collect::<Result<Vec<_>, _>>()?;

        std::fs::write(&self.path, serde_json::to_string_pretty(&records)?)
            .map_err(|e| FlyError::io(e, format!("writing {}", self.path.display())))?;
        info!("Wrote {} records to {}", records.len(), self.path.display());

        // Already an array now; don't convert twice.
        self.final_json = false;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

impl<T> Drop for RunRecorder<T>
where
    T: Serialize + DeserializeOwned,
{
    fn drop(&mut self) {
        if let Err(e) = self.finalize() {
            error!("Failed to finalize {}: {e}", self.path.display());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Sample {
        leg: usize,
        position: f64,
    }

    #[test]
    fn buffers_until_full() {
        let dir = tempfile::tempdir().unwrap();
        let mut rec = RunRecorder::new(dir.path().join("run"), 2, false);
        assert_eq!(rec.path().extension().unwrap(), "jsonl");

        rec.add(Sample { leg: 0, position: 1.0 }).unwrap();
        assert_eq!(rec.len(), 1);
        assert!(!rec.path().exists());

        rec.add(Sample { leg: 1, position: 2.0 }).unwrap();
        assert!(rec.is_empty());
        let text = std::fs::read_to_string(rec.path()).unwrap();
        assert_eq!(text.lines().count(), 2);
    }

    #[test]
    fn drop_writes_json_array() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.json");
        {
            let mut rec = RunRecorder::new(&path, 10, true);
            rec.add(Sample { leg: 0, position: 0.5 }).unwrap();
            rec.add(Sample { leg: 1, position: 1.5 }).unwrap();
        }
        let records: Vec<Sample> =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].position, 1.5);
    }
}
