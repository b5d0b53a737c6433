//! Transient NDJSON file holding one batch for a load job.

use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use tempfile::NamedTempFile;
use thiserror::Error;

use courier_core::BufferedRecord;

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("artifact io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("artifact serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// One batch serialized as newline-delimited JSON.
///
/// The backing file is removed when the artifact is dropped, whatever the
/// outcome of the load.
#[derive(Debug)]
pub struct LoadArtifact {
    file: NamedTempFile,
    rows: usize,
}

impl LoadArtifact {
    pub fn write(records: &[BufferedRecord]) -> Result<Self, ArtifactError> {
        let mut file = tempfile::Builder::new()
            .prefix("courier-load-")
            .suffix(".ndjson")
            .tempfile()?;

        {
            let mut writer = BufWriter::new(file.as_file_mut());
            for record in records {
                serde_json::to_writer(&mut writer, record)?;
                writer.write_all(b"\n")?;
            }
            writer.flush()?;
        }

        Ok(Self {
            file,
            rows: records.len(),
        })
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Parse the rows back out of the file.
    pub fn read_records(&self) -> Result<Vec<BufferedRecord>, ArtifactError> {
        let reader = BufReader::new(self.file.reopen()?);
        let mut records = Vec::with_capacity(self.rows);
        for line in reader.lines() {
            let line = line?;
            if line.is_empty() {
                continue;
            }
            records.push(serde_json::from_str(&line)?);
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_core::{Event, NewEvent};
    use serde_json::json;

    fn record(n: u32) -> BufferedRecord {
        let event = Event::create(NewEvent {
            event_type: "page.viewed".to_string(),
            payload: json!({"n": n}),
            metadata: None,
        })
        .unwrap();
        BufferedRecord::snapshot(&event)
    }

    #[test]
    fn one_line_per_record() {
        let records = vec![record(1), record(2), record(3)];
        let artifact = LoadArtifact::write(&records).unwrap();

        let text = std::fs::read_to_string(artifact.path()).unwrap();
        assert_eq!(text.lines().count(), 3);
        assert_eq!(artifact.rows(), 3);
        assert_eq!(artifact.read_records().unwrap(), records);
    }

    #[test]
    fn file_is_removed_on_drop() {
        let artifact = LoadArtifact::write(&[record(1)]).unwrap();
        let path = artifact.path().to_path_buf();
        assert!(path.exists());

        drop(artifact);
        assert!(!path.exists());
    }
}
