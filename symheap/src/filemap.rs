//! Partitioned, line-aligned file reading
//!
//! Input files for many-rank pipelines are read cooperatively: rank r of n
//! takes roughly the r-th n-th of the file, aligned to line boundaries so
//! every line belongs to exactly one partition. Alignment uses one
//! consistent rule (a partition boundary at raw byte b moves forward to
//! just past the first newline at-or-after b), so neighboring partitions
//! agree on their shared edge without communicating.

use std::fs::File;
use std::io::{self, BufRead, BufReader, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum FileMapError {
    #[error("{path}: {source}")]
    Io { path: PathBuf, source: io::Error },

    #[error("partition {partition} of {partitions} does not exist")]
    InvalidPartition { partition: usize, partitions: usize },
}

pub type Result<T> = core::result::Result<T, FileMapError>;

fn io_err(path: &Path, source: io::Error) -> FileMapError {
    FileMapError::Io { path: path.to_path_buf(), source }
}

/// Size of a file in bytes.
pub fn file_size<P: AsRef<Path>>(path: P) -> Result<u64> {
    let path = path.as_ref();
    std::fs::metadata(path).map(|m| m.len()).map_err(|e| io_err(path, e))
}

/// One line-aligned slice of a file.
pub struct PartitionedFile {
    path: PathBuf,
    reader: BufReader<File>,
    partition: usize,
    partitions: usize,
    size: u64,
    start: u64,
    end: u64,
    pos: u64,
}

/// First byte position at-or-after `raw` that starts a line, per the
/// shared boundary rule. Clamps to the file size when no newline remains.
fn line_boundary(reader: &mut BufReader<File>, raw: u64, size: u64) -> io::Result<u64> {
    if raw == 0 || raw >= size {
        return Ok(raw.min(size));
    }
    reader.seek(SeekFrom::Start(raw))?;
    let mut skipped = Vec::new();
    let n = reader.read_until(b'\n', &mut skipped)?;
    Ok(raw + n as u64)
}

impl PartitionedFile {
    /// Open partition `partition` of `partitions` over `path`.
    ///
    /// The raw range is `[size·p/n, size·(p+1)/n)`; both edges then move to
    /// line boundaries. A partition may be empty when the file has fewer
    /// lines than partitions.
    pub fn open<P: AsRef<Path>>(path: P, partition: usize, partitions: usize) -> Result<PartitionedFile> {
        if partitions == 0 || partition >= partitions {
            return Err(FileMapError::InvalidPartition { partition, partitions });
        }
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path).map_err(|e| io_err(&path, e))?;
        let size = file.metadata().map_err(|e| io_err(&path, e))?.len();
        let mut reader = BufReader::new(file);

        let raw_start = (size as u128 * partition as u128 / partitions as u128) as u64;
        let raw_end = (size as u128 * (partition as u128 + 1) / partitions as u128) as u64;
        let start = line_boundary(&mut reader, raw_start, size).map_err(|e| io_err(&path, e))?;
        let end = line_boundary(&mut reader, raw_end, size).map_err(|e| io_err(&path, e))?;
        reader.seek(SeekFrom::Start(start)).map_err(|e| io_err(&path, e))?;

        Ok(PartitionedFile { path, reader, partition, partitions, size, start, end, pos: start })
    }

    /// Read the next line of the partition into `buf` (cleared first, line
    /// terminator stripped). Returns false at the end of the partition.
    pub fn read_line(&mut self, buf: &mut String) -> Result<bool> {
        if self.pos >= self.end {
            return Ok(false);
        }
        buf.clear();
        let n = self.reader.read_line(buf).map_err(|e| io_err(&self.path, e))?;
        if n == 0 {
            self.pos = self.end;
            return Ok(false);
        }
        self.pos += n as u64;
        if buf.ends_with('\n') {
            buf.pop();
            if buf.ends_with('\r') {
                buf.pop();
            }
        }
        Ok(true)
    }

    /// More lines left in this partition?
    pub fn has_more(&self) -> bool {
        self.pos < self.end
    }

    /// Current byte position within the file.
    pub fn position(&self) -> u64 {
        self.pos
    }

    /// Back to the start of the partition.
    pub fn rewind(&mut self) -> Result<()> {
        self.reader
            .seek(SeekFrom::Start(self.start))
            .map_err(|e| io_err(&self.path, e))?;
        self.pos = self.start;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn partition(&self) -> (usize, usize) {
        (self.partition, self.partitions)
    }

    /// Aligned byte range of this partition.
    pub fn byte_range(&self) -> (u64, u64) {
        (self.start, self.end)
    }

    pub fn file_size(&self) -> u64 {
        self.size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn temp_file(name: &str, contents: &[u8]) -> PathBuf {
        let path = std::env::temp_dir().join(format!("symheap-filemap-{}-{name}", std::process::id()));
        let mut f = File::create(&path).unwrap();
        f.write_all(contents).unwrap();
        path
    }

    fn all_lines(path: &Path, partitions: usize) -> Vec<Vec<String>> {
        (0..partitions)
            .map(|p| {
                let mut fm = PartitionedFile::open(path, p, partitions).unwrap();
                let mut lines = Vec::new();
                let mut buf = String::new();
                while fm.read_line(&mut buf).unwrap() {
                    lines.push(buf.clone());
                }
                lines
            })
            .collect()
    }

    #[test]
    fn test_partitions_cover_every_line_exactly_once() {
        let contents: String = (0..100).map(|i| format!("line-{i:04}\n")).collect();
        let path = temp_file("cover", contents.as_bytes());

        for partitions in [1, 2, 3, 7, 100, 128] {
            let per_partition = all_lines(&path, partitions);
            let merged: Vec<String> = per_partition.concat();
            let expected: Vec<String> = (0..100).map(|i| format!("line-{i:04}")).collect();
            assert_eq!(merged, expected, "{partitions} partitions");
        }
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_neighbor_partitions_agree_on_their_edge() {
        let contents = "aaaa\nbb\ncccccc\ndddd\n";
        let path = temp_file("edges", contents.as_bytes());

        for partitions in [2, 3, 4] {
            for p in 0..partitions - 1 {
                let left = PartitionedFile::open(&path, p, partitions).unwrap();
                let right = PartitionedFile::open(&path, p + 1, partitions).unwrap();
                assert_eq!(left.byte_range().1, right.byte_range().0);
            }
        }
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_missing_trailing_newline_still_yields_last_line() {
        let path = temp_file("chomp", b"first\nsecond\nlast-no-newline");
        let per_partition = all_lines(&path, 2);
        let merged: Vec<String> = per_partition.concat();
        assert_eq!(merged, vec!["first", "second", "last-no-newline"]);
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_more_partitions_than_lines_leaves_some_empty() {
        let path = temp_file("sparse", b"only\ntwo\n");
        let per_partition = all_lines(&path, 8);
        let merged: Vec<String> = per_partition.concat();
        assert_eq!(merged, vec!["only", "two"]);
        assert!(per_partition.iter().filter(|p| p.is_empty()).count() >= 6);
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_empty_file() {
        let path = temp_file("empty", b"");
        let mut fm = PartitionedFile::open(&path, 0, 4).unwrap();
        let mut buf = String::new();
        assert!(!fm.has_more());
        assert!(!fm.read_line(&mut buf).unwrap());
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_invalid_partition_is_rejected() {
        let path = temp_file("invalid", b"x\n");
        assert!(matches!(
            PartitionedFile::open(&path, 3, 3),
            Err(FileMapError::InvalidPartition { .. })
        ));
        assert!(matches!(
            PartitionedFile::open(&path, 0, 0),
            Err(FileMapError::InvalidPartition { .. })
        ));
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_rewind_restarts_the_partition() {
        let path = temp_file("rewind", b"one\ntwo\nthree\n");
        let mut fm = PartitionedFile::open(&path, 0, 1).unwrap();
        let mut buf = String::new();
        assert!(fm.read_line(&mut buf).unwrap());
        assert_eq!(buf, "one");
        fm.rewind().unwrap();
        assert!(fm.read_line(&mut buf).unwrap());
        assert_eq!(buf, "one");
        std::fs::remove_file(&path).unwrap();
    }
}
