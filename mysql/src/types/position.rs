use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Offset of the first event in every binlog file, right after the magic header.
const FIRST_EVENT_OFFSET: u64 = 4;

/// A replication checkpoint: a binlog file name and a byte offset inside it.
///
/// Positions order by the numeric sequence suffix of the file (`mysql-bin.000042`), then by
/// offset, so a rotation always moves forward even when file names differ in width.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BinlogPosition {
    pub file: String,
    pub offset: u64,
}

impl BinlogPosition {
    pub fn new(file: impl Into<String>, offset: u64) -> Self {
        Self {
            file: file.into(),
            offset,
        }
    }

    /// The position used when no checkpoint exists: the start of the log.
    ///
    /// An empty file name lets the binlog client pick the oldest available file.
    pub fn start() -> Self {
        Self {
            file: String::new(),
            offset: FIRST_EVENT_OFFSET,
        }
    }

    pub fn is_start(&self) -> bool {
        self.file.is_empty()
    }

    /// Numeric suffix of the file name, if any.
    pub fn sequence(&self) -> Option<u64> {
        let (_, suffix) = self.file.rsplit_once('.')?;
        suffix.parse().ok()
    }
}

impl Default for BinlogPosition {
    fn default() -> Self {
        Self::start()
    }
}

impl PartialOrd for BinlogPosition {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for BinlogPosition {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sequence()
            .cmp(&other.sequence())
            .then_with(|| self.file.cmp(&other.file))
            .then_with(|| self.offset.cmp(&other.offset))
    }
}

impl fmt::Display for BinlogPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.file, self.offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn orders_by_file_sequence_then_offset() {
        let a = BinlogPosition::new("mysql-bin.000009", 900);
        let b = BinlogPosition::new("mysql-bin.000010", 4);
        let c = BinlogPosition::new("mysql-bin.000010", 120);

        assert!(a < b);
        assert!(b < c);
        assert!(BinlogPosition::start() < a);
    }

    #[test]
    fn sequence_ignores_width() {
        let narrow = BinlogPosition::new("bin.99", 4);
        let wide = BinlogPosition::new("bin.100", 4);

        assert!(narrow < wide);
    }
}
