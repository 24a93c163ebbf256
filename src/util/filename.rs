//! Table file naming conventions.

use std::path::{Path, PathBuf};

/// Generate an SSTable file path.
pub fn table_file_path(db_path: &Path, number: u64) -> PathBuf {
    db_path.join(format!("{:06}.sst", number))
}

/// Parse a table file name, returning its file number.
///
/// Returns `None` if the name is not a `NNNNNN.sst` table file.
pub fn parse_table_file_name(name: &str) -> Option<u64> {
    let num_str = name.strip_suffix(".sst")?;
    num_str.parse::<u64>().ok()
}
