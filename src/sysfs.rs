// src/sysfs.rs

use std::fs;
use std::path::Path;
use std::str::FromStr;

use crate::error::SampleError;

/// Read a pseudo-file and return its trimmed contents.
pub fn read_value(path: impl AsRef<Path>) -> Result<String, SampleError> {
    let p = path.as_ref();
    fs::read_to_string(p)
        .map(|s| s.trim().to_string())
        .map_err(|source| SampleError::Read {
            path: p.display().to_string(),
            source,
        })
}

/// Read and parse a single value, e.g. a kHz frequency or a millidegree reading.
pub fn read_number<T: FromStr>(path: impl AsRef<Path>) -> Result<T, SampleError> {
    let p = path.as_ref();
    let value = read_value(p)?;
    value.parse().map_err(|_| SampleError::Parse {
        path: p.display().to_string(),
        value,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_number() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scaling_cur_freq");
        fs::write(&path, "2400000\n").unwrap();
        assert_eq!(read_number::<u64>(&path).unwrap(), 2_400_000);

        fs::write(&path, "n/a\n").unwrap();
        assert!(matches!(read_number::<u64>(&path), Err(SampleError::Parse { .. })));
        assert!(matches!(
            read_value(dir.path().join("missing")),
            Err(SampleError::Read { .. })
        ));
    }
}
