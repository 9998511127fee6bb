//! Plain-text secret backup
//!
//! One secret per line. The file is an import source for bootstrapping and
//! disaster recovery; it never carries status and is not authoritative.
//! Blank lines and `#` comments are ignored on read.

use std::collections::HashSet;
use std::path::Path;

use tracing::debug;

use crate::error::{Error, Result};

/// Read secrets from a backup file, de-duplicated in file order.
///
/// A missing file is an empty backup, not an error.
pub fn read_secrets(path: &Path) -> Result<Vec<String>> {
    let contents = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(Error::Io(format!("reading backup file: {e}"))),
    };

    let mut seen = HashSet::new();
    Ok(contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter(|line| seen.insert(*line))
        .map(str::to_owned)
        .collect())
}

/// Write secrets to the backup file atomically.
///
/// Writes a temp file in the same directory and renames it over the target,
/// so a crash mid-write leaves the previous backup intact. Permissions are
/// 0600 because the file holds raw secrets.
pub fn write_atomic(path: &Path, secrets: &[String]) -> Result<()> {
    let dir = match path.parent() {
        Some(d) if !d.as_os_str().is_empty() => d,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)
        .map_err(|e| Error::Io(format!("creating backup directory: {e}")))?;

    let tmp_path = dir.join(format!(".secrets.tmp.{}", std::process::id()));

    let mut body = secrets.join("\n");
    if !body.is_empty() {
        body.push('\n');
    }

    std::fs::write(&tmp_path, body.as_bytes())
        .map_err(|e| Error::Io(format!("writing temp backup file: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(&tmp_path, perms)
            .map_err(|e| Error::Io(format!("setting backup file permissions: {e}")))?;
    }

    std::fs::rename(&tmp_path, path)
        .map_err(|e| Error::Io(format!("renaming temp backup file: {e}")))?;

    debug!(path = %path.display(), secrets = secrets.len(), "wrote secret backup");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_reads_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let secrets = read_secrets(&dir.path().join("absent.txt")).unwrap();
        assert!(secrets.is_empty());
    }

    #[test]
    fn read_skips_comments_blanks_and_duplicates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokens.txt");
        std::fs::write(&path, "# exported\ntok_a\n\n  tok_b  \ntok_a\n").unwrap();

        assert_eq!(read_secrets(&path).unwrap(), vec!["tok_a", "tok_b"]);
    }

    #[test]
    fn write_then_read_preserves_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("tokens.txt");
        let secrets = vec!["tok_2".to_string(), "tok_1".to_string()];

        write_atomic(&path, &secrets).unwrap();
        assert_eq!(read_secrets(&path).unwrap(), secrets);
    }

    #[test]
    fn write_empty_produces_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokens.txt");
        write_atomic(&path, &[]).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "");
    }

    #[cfg(unix)]
    #[test]
    fn backup_permissions_are_0600() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokens.txt");
        write_atomic(&path, &["tok".to_string()]).unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600, "backup file must be 0600, got {mode:o}");
    }
}
