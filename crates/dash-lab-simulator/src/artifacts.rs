use dash_lab_abstract::SetupError;
use std::fs::DirBuilder;
use std::path::{Path, PathBuf};
use tracing::debug;

/// File name prefix of the per-device packet captures.
pub const PCAP_PREFIX: &str = "dash-tracing";

/// Create `<base>/<algorithm>/<simulation_id>` with every missing parent.
///
/// New directories get mode `0o775` on Unix (subject to the umask). An
/// existing directory is not an error.
pub fn prepare_artifact_directory(
    base: &Path,
    algorithm: &str,
    simulation_id: u32,
) -> Result<PathBuf, SetupError> {
    let dir = base.join(algorithm).join(simulation_id.to_string());
    let mut builder = DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o775);
    }
    builder
        .create(&dir)
        .map_err(|source| SetupError::ArtifactDirectory {
            path: dir.clone(),
            source,
        })?;
    debug!("Artifact directory {}", dir.display());
    Ok(dir)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn creates_nested_directory_idempotently() {
        let base = tempfile::tempdir().unwrap();
        let logs = base.path().join("dash-log-files");
        let first = prepare_artifact_directory(&logs, "festive", 1).unwrap();
        assert_eq!(first, logs.join("festive").join("1"));
        assert!(first.is_dir());

        std::fs::write(first.join("keep.txt"), "x").unwrap();
        let second = prepare_artifact_directory(&logs, "festive", 1).unwrap();
        assert_eq!(first, second);
        assert!(second.join("keep.txt").exists());
    }

    #[cfg(unix)]
    #[test]
    fn owner_can_use_new_directories() {
        use std::os::unix::fs::PermissionsExt;
        let base = tempfile::tempdir().unwrap();
        let dir = prepare_artifact_directory(base.path(), "panda", 7).unwrap();
        let mode = std::fs::metadata(&dir).unwrap().permissions().mode();
        assert_eq!(mode & 0o700, 0o700);
        // never wider than requested
        assert_eq!(mode & 0o002, 0);
    }

    #[test]
    fn file_in_the_way_is_a_resource_error() {
        let base = tempfile::tempdir().unwrap();
        std::fs::write(base.path().join("tobasco"), "not a directory").unwrap();
        let err = prepare_artifact_directory(base.path(), "tobasco", 1).unwrap_err();
        assert!(matches!(err, SetupError::ArtifactDirectory { .. }));
        assert!(err.is_resource_error());
    }
}
