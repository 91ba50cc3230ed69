//! Moving files in and out of build roots

use crate::error::{ConbuilderError, ConbuilderResult};
use crate::sandbox::{run_child, CancelToken};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::process::Command;
use tracing::{debug, info};

/// Copy the contents of `src` into `dest`, preserving ownership, modes and
/// links. `dest` is created if missing.
pub async fn copy_tree(src: &Path, dest: &Path, cancel: &CancelToken) -> ConbuilderResult<()> {
    if !src.is_dir() {
        return Err(ConbuilderError::PathNotFound(src.to_path_buf()));
    }
    fs::create_dir_all(dest)
        .await
        .map_err(|e| ConbuilderError::io(format!("creating {}", dest.display()), e))?;

    let mut command = Command::new("cp");
    command.arg("-a").arg(src.join(".")).arg(dest);
    debug!("Copying {} to {}", src.display(), dest.display());

    run_child(command, "cp", cancel, &|_| {}).await?.check("cp -a")?;
    Ok(())
}

/// Directory inside a build root where artifacts appear
pub fn output_path(root: &Path, output_dir: &str) -> PathBuf {
    root.join(output_dir.trim_start_matches('/'))
}

/// Resolve the export directory against the source tree when relative
pub fn export_path(source_dir: &Path, export_dir: &Path) -> PathBuf {
    if export_dir.is_absolute() {
        export_dir.to_path_buf()
    } else {
        source_dir.join(export_dir)
    }
}

fn is_artifact(path: &Path, extensions: &[String]) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| extensions.iter().any(|e| e.trim_start_matches('.') == ext))
}

/// Copy every regular file in `dir` (not recursive) whose extension is in
/// `extensions` into `export_dir`. Returns the exported paths, sorted.
pub async fn collect_artifacts(
    dir: &Path,
    extensions: &[String],
    export_dir: &Path,
) -> ConbuilderResult<Vec<PathBuf>> {
    let mut found = Vec::new();
    let mut entries = fs::read_dir(dir)
        .await
        .map_err(|e| ConbuilderError::io(format!("reading {}", dir.display()), e))?;
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| ConbuilderError::io(format!("reading {}", dir.display()), e))?
    {
        let path = entry.path();
        let file_type = entry
            .file_type()
            .await
            .map_err(|e| ConbuilderError::io(format!("inspecting {}", path.display()), e))?;
        if file_type.is_file() && is_artifact(&path, extensions) {
            found.push(path);
        }
    }
    found.sort();

    if found.is_empty() {
        return Ok(found);
    }

    fs::create_dir_all(export_dir)
        .await
        .map_err(|e| ConbuilderError::io(format!("creating {}", export_dir.display()), e))?;

    let mut exported = Vec::with_capacity(found.len());
    for path in found {
        let Some(name) = path.file_name() else {
            continue;
        };
        let dest = export_dir.join(name);
        fs::copy(&path, &dest).await.map_err(|e| {
            ConbuilderError::io(
                format!("copying {} to {}", path.display(), dest.display()),
                e,
            )
        })?;
        info!("Exported {}", dest.display());
        exported.push(dest);
    }

    Ok(exported)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn extensions() -> Vec<String> {
        crate::config::BuildConfig::default().artifact_extensions
    }

    #[tokio::test]
    async fn collects_matching_files_only() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("merged");
        std::fs::create_dir_all(root.join("srv/nested")).unwrap();
        for name in [
            "hello_1.0_amd64.deb",
            "hello_1.0_amd64.changes",
            "hello_1.0.tar.xz",
            "hello_1.0.dsc",
            "hello_1.0_amd64.buildinfo",
            "notes.txt",
        ] {
            std::fs::write(root.join(name), name).unwrap();
        }
        std::fs::write(root.join("srv/nested/other.deb"), b"x").unwrap();

        let export = temp.path().join("build-area");
        let exported = collect_artifacts(&root, &extensions(), &export).await.unwrap();

        let names: Vec<String> = exported
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            names,
            vec![
                "hello_1.0.dsc",
                "hello_1.0.tar.xz",
                "hello_1.0_amd64.buildinfo",
                "hello_1.0_amd64.changes",
                "hello_1.0_amd64.deb",
            ]
        );
        assert_eq!(
            std::fs::read_to_string(export.join("hello_1.0_amd64.deb")).unwrap(),
            "hello_1.0_amd64.deb"
        );
        assert!(!export.join("other.deb").exists());
    }

    #[tokio::test]
    async fn nothing_to_collect_creates_nothing() {
        let temp = TempDir::new().unwrap();
        let export = temp.path().join("build-area");
        let exported = collect_artifacts(temp.path(), &extensions(), &export)
            .await
            .unwrap();
        assert!(exported.is_empty());
        assert!(!export.exists());
    }

    #[test]
    fn export_path_resolves_relative() {
        let source = Path::new("/home/u/hello");
        assert_eq!(
            export_path(source, Path::new("../build-area")),
            PathBuf::from("/home/u/hello/../build-area")
        );
        assert_eq!(
            export_path(source, Path::new("/tmp/out")),
            PathBuf::from("/tmp/out")
        );
    }

    #[test]
    fn output_path_strips_leading_slash() {
        let root = Path::new("/cache/mounts/m/merged");
        assert_eq!(output_path(root, "/"), root.to_path_buf());
        assert_eq!(output_path(root, "/srv/out"), root.join("srv/out"));
    }

    #[tokio::test]
    async fn copy_tree_copies_contents() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("src");
        std::fs::create_dir_all(src.join("debian")).unwrap();
        std::fs::write(src.join("debian/control"), b"Source: hello").unwrap();

        let dest = temp.path().join("merged/srv");
        copy_tree(&src, &dest, &CancelToken::never()).await.unwrap();
        assert!(dest.join("debian/control").exists());
    }

    #[tokio::test]
    async fn copy_tree_missing_source() {
        let temp = TempDir::new().unwrap();
        let err = copy_tree(&temp.path().join("nope"), temp.path(), &CancelToken::never())
            .await
            .unwrap_err();
        assert!(matches!(err, ConbuilderError::PathNotFound(_)));
    }
}
