use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Atomically write bytes to a file by writing to a temp file then renaming.
///
/// Parent directories are created as needed. Readers see either the old
/// contents or the new contents, never a partial write.
///
/// # Errors
/// Returns an error if the write or rename fails.
pub fn atomic_write(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let parent = path.parent().unwrap_or(Path::new("."));
    fs::create_dir_all(parent)?;

    // Same directory keeps the rename on one filesystem
    let mut temp_path = parent.to_path_buf();
    temp_path.push(format!(
        ".{}.tmp.{}",
        path.file_name().and_then(|n| n.to_str()).unwrap_or("file"),
        std::process::id()
    ));

    {
        let mut file = File::create(&temp_path)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }

    match fs::rename(&temp_path, path) {
        Ok(()) => Ok(()),
        Err(e) => {
            // Windows refuses to rename over an existing file
            if cfg!(windows) {
                fs::copy(&temp_path, path)?;
                let _ = fs::remove_file(&temp_path);
                Ok(())
            } else {
                let _ = fs::remove_file(&temp_path);
                Err(e)
            }
        }
    }
}

/// Root-relative URL path for a file (`/src/main.js`), always with forward slashes.
///
/// Files outside `root` are addressed through the `/@fs` prefix.
#[must_use]
pub fn url_path(root: &Path, path: &Path) -> String {
    match path.strip_prefix(root) {
        Ok(rel) => format!("/{}", normalize_separators(rel)),
        Err(_) => format!("/@fs/{}", normalize_separators(path).trim_start_matches('/')),
    }
}

/// Render a path with forward slashes regardless of platform.
fn normalize_separators(path: &Path) -> String {
    path.components()
        .filter_map(|c| match c {
            std::path::Component::Normal(s) => Some(s.to_string_lossy().into_owned()),
            std::path::Component::RootDir => Some(String::new()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// Copy every file under `src` into `dst`, preserving relative layout.
///
/// Returns the destination paths, sorted. A missing `src` copies nothing.
///
/// # Errors
/// Returns an error if walking or copying fails.
pub fn copy_tree(src: &Path, dst: &Path) -> io::Result<Vec<PathBuf>> {
    let mut copied = Vec::new();
    if !src.is_dir() {
        return Ok(copied);
    }

    for entry in WalkDir::new(src).follow_links(false).sort_by_file_name() {
        let entry = entry.map_err(io::Error::other)?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry.path().strip_prefix(src).unwrap_or(entry.path());
        let target = dst.join(rel);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(entry.path(), &target)?;
        copied.push(target);
    }

    Ok(copied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_atomic_write_creates_parents_and_overwrites() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dist").join("assets").join("a.js");

        atomic_write(&path, b"first").unwrap();
        atomic_write(&path, b"second").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "second");

        let entries: Vec<_> = fs::read_dir(path.parent().unwrap()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn test_url_path_inside_and_outside_root() {
        let root = Path::new("/project");
        assert_eq!(
            url_path(root, Path::new("/project/src/main.js")),
            "/src/main.js"
        );
        assert_eq!(
            url_path(root, Path::new("/elsewhere/lib.js")),
            "/@fs/elsewhere/lib.js"
        );
    }

    #[test]
    fn test_url_path_uses_forward_slashes() {
        let root = Path::new("/project");
        let nested: PathBuf = ["/project", "src", "deep", "a.js"].iter().collect();
        assert_eq!(url_path(root, &nested), "/src/deep/a.js");
    }

    #[test]
    fn test_copy_tree() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("public");
        fs::create_dir_all(src.join("img")).unwrap();
        fs::write(src.join("robots.txt"), "ok").unwrap();
        fs::write(src.join("img").join("logo.svg"), "<svg/>").unwrap();

        let dst = dir.path().join("dist");
        let copied = copy_tree(&src, &dst).unwrap();
        assert_eq!(copied.len(), 2);
        assert_eq!(fs::read_to_string(dst.join("img/logo.svg")).unwrap(), "<svg/>");
    }

    #[test]
    fn test_copy_tree_missing_source() {
        let dir = tempdir().unwrap();
        let copied = copy_tree(&dir.path().join("nope"), &dir.path().join("out")).unwrap();
        assert!(copied.is_empty());
    }
}
