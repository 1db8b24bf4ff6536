use std::fs;
use std::path::{Path, PathBuf};

pub enum DirEntryCategory {
    DoesNotExist,
    RegularFile,
    SymbolicLink,
    Directory,
    Unknown,
}

pub fn classify_file(path: &PathBuf) -> DirEntryCategory {
    match fs::symlink_metadata(path) {
        Ok(metadata) => {
            if metadata.is_symlink() {
                DirEntryCategory::SymbolicLink
            } else if metadata.is_file() {
                DirEntryCategory::RegularFile
            } else if metadata.is_dir() {
                DirEntryCategory::Directory
            } else {
                DirEntryCategory::Unknown
            }
        },
        Err(_) => DirEntryCategory::DoesNotExist,
    }
}

/// Collect `.mkv` files under `dirpath`, sorted for a stable job order.
/// Unreadable subdirectories are skipped rather than failing the scan.
pub fn find_source_files(dirpath: &Path, recursive: bool) -> Vec<PathBuf> {
    let mut found = vec![];
    let mut dirpaths = vec![dirpath.to_path_buf()];
    while let Some(current_dir) = dirpaths.pop() {
        if let Ok(entries) = fs::read_dir(&current_dir) {
            for entry in entries.filter_map(|e| e.ok()) {
                if let Ok(ft) = entry.file_type() {
                    if ft.is_file() && has_mkv_extension(&entry.path()) {
                        found.push(entry.path());
                    } else if ft.is_dir() && recursive {
                        dirpaths.push(entry.path());
                    }
                }
            }
        }
    }
    found.sort();
    found
}

fn has_mkv_extension(path: &Path) -> bool {
    path.extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("mkv"))
}
