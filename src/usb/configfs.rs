//! Small helpers over configfs attribute files and directories

use std::fs::{self, OpenOptions};
use std::io::{self, ErrorKind, Write};
use std::path::Path;

use crate::error::{AppError, Result};

fn fs_error<'a>(action: &'static str, path: &'a Path) -> impl FnOnce(io::Error) -> AppError + 'a {
    move |e| AppError::Internal(format!("configfs {} {}: {}", action, path.display(), e))
}

/// Treat "already gone" as success
fn ignore_missing(result: io::Result<()>) -> io::Result<()> {
    match result {
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

/// First UDC listed under `udc_class_path`, by name
pub fn find_udc(udc_class_path: &Path) -> Option<String> {
    fs::read_dir(udc_class_path)
        .ok()?
        .flatten()
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .min()
}

/// Write a configfs attribute
///
/// The kernel parses the value on the first write(), so the whole buffer,
/// newline included, goes out in a single call.
pub fn write_file(path: &Path, content: &str) -> Result<()> {
    let mut line = String::with_capacity(content.len() + 1);
    line.push_str(content);
    if !line.ends_with('\n') {
        line.push('\n');
    }

    // configfs attributes exist already; plain files (tests, UDC) may not
    let mut file = OpenOptions::new()
        .write(true)
        .truncate(true)
        .create(!path.exists())
        .open(path)
        .map_err(fs_error("open", path))?;
    file.write_all(line.as_bytes())
        .map_err(fs_error("write", path))
}

/// Attribute value without surrounding whitespace
pub fn read_file(path: &Path) -> Result<String> {
    let raw = fs::read_to_string(path).map_err(fs_error("read", path))?;
    Ok(raw.trim().to_owned())
}

pub fn create_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).map_err(fs_error("mkdir", path))
}

/// rmdir; a missing directory is not an error
pub fn remove_dir(path: &Path) -> Result<()> {
    ignore_missing(fs::remove_dir(path)).map_err(fs_error("rmdir", path))
}

/// Unlink a file or symlink (dangling ones included); missing is not an error
pub fn remove_file(path: &Path) -> Result<()> {
    ignore_missing(fs::remove_file(path)).map_err(fs_error("unlink", path))
}

/// `dest` -> `src`
pub fn create_symlink(src: &Path, dest: &Path) -> Result<()> {
    std::os::unix::fs::symlink(src, dest).map_err(fs_error("link", dest))
}
