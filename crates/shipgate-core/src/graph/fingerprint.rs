use std::io;
use std::path::Path;

use sha2::{Digest, Sha256};
use shipgate_state::ContentDigest;
use walkdir::WalkDir;

use super::{TaskInput, TaskSpec};
use crate::error::Result;

/// Fingerprint of a task's declared inputs and outputs.
///
/// `None` when the task declares no inputs: such tasks always run.
/// Missing files hash as a fixed marker rather than failing, so a deleted
/// output makes the task out of date.
pub fn fingerprint(task: &TaskSpec) -> Result<Option<ContentDigest>> {
    if task.inputs.is_empty() {
        return Ok(None);
    }

    let mut hasher = Sha256::new();
    hasher.update(b"task\0");
    hasher.update(task.name.as_bytes());

    for input in &task.inputs {
        match input {
            TaskInput::File { path } => {
                hasher.update(b"\0file\0");
                hasher.update(path.to_string_lossy().as_bytes());
                hash_path(&mut hasher, path)?;
            }
            TaskInput::Dir { path } => {
                hasher.update(b"\0dir\0");
                hasher.update(path.to_string_lossy().as_bytes());
                hash_path(&mut hasher, path)?;
            }
            TaskInput::Value { name, value } => {
                hasher.update(b"\0value\0");
                hasher.update(name.as_bytes());
                hasher.update(b"=");
                hasher.update(value.as_bytes());
            }
        }
    }

    for output in &task.outputs {
        hasher.update(b"\0out\0");
        hasher.update(output.to_string_lossy().as_bytes());
        hash_path(&mut hasher, output)?;
    }

    Ok(Some(ContentDigest::from_hasher(hasher)))
}

fn hash_path(hasher: &mut Sha256, path: &Path) -> Result<()> {
    if path.is_dir() {
        for entry in WalkDir::new(path).sort_by_file_name() {
            let entry = entry.map_err(io::Error::from)?;
            if !entry.file_type().is_file() {
                continue;
            }
            let rel = entry.path().strip_prefix(path).unwrap_or(entry.path());
            hasher.update(b"\0entry\0");
            hasher.update(rel.to_string_lossy().as_bytes());
            hash_file(hasher, entry.path())?;
        }
        Ok(())
    } else if path.is_file() {
        hash_file(hasher, path)
    } else {
        hasher.update(b"\0missing");
        Ok(())
    }
}

fn hash_file(hasher: &mut Sha256, path: &Path) -> Result<()> {
    let content = std::fs::read(path)?;
    hasher.update(Sha256::digest(&content));
    Ok(())
}
