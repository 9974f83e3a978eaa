use anyhow::Context as _;
use std::fs::{self, OpenOptions};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

/// Last `kib` KiB of `path`, lossily decoded. `None` if the file does not exist.
pub fn read_tail(path: &Path, kib: u64) -> anyhow::Result<Option<String>> {
    let mut f = match fs::File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e).with_context(|| format!("open {}", path.display())),
    };
    let len = f.metadata().with_context(|| format!("stat {}", path.display()))?.len();
    let window = kib.saturating_mul(1024);
    let start = len.saturating_sub(window);
    f.seek(SeekFrom::Start(start))?;
    let mut buf = Vec::with_capacity((len - start) as usize);
    f.read_to_end(&mut buf)
        .with_context(|| format!("read {}", path.display()))?;
    Ok(Some(String::from_utf8_lossy(&buf).into_owned()))
}

/// Newest line first.
pub fn reverse_lines(s: &str) -> String {
    let mut lines: Vec<&str> = s.split('\n').collect();
    lines.reverse();
    lines.join("\n")
}

pub fn rotated_path(path: &Path) -> PathBuf {
    PathBuf::from(format!("{}.old", path.display()))
}

/// Copy-truncate rotation for a log a live child keeps open in append mode.
///
/// When `path` is at least `threshold` bytes, its content is copied to `<path>.old` and the file
/// is truncated in place. The writer's descriptor stays valid; its next append lands at offset 0.
/// Returns whether a rotation happened.
pub fn rotate_if_oversized(path: &Path, threshold: u64) -> anyhow::Result<bool> {
    let len = match fs::metadata(path) {
        Ok(m) => m.len(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e).with_context(|| format!("stat {}", path.display())),
    };
    if threshold == 0 || len < threshold {
        return Ok(false);
    }
    let old = rotated_path(path);
    fs::copy(path, &old).with_context(|| format!("copy {} -> {}", path.display(), old.display()))?;
    let f = OpenOptions::new()
        .write(true)
        .open(path)
        .with_context(|| format!("open {}", path.display()))?;
    f.set_len(0).with_context(|| format!("truncate {}", path.display()))?;
    Ok(true)
}
