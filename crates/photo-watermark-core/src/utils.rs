//! Utility functions and helpers

/// Path utilities
pub mod path {
    use std::path::{Component, Path, PathBuf};

    /// Lexically normalize a path: drop `.` components and fold `..` into
    /// the preceding component. Does not touch the filesystem.
    pub fn normalize_path(path: &Path) -> PathBuf {
        let mut out = PathBuf::new();
        for component in path.components() {
            match component {
                Component::CurDir => {}
                Component::ParentDir => {
                    if !out.pop() {
                        out.push(component);
                    }
                }
                other => out.push(other),
            }
        }
        out
    }

    /// Final component of an uploaded file name, splitting on both `/` and `\`
    pub fn source_file_name(name: &str) -> &str {
        name.rsplit(['/', '\\']).next().unwrap_or(name)
    }
}

/// Time utilities
pub mod time {
    use chrono::{DateTime, SecondsFormat, Utc};

    /// RFC 3339 UTC instant with `:` replaced by `-`, safe for directory names
    pub fn export_timestamp(now: DateTime<Utc>) -> String {
        now.to_rfc3339_opts(SecondsFormat::Millis, true).replace(':', "-")
    }
}

/// System information utilities
pub mod system {
    /// Minimum number of export workers
    pub const MIN_WORKERS: usize = 2;

    pub fn cpu_count() -> usize {
        num_cpus::get()
    }

    /// Worker pool size: the configured value, or CPU parallelism, floored at 2
    pub fn worker_count(configured: Option<usize>) -> usize {
        configured
            .filter(|n| *n > 0)
            .unwrap_or_else(cpu_count)
            .max(MIN_WORKERS)
    }
}

pub use path::{normalize_path, source_file_name};
