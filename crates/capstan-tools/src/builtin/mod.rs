//! Built-in tool implementations.
//!
//! Each tool is a self-contained module. To add a tool: create the file,
//! implement the Tool trait, add `pub mod <name>;` here, and register it in
//! `create_default_registry()` in ../lib.rs.

pub mod delete_file;
pub mod list_dir;
pub mod read_file;
pub mod run_command;
pub mod search_text;
pub mod write_file;

use std::path::{Path, PathBuf};

/// Root-relative resolution. Absolute paths were already checked against
/// the workspace by the scheduler's validation pass.
pub(crate) fn resolve(root: &Path, raw: &str) -> PathBuf {
    let p = Path::new(raw);
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        root.join(p)
    }
}

pub(crate) fn truncate_output(s: String, cap: usize) -> String {
    if s.len() <= cap {
        return s;
    }
    let mut cut = cap;
    while !s.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}\n... [truncated, {} total chars]", &s[..cut], s.len())
}
