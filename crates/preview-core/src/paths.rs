use std::path::{Path, PathBuf};

// ---------------------------------------------------------------------------
// Directory constants
// ---------------------------------------------------------------------------

pub const PREVIEW_DIR: &str = ".preview";
pub const CONFIG_FILE: &str = ".preview/config.yaml";
pub const DB_FILE: &str = ".preview/preview.db";

// ---------------------------------------------------------------------------
// Path helpers
// ---------------------------------------------------------------------------

pub fn preview_dir(root: &Path) -> PathBuf {
    root.join(PREVIEW_DIR)
}

pub fn config_path(root: &Path) -> PathBuf {
    root.join(CONFIG_FILE)
}

pub fn db_path(root: &Path) -> PathBuf {
    root.join(DB_FILE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_live_under_preview_dir() {
        let root = Path::new("/srv/app");
        assert_eq!(config_path(root), PathBuf::from("/srv/app/.preview/config.yaml"));
        assert_eq!(db_path(root), PathBuf::from("/srv/app/.preview/preview.db"));
        assert!(db_path(root).starts_with(preview_dir(root)));
    }
}
