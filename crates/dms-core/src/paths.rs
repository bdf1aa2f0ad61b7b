use std::path::{Path, PathBuf};

// ---------------------------------------------------------------------------
// Directory constants
// ---------------------------------------------------------------------------

pub const DMS_DIR: &str = ".dms";
pub const CONFIG_FILE: &str = "config.yaml";

pub const EMAILS_DIR: &str = "emails";
pub const WARNINGS_SUBDIR: &str = "warnings";

pub const TEMPLATE_EXT: &str = "txt";
pub const EXAMPLE_SUFFIX: &str = ".example.txt";

// ---------------------------------------------------------------------------
// Path helpers
// ---------------------------------------------------------------------------

pub fn dms_dir(root: &Path) -> PathBuf {
    root.join(DMS_DIR)
}

pub fn config_path(root: &Path) -> PathBuf {
    dms_dir(root).join(CONFIG_FILE)
}

/// Default template directory, relative to the repository root.
pub fn emails_dir(root: &Path) -> PathBuf {
    root.join(EMAILS_DIR)
}

pub fn warnings_dir(emails_dir: &Path) -> PathBuf {
    emails_dir.join(WARNINGS_SUBDIR)
}

pub fn is_example_template(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.ends_with(EXAMPLE_SUFFIX))
}
