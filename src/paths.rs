//! The `~/.wave` home area: session files, plan documents, and snapshot blobs.

use rand::{distr::Alphanumeric, RngExt};
use std::io;
use std::path::{Path, PathBuf};

/// Directory layout rooted at the user home area (`<home>/.wave` by
/// default). Tests construct one over a temp directory with [`WaveDirs::at`].
#[derive(Debug, Clone)]
pub struct WaveDirs {
    root: PathBuf,
}

impl WaveDirs {
    /// Resolve the default `<home>/.wave` root.
    pub fn new() -> io::Result<Self> {
        let home = dirs::home_dir()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no home directory"))?;
        Ok(Self {
            root: home.join(".wave"),
        })
    }

    /// Use an explicit root instead of the home area.
    pub fn at(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sessions(&self) -> PathBuf {
        self.root.join("sessions")
    }

    pub fn plans(&self) -> PathBuf {
        self.root.join("plans")
    }

    pub fn snapshots(&self) -> PathBuf {
        self.root.join("snapshots")
    }

    /// Create a fresh plan document at `plans/<random-name>.md` and return
    /// its path. The directory is created on demand.
    pub fn create_plan_file(&self) -> io::Result<PathBuf> {
        let dir = self.plans();
        std::fs::create_dir_all(&dir)?;
        let name: String = rand::rng()
            .sample_iter(&Alphanumeric)
            .take(12)
            .map(char::from)
            .collect();
        let path = dir.join(format!("{}.md", name.to_lowercase()));
        std::fs::write(&path, "")?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_is_rooted() {
        let dirs = WaveDirs::at("/tmp/wave-test");
        assert_eq!(dirs.sessions(), PathBuf::from("/tmp/wave-test/sessions"));
        assert_eq!(dirs.plans(), PathBuf::from("/tmp/wave-test/plans"));
        assert_eq!(dirs.snapshots(), PathBuf::from("/tmp/wave-test/snapshots"));
    }

    #[test]
    fn plan_files_are_created_on_demand() {
        let tmp = tempfile::tempdir().unwrap();
        let dirs = WaveDirs::at(tmp.path());
        let a = dirs.create_plan_file().unwrap();
        let b = dirs.create_plan_file().unwrap();
        assert!(a.exists());
        assert!(b.exists());
        assert_ne!(a, b);
        assert_eq!(a.extension().unwrap(), "md");
    }
}
