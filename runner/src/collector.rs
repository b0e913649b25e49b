use globset::{GlobBuilder, GlobMatcher};
use ignore::{DirEntry, WalkBuilder};
use itertools::Itertools;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// File name of a per replica artifact: `<prefix><replica id><suffix>`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ArtifactPattern {
    pub prefix: &'static str,
    pub suffix: &'static str,
}

impl ArtifactPattern {
    pub const fn new(prefix: &'static str, suffix: &'static str) -> Self {
        Self { prefix, suffix }
    }

    pub fn file_name(&self, replica_id: &str) -> String {
        format!("{}{replica_id}{}", self.prefix, self.suffix)
    }

    pub fn path(&self, dir: &Path, replica_id: &str) -> PathBuf {
        dir.join(self.file_name(replica_id))
    }

    /// extract the replica id from a matching file name
    pub fn replica_id<'a>(&self, file_name: &'a str) -> Option<&'a str> {
        file_name
            .strip_prefix(self.prefix)?
            .strip_suffix(self.suffix)
            .filter(|id| !id.is_empty())
    }

    fn glob(&self) -> String {
        format!(
            "{}*{}",
            globset::escape(self.prefix),
            globset::escape(self.suffix)
        )
    }
}

/// Scans a batch directory for the artifacts of one pattern
#[derive(Debug)]
pub struct Collector {
    pattern: ArtifactPattern,
    matcher: GlobMatcher,
}

impl Collector {
    pub fn new(pattern: ArtifactPattern) -> Result<Self, globset::Error> {
        let matcher = GlobBuilder::new(&pattern.glob())
            .literal_separator(true)
            .build()?
            .compile_matcher();
        debug!("Filtering with glob: {matcher:?}");

        Ok(Self { pattern, matcher })
    }

    /// sorted replica ids of every matching file directly inside `dir`
    pub fn collect(&self, dir: &Path) -> Vec<String> {
        // optimizers write hidden or ignored names just as well, take everything
        WalkBuilder::new(dir)
            .standard_filters(false)
            .max_depth(Some(1))
            .build()
            .filter_map(|entry| match entry {
                Ok(entry) => Some(entry),
                Err(e) => {
                    warn!("Failed to search {} for artifacts: {e}", dir.to_string_lossy());
                    None
                }
            })
            .filter(|entry| entry.depth() == 1 && entry.file_type().is_some_and(|t| t.is_file()))
            .map(DirEntry::into_path)
            .filter_map(|path| {
                let name = path.file_name()?.to_str()?;

                if self.matcher.is_match(name) {
                    self.pattern.replica_id(name).map(str::to_owned)
                } else {
                    None
                }
            })
            .sorted()
            .dedup()
            .collect_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn strips_prefix_and_suffix() {
        let garli = ArtifactPattern::new("", ".best.phy");

        assert_eq!(garli.replica_id("h3.0004.best.phy"), Some("h3.0004"));
        assert_eq!(garli.replica_id(".best.phy"), None);
        assert_eq!(garli.replica_id("h3.0004.best.all.phy"), None);
        assert_eq!(garli.file_name("h3.0004"), "h3.0004.best.phy");
    }

    #[test]
    fn collects_only_top_level_matches() {
        let dir = tempdir().unwrap();
        fs::create_dir(dir.path().join("output")).unwrap();
        for name in [
            "b.0001.best.phy",
            "a.0000.best.phy",
            "a.0000.log00.log",
            "output/c.0002.best.phy",
        ] {
            fs::write(dir.path().join(name), "").unwrap();
        }
        // a directory with a matching name is not an artifact
        fs::create_dir(dir.path().join("d.0003.best.phy")).unwrap();

        let collector = Collector::new(ArtifactPattern::new("", ".best.phy")).unwrap();

        assert_eq!(
            collector.collect(dir.path()),
            vec!["a.0000".to_owned(), "b.0001".to_owned()]
        );
    }

    #[test]
    fn missing_directory_collects_nothing() {
        let collector = Collector::new(ArtifactPattern::new("RAxML_bestTree.", "")).unwrap();

        assert!(collector.collect(Path::new("/nonexistent/batch")).is_empty());
    }
}
