//! Incremental directory discovery for source jobs and the GUI fast
//! scan.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use globset::{Glob, GlobSet, GlobSetBuilder};
use lightbox_config::ScanConfig;
use tracing::{debug, warn};

use crate::error::{CoreError, Result};
use crate::scheduler::BatchStream;
use crate::util::dotted_extension;

/// Walks directories lazily, yielding batches of supported files. Batch
/// granularity keeps priority-queue and notification overhead per slice
/// bounded.
#[derive(Clone)]
pub struct DirectoryScanner {
    supported_extensions: HashSet<String>,
    min_file_size: u64,
    ignore: GlobSet,
    batch_size: usize,
}

impl DirectoryScanner {
    pub fn new(supported_extensions: HashSet<String>, scan: &ScanConfig) -> Result<Self> {
        let mut builder = GlobSetBuilder::new();
        for pattern in &scan.ignore_patterns {
            builder.add(
                Glob::new(pattern)
                    .map_err(|err| CoreError::Internal(format!("bad ignore pattern: {err}")))?,
            );
        }
        Ok(Self {
            supported_extensions,
            min_file_size: scan.min_file_size,
            ignore: builder
                .build()
                .map_err(|err| CoreError::Internal(format!("ignore set: {err}")))?,
            batch_size: scan.batch_size.max(1),
        })
    }

    /// Ignore patterns and extension check first (no I/O), then the size
    /// gate so tiny files (web icons, app droppings) never reach the GUI
    /// model.
    fn accepts(&self, path: &Path, file_size: u64) -> bool {
        if let Some(name) = path.file_name()
            && self.ignore.is_match(Path::new(name))
        {
            return false;
        }
        let Some(extension) = dotted_extension(path) else {
            return false;
        };
        if !self.supported_extensions.contains(&extension) {
            return false;
        }
        file_size >= self.min_file_size
    }

    /// Lazy batch producer over `root`. The stream owns its state; each
    /// `next()` advances the walk just far enough for one batch.
    pub fn batches(&self, root: PathBuf, recursive: bool) -> BatchStream {
        let scanner = self.clone();
        Box::pin(async_stream::stream! {
            if !tokio::fs::try_exists(&root).await.unwrap_or(false) {
                warn!(root = %root.display(), "scan root does not exist");
                return;
            }
            let mut pending = vec![root];
            let mut batch: Vec<PathBuf> = Vec::with_capacity(scanner.batch_size);
            let mut total = 0usize;
            while let Some(dir) = pending.pop() {
                let mut entries = match tokio::fs::read_dir(&dir).await {
                    Ok(entries) => entries,
                    Err(err) => {
                        warn!(dir = %dir.display(), error = %err, "cannot read directory");
                        continue;
                    }
                };
                while let Ok(Some(entry)) = entries.next_entry().await {
                    let path = entry.path();
                    let Ok(file_type) = entry.file_type().await else {
                        continue;
                    };
                    if file_type.is_dir() {
                        if recursive {
                            pending.push(path);
                        }
                        continue;
                    }
                    let Ok(metadata) = entry.metadata().await else {
                        continue;
                    };
                    if scanner.accepts(&path, metadata.len()) {
                        batch.push(path);
                        if batch.len() >= scanner.batch_size {
                            total += batch.len();
                            yield std::mem::take(&mut batch);
                        }
                    }
                }
            }
            if !batch.is_empty() {
                total += batch.len();
                yield batch;
            }
            debug!(total, "directory scan exhausted");
        })
    }
}

impl std::fmt::Debug for DirectoryScanner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectoryScanner")
            .field("extensions", &self.supported_extensions.len())
            .field("batch_size", &self.batch_size)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    fn scanner() -> DirectoryScanner {
        let mut config = ScanConfig::default();
        config.min_file_size = 4;
        config.batch_size = 2;
        DirectoryScanner::new(
            [".jpg".to_string(), ".png".to_string()].into_iter().collect(),
            &config,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn walks_recursively_in_batches() {
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("sub");
        std::fs::create_dir(&sub).unwrap();
        for (name, content) in [
            ("a.jpg", "aaaaaa"),
            ("b.png", "bbbbbb"),
            ("skip.txt", "cccccc"),
            ("._hidden.jpg", "dddddd"),
            ("tiny.jpg", "e"),
        ] {
            std::fs::write(dir.path().join(name), content).unwrap();
        }
        std::fs::write(sub.join("c.jpg"), "ffffff").unwrap();

        let mut stream = scanner().batches(dir.path().to_path_buf(), true);
        let mut found = Vec::new();
        while let Some(batch) = stream.next().await {
            assert!(batch.len() <= 2);
            found.extend(batch);
        }
        let mut names: Vec<String> = found
            .iter()
            .filter_map(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
            .collect();
        names.sort();
        assert_eq!(names, vec!["a.jpg", "b.png", "c.jpg"]);
    }

    #[tokio::test]
    async fn non_recursive_skips_subdirectories() {
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("sub");
        std::fs::create_dir(&sub).unwrap();
        std::fs::write(dir.path().join("a.jpg"), "aaaaaa").unwrap();
        std::fs::write(sub.join("b.jpg"), "bbbbbb").unwrap();

        let mut stream = scanner().batches(dir.path().to_path_buf(), false);
        let mut found = Vec::new();
        while let Some(batch) = stream.next().await {
            found.extend(batch);
        }
        assert_eq!(found.len(), 1);
        assert!(found[0].ends_with("a.jpg"));
    }
}
