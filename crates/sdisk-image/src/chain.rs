//! Backing-chain walker

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use sdisk_common::{DiskError, DiskResult};

use crate::tool::ImageTool;

/// Absolute, lexically normalized form of `path` used for revisit detection
fn chain_key(path: &Path) -> PathBuf {
    let abs = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
    let mut out = PathBuf::new();
    for part in abs.components() {
        match part {
            std::path::Component::ParentDir => {
                out.pop();
            }
            std::path::Component::CurDir => {}
            other => out.push(other),
        }
    }
    out
}

/// Follow backing references from `start` and return every image visited,
/// top first.
///
/// Fails with an integrity violation when the chain revisits an image,
/// loops back to `start`, or is longer than `max_depth`.
pub async fn walk_backing_chain<T>(
    tool: &T,
    start: &Path,
    max_depth: usize,
) -> DiskResult<Vec<PathBuf>>
where
    T: ImageTool + ?Sized,
{
    let start_key = chain_key(start);
    let mut visited = HashSet::from([start_key.clone()]);
    let mut chain = vec![start.to_path_buf()];
    let mut current = start.to_path_buf();

    while let Some(backing) = tool.backing_file(&current).await? {
        let key = chain_key(&backing);
        if key == start_key {
            return Err(DiskError::integrity(format!(
                "backing chain of {} loops back to itself",
                start.display()
            )));
        }
        if !visited.insert(key) {
            return Err(DiskError::integrity(format!(
                "backing chain of {} revisits {}",
                start.display(),
                backing.display()
            )));
        }
        if chain.len() >= max_depth {
            return Err(DiskError::integrity(format!(
                "backing chain of {} exceeds maximum depth {max_depth}",
                start.display()
            )));
        }
        chain.push(backing.clone());
        current = backing;
    }

    Ok(chain)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::FakeImageTool;
    use sdisk_common::ImageConfig;

    #[tokio::test]
    async fn test_walk_linear_chain() {
        let dir = tempfile::tempdir().unwrap();
        let tool = FakeImageTool::new();
        let base = dir.path().join("base.qcow2");
        let mid = dir.path().join("mid.qcow2");
        let top = dir.path().join("top.qcow2");
        tool.create(&base, 1, &ImageConfig::default()).await.unwrap();
        tool.create_with_backing(&base, &mid, 0).await.unwrap();
        tool.create_with_backing(&mid, &top, 0).await.unwrap();

        let chain = tool.validate_backing_chain(&top).await.unwrap();
        assert_eq!(chain, vec![top, mid, base]);
    }

    #[tokio::test]
    async fn test_loop_back_to_start() {
        let dir = tempfile::tempdir().unwrap();
        let tool = FakeImageTool::new();
        let base = dir.path().join("base.qcow2");
        let top = dir.path().join("top.qcow2");
        tool.create(&base, 1, &ImageConfig::default()).await.unwrap();
        tool.create_with_backing(&base, &top, 0).await.unwrap();
        tool.rebase_unsafe(&base, Some(&top)).await.unwrap();

        let err = tool.validate_backing_chain(&top).await.unwrap_err();
        assert!(err.is_integrity());
        assert!(err.to_string().contains("loops back"));
    }

    #[tokio::test]
    async fn test_revisit_below_start() {
        let dir = tempfile::tempdir().unwrap();
        let tool = FakeImageTool::new();
        let a = dir.path().join("a.qcow2");
        let b = dir.path().join("b.qcow2");
        let top = dir.path().join("top.qcow2");
        tool.create(&a, 1, &ImageConfig::default()).await.unwrap();
        tool.create_with_backing(&a, &b, 0).await.unwrap();
        tool.create_with_backing(&b, &top, 0).await.unwrap();
        // relative reference back to b through a parent-dir hop
        let sub = dir.path().join("sub");
        std::fs::create_dir(&sub).unwrap();
        tool.rebase_unsafe(&a, Some(&sub.join("../b.qcow2"))).await.unwrap();

        let err = walk_backing_chain(&tool, &top, 1000).await.unwrap_err();
        assert!(err.to_string().contains("revisits"));
    }

    #[tokio::test]
    async fn test_depth_limit() {
        let dir = tempfile::tempdir().unwrap();
        let tool = FakeImageTool::new();
        let mut prev = dir.path().join("0.qcow2");
        tool.create(&prev, 1, &ImageConfig::default()).await.unwrap();
        for i in 1..5 {
            let next = dir.path().join(format!("{i}.qcow2"));
            tool.create_with_backing(&prev, &next, 0).await.unwrap();
            prev = next;
        }
        assert_eq!(walk_backing_chain(&tool, &prev, 5).await.unwrap().len(), 5);
        assert!(walk_backing_chain(&tool, &prev, 4).await.unwrap_err().is_integrity());
    }
}
