//! `sporemesh publish` - store a spore in the content-addressed repository.

use std::path::Path;

use anyhow::{Context, Result};
use sporemesh_core::bundle;
use sporemesh_core::repo::Repository;

pub fn run(spore: &Path, repo_dir: &Path) -> Result<()> {
    let manifest = bundle::verify(spore)
        .with_context(|| format!("refusing to publish unverifiable spore {}", spore.display()))?;

    let repo = Repository::open(repo_dir)
        .with_context(|| format!("failed to open repository {}", repo_dir.display()))?;
    let (digest, stored) = repo
        .put(spore)
        .with_context(|| format!("failed to store {}", spore.display()))?;

    println!("published {} {}", manifest.name, manifest.version);
    println!("  digest: {digest}");
    println!("  stored: {}", stored.display());
    Ok(())
}
