//! `sporemesh build` - pack a binary and manifest into a signed spore.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use sporemesh_core::bundle::{
    Manifest, generate_signing_key, load_signing_key, pack, save_signing_key,
};

pub fn run(binary: &Path, manifest_path: &Path, key: Option<&Path>, out: &Path) -> Result<()> {
    let raw = fs::read_to_string(manifest_path)
        .with_context(|| format!("failed to read manifest {}", manifest_path.display()))?;
    let manifest: Manifest = serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse manifest {}", manifest_path.display()))?;

    fs::create_dir_all(out)
        .with_context(|| format!("failed to create output directory {}", out.display()))?;

    let signing_key = match key {
        Some(path) => load_signing_key(path)
            .with_context(|| format!("failed to load signing key {}", path.display()))?,
        None => {
            let default_path = out.join("signing.key");
            if default_path.exists() {
                println!("using signing key {}", default_path.display());
                load_signing_key(&default_path)
                    .with_context(|| format!("failed to load {}", default_path.display()))?
            } else {
                let key = generate_signing_key();
                save_signing_key(&default_path, &key)
                    .with_context(|| format!("failed to save {}", default_path.display()))?;
                println!("generated signing key {}", default_path.display());
                key
            }
        }
    };

    let (archive, manifest) = pack(binary, manifest, &signing_key, out)
        .with_context(|| format!("failed to pack {}", binary.display()))?;

    println!("spore created: {}", archive.display());
    println!("  name:          {}", manifest.name);
    println!("  version:       {}", manifest.version);
    println!("  binary sha256: {}", manifest.binary_sha256);
    Ok(())
}
