use std::path::Path;

use anyhow::Context;
use ironpool_core::PoolConfig;

pub fn check(path: &Path) -> anyhow::Result<()> {
    let config = load(path)?;
    println!("✓ {} is valid", path.display());
    println!();
    print!("{}", config.to_toml_string()?);
    Ok(())
}

fn load(path: &Path) -> anyhow::Result<PoolConfig> {
    PoolConfig::from_file(path).with_context(|| format!("failed to load {}", path.display()))
}
