use std::path::Path;

use dra_core::DraConfig;

pub fn init(dir: &Path, current: &DraConfig, node_name: Option<&str>) -> anyhow::Result<()> {
    let output = dir.join("dra.toml");
    if output.exists() {
        anyhow::bail!("{} already exists", output.display());
    }
    let node_name = node_name.or(current.allocator.node_name.as_deref());
    let config = DraConfig::scaffold(&current.store.path, node_name);
    std::fs::write(&output, config.to_toml_string()?)?;
    println!("✓ Generated {}", output.display());
    Ok(())
}
