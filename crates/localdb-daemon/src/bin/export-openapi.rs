use std::{env, fs, path::Path};

use anyhow::{Context, Result};
use localdb_daemon::server::docs::ApiDoc;
use utoipa::OpenApi;

fn main() -> Result<()> {
    let output = env::args().nth(1);
    let yaml = ApiDoc::openapi()
        .to_yaml()
        .context("failed to serialise OpenAPI")?;

    match output {
        Some(path) => {
            let path = Path::new(&path);
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
            fs::write(path, yaml).with_context(|| format!("failed to write {}", path.display()))?;
        }
        None => println!("{yaml}"),
    }
    Ok(())
}
