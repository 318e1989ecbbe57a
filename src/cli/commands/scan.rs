//! `scan` command: crawl once, print a summary and the manifests found.

use std::path::Path;
use std::time::Instant;

use comfy_table::{ContentArrangement, Table, presets::UTF8_FULL};

use crate::config::Settings;
use crate::error::FsError;
use crate::manifest::{ManifestDefinition, ModuleType};
use crate::memory_fs::MemoryFs;
use crate::path::IndexPath;

pub async fn run(dir: &Path, settings: Settings, list_files: bool) -> anyhow::Result<()> {
    let root = IndexPath::absolute(dir)?;
    let fs = MemoryFs::builder().settings(settings).build()?;

    let started = Instant::now();
    match fs.watch(&root).await {
        Ok(()) => {}
        Err(FsError::Diagnostics { diagnostics, .. }) => {
            for diagnostic in &diagnostics {
                eprintln!("{diagnostic}");
            }
        }
        Err(e) => return Err(e.into()),
    }
    let elapsed = started.elapsed();

    println!(
        "Indexed {} files in {} directories ({elapsed:.2?})",
        fs.count_files(&root),
        fs.index().directory_count()
    );

    if list_files {
        for file in fs.get_all_files_in_directory(&root) {
            println!("  {}", display_relative(&file, &root));
        }
    }

    let manifests = fs.manifests();
    if manifests.is_empty() {
        println!("No manifests found");
    } else {
        println!("{}", manifest_table(&manifests, &root));
    }

    fs.unwatch_all();
    Ok(())
}

fn display_relative(path: &IndexPath, root: &IndexPath) -> String {
    match path.relative_to(root) {
        Some(relative) if relative.as_os_str().is_empty() => ".".to_string(),
        Some(relative) => relative.display().to_string(),
        None => path.to_string(),
    }
}

fn manifest_table(manifests: &[std::sync::Arc<ManifestDefinition>], root: &IndexPath) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec!["Directory", "Name", "Version", "Type", "Deps", "Hash"]);

    for definition in manifests {
        let manifest = &definition.manifest;
        let module_type = match manifest.module_type {
            Some(ModuleType::Module) => "module",
            Some(ModuleType::CommonJs) => "commonjs",
            None => "-",
        };
        table.add_row(vec![
            display_relative(&definition.directory, root),
            manifest.name.clone().unwrap_or_else(|| "-".to_string()),
            manifest.version.clone().unwrap_or_else(|| "-".to_string()),
            module_type.to_string(),
            manifest.dependencies.len().to_string(),
            definition.hash.chars().take(12).collect(),
        ]);
    }
    table
}
