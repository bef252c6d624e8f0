use std::fs;
use std::path::{Path, PathBuf};

use pe_api::Definitions;
use tracing::debug;
use walkdir::WalkDir;

use crate::{map_cli_source_path, map_cli_source_read, map_cli_source_scan, CliError};

/// Reads one definition file, or every `*.json` file below a directory in
/// file name order, and merges them.
pub(crate) fn load_definitions(definitions: &str) -> Result<Definitions, CliError> {
    let root = resolve_definitions_path(definitions)?;
    let files = if root.is_dir() {
        collect_definition_files(&root)?
    } else {
        vec![root.clone()]
    };

    let mut merged = Definitions::default();
    for file in files {
        let origin = origin_name(&root, &file);
        let text = fs::read_to_string(&file).map_err(map_cli_source_read)?;
        let parsed = Definitions::from_json_str(&origin, &text)?;
        debug!(
            file = %origin,
            pools = parsed.pools.len(),
            procedures = parsed.procedures.len(),
            "definition file loaded"
        );
        merged.merge(&origin, parsed)?;
    }
    Ok(merged)
}

pub(crate) fn resolve_definitions_path(definitions: &str) -> Result<PathBuf, CliError> {
    let path = PathBuf::from(definitions);
    let absolute = if path.is_absolute() {
        path
    } else {
        std::env::current_dir()
            .map_err(map_cli_source_path)?
            .join(path)
    };

    if !absolute.exists() {
        return Err(CliError::new(
            "CLI_SOURCE_NOT_FOUND",
            format!("definitions path does not exist: {}", absolute.display()),
        ));
    }
    Ok(absolute)
}

pub(crate) fn collect_definition_files(root: &Path) -> Result<Vec<PathBuf>, CliError> {
    let mut files = Vec::new();
    for entry in WalkDir::new(root).follow_links(false).sort_by_file_name() {
        let entry = entry.map_err(map_cli_source_scan)?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        if path.extension().and_then(|extension| extension.to_str()) == Some("json") {
            files.push(path.to_path_buf());
        }
    }

    if files.is_empty() {
        return Err(CliError::new(
            "CLI_SOURCE_EMPTY",
            format!("no .json definition files under {}", root.display()),
        ));
    }
    Ok(files)
}

fn origin_name(root: &Path, file: &Path) -> String {
    let relative = file.strip_prefix(root).unwrap_or(file);
    let name = if relative.as_os_str().is_empty() {
        file.file_name().map(Path::new).unwrap_or(file)
    } else {
        relative
    };
    name.to_string_lossy().replace('\\', "/")
}
