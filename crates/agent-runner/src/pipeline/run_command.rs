//! Run-command detection from a built project's manifest

use std::path::Path;

use crate::error::Result;

fn package_runner(dir: &Path) -> &'static str {
    if dir.join("pnpm-lock.yaml").exists() {
        "pnpm"
    } else if dir.join("yarn.lock").exists() {
        "yarn"
    } else if dir.join("bun.lockb").exists() || dir.join("bun.lock").exists() {
        "bun"
    } else {
        "npm"
    }
}

/// Detect how to start the project in `dir`
///
/// Returns `Ok(None)` when no known manifest is present.
pub async fn detect_run_command(dir: &Path) -> Result<Option<String>> {
    let package_json = dir.join("package.json");
    if tokio::fs::try_exists(&package_json).await? {
        let raw = tokio::fs::read_to_string(&package_json).await?;
        let manifest: serde_json::Value = serde_json::from_str(&raw)?;
        let scripts = manifest.get("scripts");
        let has_script = |name: &str| scripts.and_then(|s| s.get(name)).is_some_and(|v| v.is_string());

        let runner = package_runner(dir);
        let command = if has_script("dev") {
            Some(match runner {
                "npm" => "npm run dev".to_string(),
                other => format!("{} dev", other),
            })
        } else if has_script("start") {
            Some(format!("{} start", runner))
        } else {
            None
        };
        return Ok(command);
    }

    if tokio::fs::try_exists(dir.join("Cargo.toml")).await? {
        return Ok(Some("cargo run".to_string()));
    }

    Ok(None)
}
