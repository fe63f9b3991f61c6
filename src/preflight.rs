use std::path::Path;

use anyhow::Context;
use dialoguer::Confirm;
use owo_colors::OwoColorize;
use serde_json::Value;
use tokio::task;

use crate::paths::ProjectPaths;

/// Checks that every required file exists, printing a diagnostic for each one
/// that is missing. Startup must not proceed past a `false` result.
pub fn check_required_files<P: AsRef<Path>>(files: &[P]) -> bool {
    let mut all_present = true;

    for file in files {
        let file = file.as_ref();
        if file.is_file() {
            continue;
        }
        if all_present {
            println!("{}", "Could not find a required file.".red());
        }
        let name = file
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| file.display().to_string());
        let searched = file
            .parent()
            .map(|dir| dir.display().to_string())
            .unwrap_or_default();
        println!("  {} {}", "Name:".red(), name.cyan());
        println!("  {} {}", "Searched in:".red(), searched.cyan());
        all_present = false;
    }

    all_present
}

/// Browser targets must be explicit: either a `browserslist` key in
/// package.json or a `.browserslistrc` file. In an interactive session the
/// user is offered the defaults; declining (or a non-interactive session) is
/// a fatal configuration error.
pub async fn check_browser_targets(paths: &ProjectPaths, interactive: bool) -> anyhow::Result<()> {
    if has_browser_targets(paths)? {
        return Ok(());
    }

    if interactive {
        println!(
            "{}",
            "Your project does not specify targeted browsers.".yellow()
        );
        let accepted = task::spawn_blocking(|| {
            Confirm::new()
                .with_prompt("Would you like to add the defaults to your package.json?")
                .default(true)
                .interact()
        })
        .await??;

        if accepted {
            write_default_targets(&paths.package_json)?;
            println!("{}", "Set target browsers to the defaults.".green());
            return Ok(());
        }
    }

    anyhow::bail!("You must specify targeted browsers.")
}

fn has_browser_targets(paths: &ProjectPaths) -> anyhow::Result<bool> {
    if paths.browserslistrc.is_file() {
        return Ok(true);
    }

    let raw = std::fs::read_to_string(&paths.package_json)
        .with_context(|| format!("failed to read {}", paths.package_json.display()))?;
    let manifest: Value = serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse {}", paths.package_json.display()))?;

    Ok(manifest.get("browserslist").is_some())
}

fn write_default_targets(package_json: &Path) -> anyhow::Result<()> {
    let raw = std::fs::read_to_string(package_json)
        .with_context(|| format!("failed to read {}", package_json.display()))?;
    let mut manifest: Value = serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse {}", package_json.display()))?;

    let defaults = serde_json::json!({
        "production": [">0.2%", "not dead", "not op_mini all"],
        "development": [
            "last 1 chrome version",
            "last 1 firefox version",
            "last 1 safari version"
        ]
    });

    manifest
        .as_object_mut()
        .context("package.json must contain a JSON object")?
        .insert("browserslist".to_string(), defaults);

    let pretty = serde_json::to_string_pretty(&manifest)?;
    std::fs::write(package_json, pretty + "\n")
        .with_context(|| format!("failed to write {}", package_json.display()))?;
    Ok(())
}
