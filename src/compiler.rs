use std::path::{Path, PathBuf};

use anyhow::Context;
use notify::{RecommendedWatcher, RecursiveMode, Watcher, event::EventKind, recommended_watcher};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{Duration, sleep};

use crate::cli::{self, ReadyBanner};
use crate::context::PackageManager;
use crate::paths::ProjectPaths;
use crate::urls::ResolvedUrls;

pub const MIN_FAST_REFRESH_VERSION: &str = "16.10.0";
const REBUILD_DEBOUNCE: Duration = Duration::from_millis(120);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Development,
}

impl Mode {
    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Development => "development",
        }
    }
}

/// Configuration handed to the compiler factory. Pure data, produced once.
#[derive(Debug, Clone)]
pub struct BuildConfig {
    pub mode: Mode,
    pub source_dir: PathBuf,
    pub static_dir: PathBuf,
    pub node_modules: PathBuf,
    pub tsconfig: PathBuf,
    pub public_url_prefix: String,
    pub fast_refresh: bool,
}

pub fn build_config(mode: Mode, paths: &ProjectPaths, fast_refresh: bool, public_url_prefix: &str) -> BuildConfig {
    BuildConfig {
        mode,
        source_dir: paths.src_dir.clone(),
        static_dir: paths.public_dir.clone(),
        node_modules: paths.node_modules.clone(),
        tsconfig: paths.tsconfig.clone(),
        public_url_prefix: public_url_prefix.to_string(),
        fast_refresh,
    }
}

/// Event stream the compiler emits towards connected browsers.
#[derive(Clone, Debug, serde::Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum CompilerEvent {
    Rebuilding,
    Reload,
}

/// Owns the incremental build watcher. Its lifetime is bound to the server:
/// the lifecycle manager calls [`CompilerHandle::close`] when it stops.
pub struct CompilerHandle {
    app_name: String,
    fast_refresh: bool,
    runtime_version: Option<String>,
    banner: ReadyBanner,
    broadcaster: broadcast::Sender<CompilerEvent>,
    watcher: Option<RecommendedWatcher>,
}

impl CompilerHandle {
    pub fn create(
        app_name: &str,
        config: BuildConfig,
        urls: &ResolvedUrls,
        package_manager: PackageManager,
        uses_typescript: bool,
    ) -> anyhow::Result<Self> {
        let (broadcaster, _) = broadcast::channel(64);

        let (mut watcher, notify_rx) = create_watcher(&config.source_dir)?;
        if uses_typescript && config.tsconfig.is_file() {
            watcher
                .watch(&config.tsconfig, RecursiveMode::NonRecursive)
                .with_context(|| format!("failed to watch {}", config.tsconfig.display()))?;
        }
        spawn_event_loop(broadcaster.clone(), notify_rx);

        Ok(Self {
            app_name: app_name.to_string(),
            fast_refresh: config.fast_refresh,
            runtime_version: installed_runtime_version(&config.node_modules),
            banner: ReadyBanner::new(app_name, urls, package_manager.build_command()),
            broadcaster,
            watcher: Some(watcher),
        })
    }

    pub fn app_name(&self) -> &str {
        &self.app_name
    }

    pub fn event_sender(&self) -> broadcast::Sender<CompilerEvent> {
        self.broadcaster.clone()
    }

    /// Prints the post-start instructions prepared at creation time.
    pub fn announce_ready(&self) {
        cli::print_ready_banner(&self.banner);
    }

    pub fn fast_refresh_advisory(&self) -> Option<String> {
        advisory_for(self.fast_refresh, self.runtime_version.as_deref())
    }

    /// Stops watching and releases the filesystem handles. Safe to call more
    /// than once.
    pub fn close(&mut self) {
        self.watcher.take();
    }
}

fn create_watcher(
    source_dir: &Path,
) -> anyhow::Result<(
    RecommendedWatcher,
    mpsc::UnboundedReceiver<notify::Result<notify::Event>>,
)> {
    let (tx, rx) = mpsc::unbounded_channel();

    let mut watcher = recommended_watcher(move |res| {
        let _ = tx.send(res);
    })?;

    watcher
        .watch(source_dir, RecursiveMode::Recursive)
        .with_context(|| format!("failed to watch {}", source_dir.display()))?;

    Ok((watcher, rx))
}

fn spawn_event_loop(
    broadcaster: broadcast::Sender<CompilerEvent>,
    mut rx: mpsc::UnboundedReceiver<notify::Result<notify::Event>>,
) {
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match event {
                Ok(event) => {
                    if matches!(event.kind, EventKind::Access(_)) {
                        continue;
                    }
                    let _ = broadcaster.send(CompilerEvent::Rebuilding);
                    let broadcaster = broadcaster.clone();
                    tokio::spawn(async move {
                        sleep(REBUILD_DEBOUNCE).await;
                        let _ = broadcaster.send(CompilerEvent::Reload);
                    });
                }
                Err(error) => {
                    cli::warn(&format!("watcher error: {error}"));
                    let _ = broadcaster.send(CompilerEvent::Reload);
                }
            }
        }
    });
}

/// Reads the installed React version, when there is one, so the fast-refresh
/// advisory can name it.
fn installed_runtime_version(node_modules: &Path) -> Option<String> {
    let manifest = node_modules.join("react").join("package.json");
    let raw = std::fs::read_to_string(manifest).ok()?;
    let parsed: Value = serde_json::from_str(&raw).ok()?;
    parsed
        .get("version")
        .and_then(Value::as_str)
        .map(str::to_string)
}

pub fn advisory_for(fast_refresh: bool, runtime_version: Option<&str>) -> Option<String> {
    let version = runtime_version?;
    if fast_refresh && version_lt(version, MIN_FAST_REFRESH_VERSION) {
        Some(format!(
            "Fast Refresh requires React 16.10 or higher. You are using React {version}."
        ))
    } else {
        None
    }
}

/// Strictly-less-than comparison of dotted version strings, numeric prefix of
/// each segment, missing segments treated as zero.
pub fn version_lt(version: &str, minimum: &str) -> bool {
    let left = components(version);
    let right = components(minimum);

    for index in 0..left.len().max(right.len()) {
        let a = left.get(index).copied().unwrap_or(0);
        let b = right.get(index).copied().unwrap_or(0);
        if a != b {
            return a < b;
        }
    }

    false
}

fn components(version: &str) -> Vec<u64> {
    version
        .trim_start_matches('v')
        .split('.')
        .map(|segment| {
            segment
                .chars()
                .take_while(char::is_ascii_digit)
                .collect::<String>()
                .parse()
                .unwrap_or(0)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn older_version_compares_strictly_less() {
        assert!(version_lt("16.9.0", "16.10.0"));
        assert!(version_lt("15.999.999", "16.10.0"));
    }

    #[test]
    fn minimum_and_newer_versions_do_not_compare_less() {
        assert!(!version_lt("16.10.0", "16.10.0"));
        assert!(!version_lt("16.10.1", "16.10.0"));
        assert!(!version_lt("17.0.0", "16.10.0"));
    }

    #[test]
    fn missing_segments_count_as_zero() {
        assert!(version_lt("16", "16.10.0"));
        assert!(!version_lt("17", "16.10.0"));
    }

    #[test]
    fn prefixes_and_prerelease_tags_are_tolerated() {
        assert!(version_lt("v16.9.0", "16.10.0"));
        assert!(version_lt("16.9.0-alpha.1", "16.10.0"));
    }

    #[test]
    fn advisory_fires_only_below_the_minimum_with_fast_refresh_on() {
        let warning = advisory_for(true, Some("16.9.0")).unwrap();
        assert!(warning.contains("16.9.0"));

        assert!(advisory_for(true, Some("16.10.0")).is_none());
        assert!(advisory_for(false, Some("16.9.0")).is_none());
        assert!(advisory_for(true, None).is_none());
    }

    #[test]
    fn compiler_events_serialize_with_kebab_case_tags() {
        let json = serde_json::to_string(&CompilerEvent::Reload).unwrap();
        assert_eq!(json, r#"{"type":"reload"}"#);
        let json = serde_json::to_string(&CompilerEvent::Rebuilding).unwrap();
        assert_eq!(json, r#"{"type":"rebuilding"}"#);
    }

    #[test]
    fn build_config_is_derived_from_project_paths() {
        let dir = std::env::temp_dir().join(format!(
            "devserve_build_config_{}",
            std::process::id()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        let paths = crate::paths::ProjectPaths::resolve(dir.to_str().unwrap()).unwrap();

        let config = build_config(Mode::Development, &paths, true, "/app");
        assert_eq!(config.mode.as_str(), "development");
        assert_eq!(config.source_dir, paths.src_dir);
        assert_eq!(config.static_dir, paths.public_dir);
        assert_eq!(config.public_url_prefix, "/app");
        assert!(config.fast_refresh);
    }

    #[test]
    fn runtime_version_is_read_from_node_modules() {
        let node_modules = std::env::temp_dir()
            .join(format!("devserve_runtime_{}", std::process::id()))
            .join("node_modules");
        let react = node_modules.join("react");
        std::fs::create_dir_all(&react).unwrap();
        std::fs::write(
            react.join("package.json"),
            r#"{ "name": "react", "version": "16.9.0" }"#,
        )
        .unwrap();

        assert_eq!(
            installed_runtime_version(&node_modules).as_deref(),
            Some("16.9.0")
        );
        assert!(installed_runtime_version(Path::new("/nonexistent")).is_none());
    }
}
