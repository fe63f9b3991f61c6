use std::io::IsTerminal;

use anyhow::Context;
use serde_json::Value;

use crate::paths::ProjectPaths;

pub const DEFAULT_PORT: u16 = 3000;
pub const DEFAULT_HOST: &str = "0.0.0.0";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Http,
    Https,
}

impl Protocol {
    pub fn scheme(self) -> &'static str {
        match self {
            Protocol::Http => "http",
            Protocol::Https => "https",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackageManager {
    Npm,
    Yarn,
    Pnpm,
}

impl PackageManager {
    pub fn build_command(self) -> &'static str {
        match self {
            PackageManager::Npm => "npm run build",
            PackageManager::Yarn => "yarn build",
            PackageManager::Pnpm => "pnpm build",
        }
    }
}

#[derive(Debug, Clone)]
pub struct PackageMetadata {
    pub name: String,
    pub proxy: Option<String>,
    pub homepage: Option<String>,
}

impl PackageMetadata {
    pub fn from_manifest(manifest: &Value, fallback_name: &str) -> anyhow::Result<Self> {
        let name = manifest
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or(fallback_name)
            .to_string();

        let proxy = match manifest.get("proxy") {
            None | Some(Value::Null) => None,
            Some(Value::String(target)) => Some(target.clone()),
            Some(_) => anyhow::bail!(
                "When specified, \"proxy\" in your package.json must be a string."
            ),
        };

        let homepage = manifest
            .get("homepage")
            .and_then(Value::as_str)
            .map(str::to_string);

        Ok(Self {
            name,
            proxy,
            homepage,
        })
    }
}

/// Immutable snapshot of everything startup needs. All environment reads
/// happen here, once; the rest of the chain receives this by reference.
#[derive(Debug, Clone)]
pub struct StartupContext {
    pub host: String,
    pub host_overridden: bool,
    pub desired_port: u16,
    pub protocol: Protocol,
    pub ci: bool,
    pub interactive: bool,
    pub fast_refresh: bool,
    pub package_manager: PackageManager,
    pub uses_typescript: bool,
    pub public_url_prefix: String,
    pub package: PackageMetadata,
}

impl StartupContext {
    pub fn resolve(paths: &ProjectPaths) -> anyhow::Result<Self> {
        let manifest = read_manifest(paths)?;
        let fallback_name = paths
            .root
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("app");
        let package = PackageMetadata::from_manifest(&manifest, fallback_name)?;

        let host_raw = std::env::var("HOST").ok();
        let public_url_prefix = public_url_prefix(
            std::env::var("PUBLIC_URL").ok().as_deref(),
            package.homepage.as_deref(),
        );

        Ok(Self {
            host: effective_host(host_raw.as_deref()),
            host_overridden: host_raw.is_some(),
            desired_port: effective_port(std::env::var("PORT").ok().as_deref()),
            protocol: effective_protocol(std::env::var("HTTPS").ok().as_deref()),
            ci: flag_is_true(std::env::var("CI").ok().as_deref()),
            interactive: std::io::stdout().is_terminal(),
            fast_refresh: fast_refresh_enabled(std::env::var("FAST_REFRESH").ok().as_deref()),
            package_manager: detect_package_manager(paths),
            uses_typescript: paths.tsconfig.is_file(),
            public_url_prefix,
            package,
        })
    }
}

fn read_manifest(paths: &ProjectPaths) -> anyhow::Result<Value> {
    let raw = std::fs::read_to_string(&paths.package_json)
        .with_context(|| format!("failed to read {}", paths.package_json.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse {}", paths.package_json.display()))
}

pub fn effective_port(raw: Option<&str>) -> u16 {
    raw.and_then(|value| value.trim().parse::<u16>().ok())
        .unwrap_or(DEFAULT_PORT)
}

pub fn effective_host(raw: Option<&str>) -> String {
    match raw {
        Some(host) if !host.trim().is_empty() => host.trim().to_string(),
        _ => DEFAULT_HOST.to_string(),
    }
}

pub fn effective_protocol(raw: Option<&str>) -> Protocol {
    if raw == Some("true") {
        Protocol::Https
    } else {
        Protocol::Http
    }
}

pub fn flag_is_true(raw: Option<&str>) -> bool {
    raw == Some("true")
}

/// Fast refresh defaults to enabled; only an explicit "false" turns it off.
pub fn fast_refresh_enabled(raw: Option<&str>) -> bool {
    raw != Some("false")
}

fn detect_package_manager(paths: &ProjectPaths) -> PackageManager {
    if paths.yarn_lock.is_file() {
        PackageManager::Yarn
    } else if paths.pnpm_lock.is_file() {
        PackageManager::Pnpm
    } else {
        PackageManager::Npm
    }
}

/// Derives the public URL prefix from PUBLIC_URL (or the package homepage),
/// normalized to a leading slash and no trailing slash. Empty means the app
/// is served from the server root.
pub fn public_url_prefix(env_value: Option<&str>, homepage: Option<&str>) -> String {
    let source = env_value.or(homepage).unwrap_or("");
    let path = if let Some(scheme_end) = source.find("://") {
        let rest = &source[scheme_end + 3..];
        match rest.find('/') {
            Some(index) => &rest[index..],
            None => "",
        }
    } else {
        source
    };

    let trimmed = path.trim().trim_end_matches('/');
    if trimmed.is_empty() || trimmed == "." {
        String::new()
    } else if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{trimmed}")
    }
}
