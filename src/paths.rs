use std::path::{Path, PathBuf};

use anyhow::Context;

/// Filesystem layout of the project being served. Resolved once from the
/// project directory argument; every later step reads paths from here instead
/// of rebuilding them.
#[derive(Debug, Clone)]
pub struct ProjectPaths {
    pub root: PathBuf,
    pub package_json: PathBuf,
    pub public_dir: PathBuf,
    pub app_html: PathBuf,
    pub app_entry: PathBuf,
    pub src_dir: PathBuf,
    pub node_modules: PathBuf,
    pub tsconfig: PathBuf,
    pub browserslistrc: PathBuf,
    pub yarn_lock: PathBuf,
    pub pnpm_lock: PathBuf,
    pub npm_lock: PathBuf,
}

const ENTRY_CANDIDATES: [&str; 5] = [
    "index.tsx",
    "index.ts",
    "index.jsx",
    "index.mjs",
    "index.js",
];

impl ProjectPaths {
    pub fn resolve(project_dir: &str) -> anyhow::Result<Self> {
        let root = resolve_root(project_dir)
            .with_context(|| format!("failed to resolve project directory {project_dir}"))?;

        let public_dir = root.join("public");
        let src_dir = root.join("src");
        let app_entry = resolve_entry(&src_dir);

        Ok(Self {
            package_json: root.join("package.json"),
            app_html: public_dir.join("index.html"),
            node_modules: root.join("node_modules"),
            tsconfig: root.join("tsconfig.json"),
            browserslistrc: root.join(".browserslistrc"),
            yarn_lock: root.join("yarn.lock"),
            pnpm_lock: root.join("pnpm-lock.yaml"),
            npm_lock: root.join("package-lock.json"),
            public_dir,
            src_dir,
            app_entry,
            root,
        })
    }
}

fn resolve_root(project_dir: &str) -> anyhow::Result<PathBuf> {
    let path = PathBuf::from(project_dir);
    let absolute = if path.is_absolute() {
        path
    } else {
        std::env::current_dir()?.join(path)
    };

    let canonical = absolute.canonicalize()?;
    if canonical.is_dir() {
        Ok(canonical)
    } else {
        anyhow::bail!("project path must be a directory")
    }
}

/// Picks the first entry script that exists; projects without one fall back
/// to `src/index.js` so the precondition check can name what is missing.
fn resolve_entry(src_dir: &Path) -> PathBuf {
    for candidate in ENTRY_CANDIDATES {
        let path = src_dir.join(candidate);
        if path.is_file() {
            return path;
        }
    }
    src_dir.join("index.js")
}
