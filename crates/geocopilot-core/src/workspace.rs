use std::path::{Path, PathBuf};

use thiserror::Error;
use tokio::fs;

const DEFAULT_STEM: &str = "geo_task";
const MAX_STEM_LEN: usize = 48;

#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("{action} `{path}` failed: {source}")]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("artifact `{0}` is outside the run directory")]
    OutsideRun(PathBuf),
}

fn io_err(action: &'static str, path: &Path) -> impl FnOnce(std::io::Error) -> WorkspaceError {
    let path = path.to_path_buf();
    move |source| WorkspaceError::Io {
        action,
        path,
        source,
    }
}

/// Lowercase, non-alphanumerics collapsed to `_`, bounded length.
pub fn slugify(text: &str) -> String {
    let mut slug = String::with_capacity(text.len());
    for c in text.trim().chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.ends_with('_') {
            slug.push('_');
        }
    }
    let slug = slug.trim_matches('_');
    let mut slug = slug.chars().take(MAX_STEM_LEN).collect::<String>();
    while slug.ends_with('_') {
        slug.pop();
    }
    if slug.is_empty() {
        DEFAULT_STEM.to_string()
    } else {
        slug
    }
}

/// `stem.ext`, `stem_2.ext`, `stem_3.ext`, ... whichever does not exist yet.
pub fn unique_path(dir: &Path, stem: &str, ext: &str) -> PathBuf {
    let file = |suffix: Option<u32>| {
        let name = match suffix {
            Some(n) => format!("{stem}_{n}"),
            None => stem.to_string(),
        };
        if ext.is_empty() {
            dir.join(name)
        } else {
            dir.join(format!("{name}.{ext}"))
        }
    };
    let mut candidate = file(None);
    let mut n = 2;
    while candidate.exists() {
        candidate = file(Some(n));
        n += 1;
    }
    candidate
}

fn split_name(name: &str) -> (String, String) {
    let name = Path::new(name)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(name);
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() && ext.chars().all(|c| c.is_ascii_alphanumeric()) => {
            (slugify(stem), ext.to_ascii_lowercase())
        }
        _ => (slugify(name), String::new()),
    }
}

/// Stable root holding task scripts, promoted artifacts and per-run directories.
#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn runs_dir(&self) -> PathBuf {
        self.root.join("runs")
    }

    pub async fn begin_run(&self, run_id: &str) -> Result<RunWorkspace, WorkspaceError> {
        let dir = self.runs_dir().join(run_id);
        fs::create_dir_all(&dir)
            .await
            .map_err(io_err("create run directory", &dir))?;
        Ok(RunWorkspace { dir })
    }

    /// Saves the script under a name derived from `hint`. Reuses the same file
    /// for the same hint and rewrites it only when the content changed.
    pub async fn save_task_script(
        &self,
        script: &str,
        hint: Option<&str>,
    ) -> Result<PathBuf, WorkspaceError> {
        fs::create_dir_all(&self.root)
            .await
            .map_err(io_err("create workspace", &self.root))?;
        let path = self
            .root
            .join(format!("{}.py", slugify(hint.unwrap_or(DEFAULT_STEM))));
        let unchanged = match fs::read_to_string(&path).await {
            Ok(existing) => existing == script,
            Err(_) => false,
        };
        if !unchanged {
            fs::write(&path, script)
                .await
                .map_err(io_err("write task script", &path))?;
        }
        Ok(path)
    }

    /// Copies a run artifact into the workspace root without overwriting.
    pub async fn promote(&self, artifact: &Path, name: &str) -> Result<PathBuf, WorkspaceError> {
        if !artifact.starts_with(self.runs_dir()) {
            return Err(WorkspaceError::OutsideRun(artifact.to_path_buf()));
        }
        let (stem, ext) = split_name(name);
        let target = unique_path(&self.root, &stem, &ext);
        fs::copy(artifact, &target)
            .await
            .map_err(io_err("promote artifact", artifact))?;
        Ok(target)
    }
}

/// Isolated directory for one run.
#[derive(Debug, Clone)]
pub struct RunWorkspace {
    dir: PathBuf,
}

impl RunWorkspace {
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub async fn write_script(&self, hint: Option<&str>, script: &str) -> Result<PathBuf, WorkspaceError> {
        let path = self
            .dir
            .join(format!("{}.py", slugify(hint.unwrap_or(DEFAULT_STEM))));
        fs::write(&path, script)
            .await
            .map_err(io_err("write script", &path))?;
        Ok(path)
    }

    pub async fn write_artifact(&self, name: &str, bytes: &[u8]) -> Result<PathBuf, WorkspaceError> {
        let (stem, ext) = split_name(name);
        let path = unique_path(&self.dir, &stem, &ext);
        fs::write(&path, bytes)
            .await
            .map_err(io_err("write artifact", &path))?;
        Ok(path)
    }

    /// Files left in the run directory, excluding the given script file.
    pub async fn collect_artifacts(&self, script: Option<&Path>) -> Result<Vec<PathBuf>, WorkspaceError> {
        let mut out = Vec::new();
        let mut entries = fs::read_dir(&self.dir)
            .await
            .map_err(io_err("list run directory", &self.dir))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(io_err("list run directory", &self.dir))?
        {
            let path = entry.path();
            if Some(path.as_path()) == script || !path.is_file() {
                continue;
            }
            out.push(path);
        }
        out.sort();
        Ok(out)
    }
}
