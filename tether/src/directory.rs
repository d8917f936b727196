use std::path::{Component, Path, PathBuf};

use globset::Glob;

/// Source of working directories a chat may choose from.
pub trait DirectoryResolver: Send + Sync {
    /// Absolute paths, sorted and deduplicated.
    fn list_directories(&self) -> Vec<PathBuf>;
}

/// Resolves configured patterns such as `~/src/*` or `/srv/repos/{a,b}`.
///
/// Literal patterns are kept when they name an existing directory; glob
/// patterns are matched against directories below their literal prefix.
pub struct PatternResolver {
    patterns: Vec<String>,
}

impl PatternResolver {
    pub fn new(patterns: Vec<String>) -> Self {
        Self { patterns }
    }
}

impl DirectoryResolver for PatternResolver {
    fn list_directories(&self) -> Vec<PathBuf> {
        let mut dirs: Vec<PathBuf> = self
            .patterns
            .iter()
            .flat_map(|pattern| expand(pattern))
            .filter_map(|path| std::fs::canonicalize(&path).ok())
            .filter(|path| path.is_dir())
            .collect();
        dirs.sort();
        dirs.dedup();
        dirs
    }
}

fn expand_home(pattern: &str) -> PathBuf {
    if let Some(rest) = pattern.strip_prefix("~/")
        && let Some(home) = dirs::home_dir()
    {
        return home.join(rest);
    }
    if pattern == "~"
        && let Some(home) = dirs::home_dir()
    {
        return home;
    }
    PathBuf::from(pattern)
}

fn has_glob_meta(s: &str) -> bool {
    s.contains(['*', '?', '[', '{'])
}

fn expand(pattern: &str) -> Vec<PathBuf> {
    let path = expand_home(pattern.trim());
    let components: Vec<Component<'_>> = path.components().collect();
    let Some(first_glob) = components
        .iter()
        .position(|c| has_glob_meta(&c.as_os_str().to_string_lossy()))
    else {
        return vec![path];
    };

    let base: PathBuf = components[..first_glob].iter().collect();
    let depth = components.len() - first_glob;
    let matcher = match Glob::new(&path.to_string_lossy()) {
        Ok(glob) => glob.compile_matcher(),
        Err(e) => {
            tracing::warn!("invalid directory pattern {pattern:?}: {e}");
            return Vec::new();
        }
    };

    let mut found = Vec::new();
    walk_dirs(&base, depth, &mut |candidate| {
        if matcher.is_match(candidate) {
            found.push(candidate.to_path_buf());
        }
    });
    found
}

/// Visit directories exactly `depth` levels below `dir`.
fn walk_dirs(dir: &Path, depth: usize, visit: &mut dyn FnMut(&Path)) {
    if depth == 0 {
        visit(dir);
        return;
    }
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
        if is_dir {
            walk_dirs(&entry.path(), depth - 1, visit);
        }
    }
}
