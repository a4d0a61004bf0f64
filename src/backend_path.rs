/// Backend executable discovery
/// Builds the ordered candidate list for every known executable name and picks
/// the first one that exists, preferring paths outside packed archives

use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};
use tracing::{info, warn};

use crate::app::{executable_file_name, BACKEND_DIR_NAME};
use crate::error::StartupFailure;

/// Archive containers that can hold the backend but cannot run it in place
const ARCHIVE_EXTENSIONS: &[&str] = &["asar", "zip"];

/// One entry of the resolver's search list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidatePath {
    pub path: PathBuf,
    /// False when the path goes through a packed, read-only archive
    pub directly_executable: bool,
}

impl CandidatePath {
    pub fn new(path: PathBuf) -> Self {
        let directly_executable = !is_inside_archive(&path);
        Self {
            path,
            directly_executable,
        }
    }
}

/// Where the shell is running from; each field feeds one group of candidates
#[derive(Debug, Clone, Default)]
pub struct SearchRoots {
    /// Explicit path from config or environment, always checked first
    pub explicit: Option<PathBuf>,
    /// Set when running from an installed bundle
    pub packaged: bool,
    /// Directory holding the running shell executable
    pub exe_dir: Option<PathBuf>,
    /// Bundle resource directory (macOS `Contents/Resources`, elsewhere `<exe_dir>/resources`)
    pub resource_dir: Option<PathBuf>,
    /// Source checkout root, only known in development builds
    pub dev_root: Option<PathBuf>,
    pub cwd: Option<PathBuf>,
    /// Fall back to a PATH lookup for each name
    pub search_path_env: bool,
}

impl SearchRoots {
    /// Discover roots from the running process
    pub fn detect(explicit: Option<PathBuf>) -> Self {
        let exe_dir = std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(Path::to_path_buf));

        // Debug builds run out of target/, anything else is an install
        let packaged = !cfg!(debug_assertions);

        let resource_dir = exe_dir.as_ref().map(|dir| {
            if cfg!(target_os = "macos") {
                dir.join("..").join("Resources")
            } else {
                dir.join("resources")
            }
        });

        let dev_root = if cfg!(debug_assertions) {
            Some(PathBuf::from(env!("CARGO_MANIFEST_DIR")))
        } else {
            None
        };

        Self {
            explicit,
            packaged,
            exe_dir,
            resource_dir,
            dev_root,
            cwd: std::env::current_dir().ok(),
            search_path_env: true,
        }
    }
}

/// Build the ordered candidate list.
/// All locations for the first name come before any location of the next name.
pub fn build_candidates(roots: &SearchRoots, names: &[String]) -> Vec<CandidatePath> {
    let mut paths = Vec::new();

    if let Some(explicit) = &roots.explicit {
        paths.push(explicit.clone());
    }

    for name in names {
        let file = executable_file_name(name);
        let in_backend = |dir: &Path| dir.join(BACKEND_DIR_NAME).join(&file);

        if roots.packaged {
            if let Some(resource_dir) = &roots.resource_dir {
                paths.push(in_backend(resource_dir));
            }
            if let Some(exe_dir) = &roots.exe_dir {
                paths.push(in_backend(exe_dir));
            }
            // Legacy bundles shipped the backend inside the app archive
            if let Some(resource_dir) = &roots.resource_dir {
                paths.push(in_backend(&resource_dir.join("app.asar")));
            }
        }

        if let Some(dev_root) = &roots.dev_root {
            paths.push(in_backend(dev_root));
            paths.push(in_backend(&dev_root.join("..")));
        }

        if let Some(cwd) = &roots.cwd {
            paths.push(in_backend(cwd));
            paths.push(cwd.join(&file));
        }

        if let Some(exe_dir) = &roots.exe_dir {
            if !roots.packaged {
                paths.push(in_backend(exe_dir));
            }
            paths.push(in_backend(&exe_dir.join("..")));
            paths.push(in_backend(&exe_dir.join("..").join("..")));
        }

        if roots.search_path_env {
            if let Ok(found) = which::which(&file) {
                paths.push(found);
            }
        }
    }

    dedupe_paths(paths)
        .into_iter()
        .map(CandidatePath::new)
        .collect()
}

/// Pick the first existing, directly executable candidate; if none is
/// executable, the first existing one
pub fn resolve_executable(candidates: &[CandidatePath]) -> Result<PathBuf, StartupFailure> {
    info!("=== Backend executable detection ===");
    for (index, candidate) in candidates.iter().enumerate() {
        let exists = candidate.path.is_file();
        info!(
            "{}. {:?} - {} {}",
            index + 1,
            candidate.path,
            if exists { "exists" } else { "missing" },
            if candidate.directly_executable {
                "(executable)"
            } else {
                "(inside archive)"
            }
        );
    }

    let chosen = candidates
        .iter()
        .find(|c| c.directly_executable && c.path.is_file())
        .or_else(|| candidates.iter().find(|c| c.path.is_file()));

    match chosen {
        Some(candidate) => {
            if !candidate.directly_executable {
                warn!(
                    "Only found backend inside an archive, launching anyway: {:?}",
                    candidate.path
                );
            }
            info!("✅ Found backend executable: {:?}", candidate.path);
            Ok(candidate.path.clone())
        }
        None => {
            warn!("❌ No backend executable found");
            Err(StartupFailure::ExecutableMissing {
                tried: candidates.len(),
            })
        }
    }
}

fn is_inside_archive(path: &Path) -> bool {
    path.components().any(|component| match component {
        Component::Normal(part) => Path::new(part)
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| {
                ARCHIVE_EXTENSIONS
                    .iter()
                    .any(|archive| ext.eq_ignore_ascii_case(archive))
            })
            .unwrap_or(false),
        _ => false,
    })
}

/// Remove duplicate paths, keeping the first occurrence
fn dedupe_paths(paths: Vec<PathBuf>) -> Vec<PathBuf> {
    let mut seen = HashSet::new();
    let mut deduped = Vec::new();
    for path in paths {
        let key: PathBuf = path.components().collect();
        if seen.insert(key) {
            deduped.push(path);
        }
    }
    deduped
}
