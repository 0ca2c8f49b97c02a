// assets.rs

use std::{
    collections::BTreeSet,
    fs,
    path::{Path, PathBuf},
};

use log::*;

use crate::http::{is_api_path, INDEX_FILE};

/// Whitelist of static files, listed once at boot. Only these names are ever
/// opened, so a request path can never reach outside the asset directory.
#[derive(Clone, Debug, Default)]
pub struct KnownFileSet {
    root: PathBuf,
    files: BTreeSet<String>,
}

impl KnownFileSet {
    /// List the regular files directly under `root`. An unreadable directory
    /// gives an empty set.
    pub fn scan(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        let names = match fs::read_dir(root) {
            Ok(dir) => dir
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
                .filter_map(|e| e.file_name().into_string().ok())
                .map(|name| format!("/{name}"))
                .collect::<Vec<_>>(),
            Err(e) => {
                error!("Cannot list static files in {root:?}: {e}");
                Vec::new()
            }
        };
        Self::from_names(root, names)
    }

    /// Build the set from absolute request paths. Names that would shadow an
    /// API route are dropped.
    pub fn from_names<I, S>(root: impl Into<PathBuf>, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut files = BTreeSet::new();
        for name in names {
            let name = name.into();
            if !name.starts_with('/') || name[1..].contains('/') {
                warn!("Ignoring static file name {name:?}");
            } else if is_api_path(&name) {
                warn!("Static file {name:?} shadows an API route, ignored");
            } else {
                files.insert(name);
            }
        }

        let set = Self {
            root: root.into(),
            files,
        };
        if !set.contains(INDEX_FILE) {
            warn!("No {INDEX_FILE} in {:?}", set.root);
        }
        info!("Static files: {:?}", set.files);
        set
    }

    pub fn contains(&self, path: &str) -> bool {
        self.files.contains(path)
    }

    /// Filesystem path of a whitelisted request path.
    pub fn path_of(&self, path: &str) -> Option<PathBuf> {
        self.files
            .get(path)
            .map(|name| self.root.join(name.trim_start_matches('/')))
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}


// EOF
