//! Declared view definitions.
//!
//! Definitions live on disk as `<root>/<database>/<design>/<view>/map.js`
//! with an optional `reduce.js` next to it, and are loaded once at startup
//! into an immutable [`ViewRegistry`].

use crate::error::DefinitionError;
use crate::models::{IndexDefinition, IndexSpec, ViewId};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;
use tracing::debug;
use walkdir::WalkDir;

const MAP_FILE: &str = "map.js";
const REDUCE_FILE: &str = "reduce.js";

/// Immutable table of declared views keyed by `(database, design, view)`.
#[derive(Debug, Clone, Default)]
pub struct ViewRegistry {
    definitions: BTreeMap<ViewId, IndexSpec>,
}

impl ViewRegistry {
    /// Build a registry, rejecting duplicate view names within a design document.
    pub fn from_definitions(
        definitions: impl IntoIterator<Item = IndexDefinition>,
    ) -> Result<Self, DefinitionError> {
        let mut table = BTreeMap::new();
        for definition in definitions {
            if table.contains_key(&definition.id) {
                return Err(DefinitionError::Duplicate(definition.id));
            }
            table.insert(definition.id, definition.spec);
        }
        Ok(Self { definitions: table })
    }

    /// Load every `map.js` (and sibling `reduce.js`) under `root`.
    pub fn load_dir(root: &Path) -> Result<Self, DefinitionError> {
        let mut definitions = Vec::new();

        let walker = WalkDir::new(root)
            .min_depth(4)
            .max_depth(4)
            .sort_by_file_name();

        for entry in walker {
            let entry = entry.map_err(|e| DefinitionError::Io {
                path: root.display().to_string(),
                source: e.into(),
            })?;

            if !entry.file_type().is_file() || entry.file_name() != MAP_FILE {
                continue;
            }

            let view_dir = match entry.path().parent() {
                Some(dir) => dir,
                None => continue,
            };
            let Some(id) = view_id_from_path(root, view_dir) else {
                continue;
            };

            let map = read_source(entry.path())?;
            let map = normalize_source(&map, "map");
            if map.is_empty() {
                return Err(DefinitionError::MissingMap { view: id });
            }

            let reduce_path = view_dir.join(REDUCE_FILE);
            let reduce = if reduce_path.is_file() {
                let source = read_source(&reduce_path)?;
                Some(normalize_reduce(&source)).filter(|r| !r.is_empty())
            } else {
                None
            };

            debug!("Loaded view {}", id);
            definitions.push(IndexDefinition {
                id,
                spec: IndexSpec { map, reduce },
            });
        }

        Self::from_definitions(definitions)
    }

    pub fn get(&self, id: &ViewId) -> Option<&IndexSpec> {
        self.definitions.get(id)
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ViewId, &IndexSpec)> {
        self.definitions.iter()
    }

    /// Databases with at least one declared view.
    pub fn databases(&self) -> BTreeSet<&str> {
        self.definitions
            .keys()
            .map(|id| id.database.as_str())
            .collect()
    }

    /// Design documents declared for a database.
    pub fn designs(&self, database: &str) -> BTreeSet<&str> {
        self.definitions
            .keys()
            .filter(|id| id.database == database)
            .map(|id| id.design.as_str())
            .collect()
    }

    /// Views declared in one design document.
    pub fn views_in<'a>(
        &'a self,
        database: &'a str,
        design: &'a str,
    ) -> impl Iterator<Item = (&'a str, &'a IndexSpec)> + 'a {
        self.definitions
            .iter()
            .filter(move |(id, _)| id.database == database && id.design == design)
            .map(|(id, spec)| (id.view.as_str(), spec))
    }
}

fn view_id_from_path(root: &Path, view_dir: &Path) -> Option<ViewId> {
    let relative = view_dir.strip_prefix(root).ok()?;
    let parts: Vec<&str> = relative
        .components()
        .filter_map(|c| c.as_os_str().to_str())
        .collect();

    match parts.as_slice() {
        [database, design, view] => Some(ViewId::new(*database, *design, *view)),
        _ => None,
    }
}

fn read_source(path: &Path) -> Result<String, DefinitionError> {
    fs::read_to_string(path).map_err(|e| DefinitionError::Io {
        path: path.display().to_string(),
        source: e,
    })
}

/// Strip a leading `const <binding> =` and the trailing `;` from a source file.
pub fn normalize_source(source: &str, binding: &str) -> String {
    let trimmed = source.trim();
    let prefix = format!("const {}", binding);

    let body = match trimmed.strip_prefix(&prefix) {
        Some(rest) if rest.trim_start().starts_with('=') => {
            rest.trim_start().trim_start_matches('=').trim_start()
        }
        _ => trimmed,
    };

    body.trim_end().trim_end_matches(';').trim_end().to_string()
}

/// Normalize a reduce file; built-in reducers collapse to their bare name.
pub fn normalize_reduce(source: &str) -> String {
    let body = normalize_source(source, "reduce");
    if body.starts_with('_') {
        body.split(|c: char| c.is_whitespace() || c == ';')
            .next()
            .unwrap_or_default()
            .to_string()
    } else {
        body
    }
}
