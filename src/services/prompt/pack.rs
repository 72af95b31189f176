//! Prompt pack layers and merge semantics.
//!
//! A pack is an immutable tree of template and YAML fragments loaded once at
//! startup. Composition is pure: `merge` folds layer values lowest-precedence
//! first, with list behavior driven by explicit `strategy` directives.

use serde_yaml::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use crate::utils::content_hash;

/// Layer precedence, lowest to highest:
/// shared templates < system pack < client overlay < client+env overlay
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LayerKind {
    SharedTemplates,
    SystemPack,
    ClientOverlay,
    ClientEnvOverlay,
}

impl fmt::Display for LayerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::SharedTemplates => "templates",
            Self::SystemPack => "system-pack",
            Self::ClientOverlay => "client-overlay",
            Self::ClientEnvOverlay => "client-env-overlay",
        };
        write!(f, "{}", name)
    }
}

/// One file inside a layer
#[derive(Debug, Clone)]
pub struct FileEntry {
    pub content: String,
    pub hash: String,
}

/// A fully scanned layer: relative path (forward slashes) → file
#[derive(Debug, Clone)]
pub struct LoadedLayer {
    pub kind: LayerKind,
    pub root: PathBuf,
    pub files: BTreeMap<String, FileEntry>,
}

impl LoadedLayer {
    pub fn scan(kind: LayerKind, root: &Path) -> Result<Self, anyhow::Error> {
        let mut files = BTreeMap::new();
        if root.is_dir() {
            collect_files(root, root, &mut files)?;
        }

        // Shared building blocks live at the layer root on disk but are
        // addressed as templates/<fragment> in the candidate search
        if kind == LayerKind::SharedTemplates {
            files = files
                .into_iter()
                .map(|(path, entry)| (format!("templates/{}", path), entry))
                .collect();
        }

        Ok(Self { kind, root: root.to_path_buf(), files })
    }

    pub fn get(&self, path: &str) -> Option<&FileEntry> {
        self.files.get(path)
    }
}

fn collect_files(
    root: &Path,
    dir: &Path,
    files: &mut BTreeMap<String, FileEntry>,
) -> Result<(), anyhow::Error> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            collect_files(root, &path, files)?;
        } else if path.is_file() {
            let relative = path
                .strip_prefix(root)
                .map_err(|e| anyhow::anyhow!("path outside pack root: {}", e))?
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect::<Vec<_>>()
                .join("/");
            let content = fs::read_to_string(&path)
                .map_err(|e| anyhow::anyhow!("failed to read {}: {}", path.display(), e))?;
            let hash = content_hash(&content);
            files.insert(relative, FileEntry { content, hash });
        }
    }
    Ok(())
}

/// Pick the highest semver directory under `base`. Two directories parsing to
/// the same version are an ambiguity error (e.g. "1.2.0" and "1.02.0").
pub fn select_latest_version(base: &Path) -> Result<Option<PathBuf>, anyhow::Error> {
    if !base.is_dir() {
        return Ok(None);
    }

    let mut best: Option<((u64, u64, u64), String, PathBuf)> = None;
    for entry in fs::read_dir(base)? {
        let entry = entry?;
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        let Some(version) = parse_semver(&name) else {
            tracing::warn!("Ignoring non-semver pack directory '{}'", name);
            continue;
        };
        match &best {
            Some((current, current_name, _)) if *current == version => {
                anyhow::bail!(
                    "ambiguous candidate: pack versions '{}' and '{}' are equal",
                    current_name,
                    name
                );
            },
            Some((current, _, _)) if *current > version => {},
            _ => best = Some((version, name, path)),
        }
    }

    Ok(best.map(|(_, _, path)| path))
}

pub fn parse_semver(s: &str) -> Option<(u64, u64, u64)> {
    let mut parts = s.split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next()?.parse().ok()?;
    let patch = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some((major, minor, patch))
}

// ============================================================================
// YAML merging
// ============================================================================

/// List merge strategies selectable by overlay directives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeStrategy {
    Override,
    Append,
    Unique,
    ById,
}

impl MergeStrategy {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "override" | "replace" => Some(Self::Override),
            "append" => Some(Self::Append),
            "unique" => Some(Self::Unique),
            "by_id" => Some(Self::ById),
            _ => None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MergeError {
    #[error("unknown merge strategy '{0}'")]
    UnknownStrategy(String),

    #[error("strategy directive must carry an `items` list")]
    MissingItems,

    #[error("by_id merge requires list items to be mappings with key '{0}'")]
    MissingId(String),
}

/// Merge `overlay` onto `base`.
///
/// - mappings merge recursively, overlay keys winning;
/// - a mapping of the form `{strategy: <s>, items: [...]}` (optionally
///   `id_key`) is a list directive applied against the base value;
/// - everything else (scalars, strings, plain lists) is replaced.
pub fn merge(base: Value, overlay: Value) -> Result<Value, MergeError> {
    if let Some(directive) = as_directive(&overlay)? {
        return apply_directive(base, directive);
    }

    match (base, overlay) {
        (Value::Mapping(mut base_map), Value::Mapping(overlay_map)) => {
            for (key, overlay_value) in overlay_map {
                let merged = match base_map.remove(&key) {
                    Some(base_value) => merge(base_value, overlay_value)?,
                    None => resolve_directives(overlay_value)?,
                };
                base_map.insert(key, merged);
            }
            Ok(Value::Mapping(base_map))
        },
        (_, overlay) => resolve_directives(overlay),
    }
}

struct Directive {
    strategy: MergeStrategy,
    id_key: String,
    items: Vec<Value>,
}

fn as_directive(value: &Value) -> Result<Option<Directive>, MergeError> {
    let Value::Mapping(map) = value else {
        return Ok(None);
    };
    let Some(Value::String(strategy_name)) = map.get("strategy") else {
        return Ok(None);
    };

    let strategy = MergeStrategy::parse(strategy_name)
        .ok_or_else(|| MergeError::UnknownStrategy(strategy_name.clone()))?;

    let items = match map.get("items") {
        Some(Value::Sequence(items)) => items.clone(),
        _ => return Err(MergeError::MissingItems),
    };

    let id_key = match map.get("id_key") {
        Some(Value::String(key)) => key.clone(),
        _ => "id".to_string(),
    };

    Ok(Some(Directive { strategy, id_key, items }))
}

/// A directive with no base resolves to its items (fresh key in the overlay)
fn resolve_directives(value: Value) -> Result<Value, MergeError> {
    if let Some(directive) = as_directive(&value)? {
        return apply_directive(Value::Sequence(vec![]), directive);
    }
    match value {
        Value::Mapping(map) => {
            let mut out = serde_yaml::Mapping::new();
            for (key, inner) in map {
                out.insert(key, resolve_directives(inner)?);
            }
            Ok(Value::Mapping(out))
        },
        other => Ok(other),
    }
}

fn apply_directive(base: Value, directive: Directive) -> Result<Value, MergeError> {
    let base_items = match base {
        Value::Sequence(items) => items,
        Value::Null => vec![],
        // Overriding a scalar with a list directive: base contributes nothing
        _ => vec![],
    };

    let merged = match directive.strategy {
        MergeStrategy::Override => directive.items,
        MergeStrategy::Append => {
            let mut out = base_items;
            out.extend(directive.items);
            out
        },
        MergeStrategy::Unique => {
            let mut out = base_items;
            for item in directive.items {
                if !out.contains(&item) {
                    out.push(item);
                }
            }
            out
        },
        MergeStrategy::ById => {
            let id_of = |item: &Value| -> Result<Value, MergeError> {
                match item {
                    Value::Mapping(map) => map
                        .get(directive.id_key.as_str())
                        .cloned()
                        .ok_or_else(|| MergeError::MissingId(directive.id_key.clone())),
                    _ => Err(MergeError::MissingId(directive.id_key.clone())),
                }
            };

            let mut out = base_items;
            for item in directive.items {
                let id = id_of(&item)?;
                match out.iter_mut().find(|existing| {
                    matches!(existing, Value::Mapping(m)
                        if m.get(directive.id_key.as_str()) == Some(&id))
                }) {
                    // Later overrides earlier, field by field
                    Some(existing) => {
                        let merged = merge(existing.clone(), item)?;
                        *existing = merged;
                    },
                    None => out.push(item),
                }
            }
            out
        },
    };

    Ok(Value::Sequence(merged))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn yaml(s: &str) -> Value {
        serde_yaml::from_str(s).unwrap()
    }

    #[test]
    fn test_parse_semver() {
        assert_eq!(parse_semver("1.2.3"), Some((1, 2, 3)));
        assert_eq!(parse_semver("0.10.0"), Some((0, 10, 0)));
        assert_eq!(parse_semver("1.2"), None);
        assert_eq!(parse_semver("v1.2.3"), None);
    }

    #[test]
    fn test_scalar_override() {
        let merged = merge(yaml("name: base"), yaml("name: overlay")).unwrap();
        assert_eq!(merged, yaml("name: overlay"));
    }

    #[test]
    fn test_nested_mapping_merge() {
        let base = yaml("outer:\n  a: 1\n  b: 2");
        let overlay = yaml("outer:\n  b: 3\n  c: 4");
        let merged = merge(base, overlay).unwrap();
        assert_eq!(merged, yaml("outer:\n  a: 1\n  b: 3\n  c: 4"));
    }

    #[test]
    fn test_plain_list_defaults_to_override() {
        let merged = merge(yaml("rules: [a, b]"), yaml("rules: [c]")).unwrap();
        assert_eq!(merged, yaml("rules: [c]"));
    }

    #[test]
    fn test_append_strategy() {
        let base = yaml("rules: [a, b]");
        let overlay = yaml("rules:\n  strategy: append\n  items: [c]");
        let merged = merge(base, overlay).unwrap();
        assert_eq!(merged, yaml("rules: [a, b, c]"));
    }

    #[test]
    fn test_unique_strategy_dedupes() {
        let base = yaml("rules: [a, b]");
        let overlay = yaml("rules:\n  strategy: unique\n  items: [b, c]");
        let merged = merge(base, overlay).unwrap();
        assert_eq!(merged, yaml("rules: [a, b, c]"));
    }

    #[test]
    fn test_replace_is_alias_of_override() {
        let base = yaml("rules: [a, b]");
        let overlay = yaml("rules:\n  strategy: replace\n  items: [z]");
        let merged = merge(base, overlay).unwrap();
        assert_eq!(merged, yaml("rules: [z]"));
    }

    #[test]
    fn test_by_id_merges_and_appends() {
        let base = yaml(
            "tables:\n  - id: users\n    desc: old\n  - id: orders\n    desc: keep",
        );
        let overlay = yaml(
            "tables:\n  strategy: by_id\n  items:\n    - id: users\n      desc: new\n    - id: events\n      desc: added",
        );
        let merged = merge(base, overlay).unwrap();
        let expected = yaml(
            "tables:\n  - id: users\n    desc: new\n  - id: orders\n    desc: keep\n  - id: events\n    desc: added",
        );
        assert_eq!(merged, expected);
    }

    #[test]
    fn test_by_id_custom_key() {
        let base = yaml("cols:\n  - name: a\n    t: int");
        let overlay =
            yaml("cols:\n  strategy: by_id\n  id_key: name\n  items:\n    - name: a\n      t: text");
        let merged = merge(base, overlay).unwrap();
        assert_eq!(merged, yaml("cols:\n  - name: a\n    t: text"));
    }

    #[test]
    fn test_by_id_missing_id_errors() {
        let base = yaml("xs: []");
        let overlay = yaml("xs:\n  strategy: by_id\n  items:\n    - desc: no id");
        assert!(matches!(merge(base, overlay), Err(MergeError::MissingId(_))));
    }

    #[test]
    fn test_unknown_strategy_errors() {
        let base = yaml("xs: [a]");
        let overlay = yaml("xs:\n  strategy: zipper\n  items: [b]");
        assert!(matches!(merge(base, overlay), Err(MergeError::UnknownStrategy(_))));
    }

    #[test]
    fn test_directive_on_fresh_key() {
        let base = yaml("a: 1");
        let overlay = yaml("b:\n  strategy: append\n  items: [x]");
        let merged = merge(base, overlay).unwrap();
        assert_eq!(merged, yaml("a: 1\nb: [x]"));
    }

    #[test]
    fn test_select_latest_version() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("1.0.0")).unwrap();
        fs::create_dir(dir.path().join("1.2.0")).unwrap();
        fs::create_dir(dir.path().join("0.9.9")).unwrap();

        let latest = select_latest_version(dir.path()).unwrap().unwrap();
        assert!(latest.ends_with("1.2.0"));
    }

    #[test]
    fn test_select_version_ambiguity() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("1.2.0")).unwrap();
        fs::create_dir(dir.path().join("1.02.0")).unwrap();

        let err = select_latest_version(dir.path()).unwrap_err();
        assert!(err.to_string().contains("ambiguous candidate"));
    }

    #[test]
    fn test_layer_scan() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("slots/interactive_query")).unwrap();
        fs::write(dir.path().join("slots/interactive_query/prompt.md"), "hello").unwrap();

        let layer = LoadedLayer::scan(LayerKind::SystemPack, dir.path()).unwrap();
        let entry = layer.get("slots/interactive_query/prompt.md").unwrap();
        assert_eq!(entry.content, "hello");
        assert_eq!(entry.hash, content_hash("hello"));
    }

    #[test]
    fn test_layer_scan_missing_root_is_empty() {
        let layer =
            LoadedLayer::scan(LayerKind::ClientOverlay, Path::new("/nonexistent/overlay")).unwrap();
        assert!(layer.files.is_empty());
    }
}
