//! Prompt assembler: merges the system pack with client overlays for a slot,
//! expands fragment includes with a deterministic candidate search, renders
//! the result with minijinja, and returns the lineage of every file
//! consulted. Replaying the same pack versions and variables reproduces the
//! prompt byte for byte.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_yaml::Value as YamlValue;
use std::path::Path;

use crate::config::PromptConfig;
use crate::services::prompt::pack::{
    FileEntry, LayerKind, LoadedLayer, MergeError, merge, select_latest_version,
};
use crate::utils::error::ApiError;

#[derive(Debug, thiserror::Error)]
pub enum AssemblyError {
    #[error("unknown slot '{0}'")]
    MissingSlot(String),

    #[error("slot '{slot}' requires variable '{variable}'")]
    MissingVariable { slot: String, variable: String },

    #[error("fragment '{fragment}' not found (searched {})", .searched.join(", "))]
    MissingFragment { fragment: String, searched: Vec<String> },

    #[error("cyclic include: {}", .cycle.join(" -> "))]
    CyclicInclude { cycle: Vec<String> },

    #[error("ambiguous candidate '{fragment}': {}", .matches.join(", "))]
    AmbiguousCandidate { fragment: String, matches: Vec<String> },

    #[error("bad YAML in {path}: {detail}")]
    BadYaml { path: String, detail: String },

    #[error("merge failed in {path}: {source}")]
    Merge { path: String, source: MergeError },

    #[error("render failed in {path}: {detail}")]
    Render { path: String, detail: String },
}

impl From<AssemblyError> for ApiError {
    fn from(err: AssemblyError) -> Self {
        ApiError::Assembly(err.to_string())
    }
}

/// One consulted file, in consultation order. The reproducibility record.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct LineageEntry {
    pub layer: String,
    pub path: String,
    pub hash: String,
}

#[derive(Debug, Clone)]
pub struct AssembledPrompt {
    pub text: String,
    pub lineage: Vec<LineageEntry>,
}

static INCLUDE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"\{%-?\s*include\s+"([^"]+)"(\s+ignore\s+missing)?\s*-?%\}"#)
        .expect("static regex")
});

/// Immutable, process-lifetime view of all prompt layers for one component
pub struct PromptAssembler {
    /// Lowest precedence first
    layers: Vec<LoadedLayer>,
}

impl PromptAssembler {
    /// Load layers from the configured pack root:
    /// - `templates/<component>/` (shared building blocks, unversioned)
    /// - `resources/<component>/system-pack/<latest semver>/`
    /// - `client-configs/<client>/default/<component>/overlays/`
    /// - `client-configs/<client>/<env>/<component>/overlays/`
    pub fn load(config: &PromptConfig) -> Result<Self, anyhow::Error> {
        let root = Path::new(&config.root);
        let component = &config.component;
        let mut layers = Vec::new();

        layers.push(LoadedLayer::scan(
            LayerKind::SharedTemplates,
            &root.join("templates").join(component),
        )?);

        let pack_base = root.join("resources").join(component).join("system-pack");
        match select_latest_version(&pack_base)? {
            Some(version_dir) => {
                tracing::info!("Loading system pack from {}", version_dir.display());
                layers.push(LoadedLayer::scan(LayerKind::SystemPack, &version_dir)?);
            },
            None => {
                anyhow::bail!("no system pack found under {}", pack_base.display());
            },
        }

        if let Some(client) = &config.client {
            let client_base = root.join("client-configs").join(client);
            layers.push(LoadedLayer::scan(
                LayerKind::ClientOverlay,
                &client_base.join("default").join(component).join("overlays"),
            )?);

            if let Some(env) = &config.env
                && env != "default"
            {
                layers.push(LoadedLayer::scan(
                    LayerKind::ClientEnvOverlay,
                    &client_base.join(env).join(component).join("overlays"),
                )?);
            }
        }

        Ok(Self { layers })
    }

    /// Build an assembler directly from scanned layers (tests, tooling)
    pub fn from_layers(mut layers: Vec<LoadedLayer>) -> Self {
        layers.sort_by_key(|layer| layer.kind);
        Self { layers }
    }

    /// Slot names available in the merged view
    pub fn slot_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .layers
            .iter()
            .flat_map(|layer| layer.files.keys())
            .filter_map(|path| {
                path.strip_prefix("slots/")
                    .and_then(|rest| rest.split('/').next())
            })
            .map(|s| s.to_string())
            .filter(|name| name != "__default")
            .collect();
        names.sort();
        names.dedup();
        names
    }

    /// Render `slot` with `variables`. All errors are fatal for the call; no
    /// partial prompt is ever returned.
    pub fn assemble(
        &self,
        slot: &str,
        variables: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<AssembledPrompt, AssemblyError> {
        let slot_prefix = format!("slots/{}/", slot);
        let slot_exists = self
            .layers
            .iter()
            .any(|layer| layer.files.keys().any(|path| path.starts_with(&slot_prefix)));
        if !slot_exists {
            return Err(AssemblyError::MissingSlot(slot.to_string()));
        }

        let mut lineage: Vec<LineageEntry> = Vec::new();

        // 1. Slot metadata: required/optional variable declarations
        let meta = self.merged_yaml(&format!("slots/{}/meta.yaml", slot), &mut lineage)?;
        if let Some(meta) = &meta {
            self.check_required_variables(slot, meta, variables)?;
        }

        // 2. Expand the root fragment with candidate search + cycle detection
        let mut stack: Vec<String> = Vec::new();
        let expanded = self.expand_fragment("prompt.md", slot, &mut stack, &mut lineage)?;

        // 3. Shared resources exposed to templates as `resources`
        let resources = self.merged_resources(&mut lineage)?;

        // 4. Render
        let mut context = variables.clone();
        context
            .entry("resources".to_string())
            .or_insert(serde_json::to_value(&resources).unwrap_or(serde_json::Value::Null));

        let env = minijinja::Environment::new();
        let text = env
            .render_str(&expanded, serde_json::Value::Object(context))
            .map_err(|e| AssemblyError::Render {
                path: format!("slots/{}/prompt.md", slot),
                detail: e.to_string(),
            })?;

        dedupe_lineage(&mut lineage);
        Ok(AssembledPrompt { text, lineage })
    }

    // ------------------------------------------------------------------
    // Fragment resolution
    // ------------------------------------------------------------------

    /// Candidate search order for a referenced fragment; first hit wins
    fn candidate_dirs(slot: &str) -> Vec<String> {
        vec![format!("slots/{}", slot), "slots/__default".to_string(), "templates".to_string()]
    }

    fn expand_fragment(
        &self,
        fragment: &str,
        slot: &str,
        stack: &mut Vec<String>,
        lineage: &mut Vec<LineageEntry>,
    ) -> Result<String, AssemblyError> {
        let (path, layer, entry) = self.resolve_candidate(fragment, slot)?;

        if stack.contains(&path) {
            let mut cycle = stack.clone();
            cycle.push(path);
            return Err(AssemblyError::CyclicInclude { cycle });
        }

        lineage.push(LineageEntry {
            layer: layer.to_string(),
            path: path.clone(),
            hash: entry.hash.clone(),
        });

        stack.push(path);
        let expanded = self.expand_includes(&entry.content, slot, stack, lineage);
        stack.pop();
        expanded
    }

    fn expand_includes(
        &self,
        source: &str,
        slot: &str,
        stack: &mut Vec<String>,
        lineage: &mut Vec<LineageEntry>,
    ) -> Result<String, AssemblyError> {
        let mut output = String::with_capacity(source.len());
        let mut last_end = 0;

        for captures in INCLUDE_RE.captures_iter(source) {
            let Some(whole) = captures.get(0) else {
                continue;
            };
            let fragment = &captures[1];
            let optional = captures.get(2).is_some();

            output.push_str(&source[last_end..whole.start()]);
            last_end = whole.end();

            match self.expand_fragment(fragment, slot, stack, lineage) {
                Ok(expanded) => output.push_str(&expanded),
                Err(AssemblyError::MissingFragment { .. }) if optional => {},
                Err(err) => return Err(err),
            }
        }

        output.push_str(&source[last_end..]);
        Ok(output)
    }

    /// Resolve `fragment` through the candidate directories. References
    /// without an extension match by file stem; two stem matches inside one
    /// candidate directory are ambiguous.
    fn resolve_candidate(
        &self,
        fragment: &str,
        slot: &str,
    ) -> Result<(String, LayerKind, FileEntry), AssemblyError> {
        let dirs = Self::candidate_dirs(slot);
        let has_extension = fragment.contains('.');

        for dir in &dirs {
            if has_extension {
                let path = format!("{}/{}", dir, fragment);
                if let Some((layer, entry)) = self.lookup(&path) {
                    return Ok((path, layer, entry.clone()));
                }
                continue;
            }

            // Stem search within this candidate directory, merged across layers
            let prefix = format!("{}/", dir);
            let mut matches: Vec<String> = self
                .layers
                .iter()
                .flat_map(|layer| layer.files.keys())
                .filter(|path| {
                    path.strip_prefix(&prefix).is_some_and(|rest| {
                        let stem = rest.rsplit_once('.').map_or(rest, |(stem, _)| stem);
                        !rest.contains('/') && stem == fragment
                    })
                })
                .cloned()
                .collect();
            matches.sort();
            matches.dedup();

            match matches.len() {
                0 => {},
                1 => {
                    let path = matches.remove(0);
                    if let Some((layer, entry)) = self.lookup(&path) {
                        return Ok((path, layer, entry.clone()));
                    }
                },
                _ => {
                    return Err(AssemblyError::AmbiguousCandidate {
                        fragment: fragment.to_string(),
                        matches,
                    });
                },
            }
        }

        Err(AssemblyError::MissingFragment {
            fragment: fragment.to_string(),
            searched: dirs,
        })
    }

    /// Highest-precedence layer defining `path` wins
    fn lookup(&self, path: &str) -> Option<(LayerKind, &FileEntry)> {
        self.layers
            .iter()
            .rev()
            .find_map(|layer| layer.get(path).map(|entry| (layer.kind, entry)))
    }

    // ------------------------------------------------------------------
    // YAML views
    // ------------------------------------------------------------------

    /// Merge one YAML path across all layers, lowest precedence first
    fn merged_yaml(
        &self,
        path: &str,
        lineage: &mut Vec<LineageEntry>,
    ) -> Result<Option<YamlValue>, AssemblyError> {
        let mut merged: Option<YamlValue> = None;
        for layer in &self.layers {
            let Some(entry) = layer.get(path) else {
                continue;
            };
            let value: YamlValue = serde_yaml::from_str(&entry.content).map_err(|e| {
                AssemblyError::BadYaml { path: path.to_string(), detail: e.to_string() }
            })?;
            lineage.push(LineageEntry {
                layer: layer.kind.to_string(),
                path: path.to_string(),
                hash: entry.hash.clone(),
            });
            merged = Some(match merged {
                Some(base) => merge(base, value)
                    .map_err(|source| AssemblyError::Merge { path: path.to_string(), source })?,
                None => value,
            });
        }
        Ok(merged)
    }

    /// All `resources/*.yaml` files merged per path, keyed by file stem
    fn merged_resources(
        &self,
        lineage: &mut Vec<LineageEntry>,
    ) -> Result<serde_json::Map<String, serde_json::Value>, AssemblyError> {
        let mut paths: Vec<String> = self
            .layers
            .iter()
            .flat_map(|layer| layer.files.keys())
            .filter(|path| {
                path.starts_with("resources/")
                    && (path.ends_with(".yaml") || path.ends_with(".yml"))
            })
            .cloned()
            .collect();
        paths.sort();
        paths.dedup();

        let mut resources = serde_json::Map::new();
        for path in paths {
            let Some(value) = self.merged_yaml(&path, lineage)? else {
                continue;
            };
            let stem = Path::new(&path)
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.clone());
            let json = serde_json::to_value(&value).map_err(|e| AssemblyError::BadYaml {
                path: path.clone(),
                detail: e.to_string(),
            })?;
            resources.insert(stem, json);
        }
        Ok(resources)
    }

    fn check_required_variables(
        &self,
        slot: &str,
        meta: &YamlValue,
        variables: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<(), AssemblyError> {
        let required = meta
            .get("variables")
            .and_then(|v| v.get("required"))
            .and_then(|v| v.as_sequence())
            .cloned()
            .unwrap_or_default();

        for variable in required {
            let Some(name) = variable.as_str() else {
                continue;
            };
            let present = variables
                .get(name)
                .is_some_and(|value| !value.is_null());
            if !present {
                return Err(AssemblyError::MissingVariable {
                    slot: slot.to_string(),
                    variable: name.to_string(),
                });
            }
        }
        Ok(())
    }
}

/// Keep the first consultation of each (layer, path); repeat includes of one
/// fragment do not inflate the record.
fn dedupe_lineage(lineage: &mut Vec<LineageEntry>) {
    let mut seen = std::collections::HashSet::new();
    lineage.retain(|entry| seen.insert((entry.layer.clone(), entry.path.clone())));
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn layer_from(dir: &TempDir, kind: LayerKind, files: &[(&str, &str)]) -> LoadedLayer {
        let root = dir.path().join(format!("{:?}", kind));
        for (path, content) in files {
            let full = root.join(path);
            fs::create_dir_all(full.parent().unwrap()).unwrap();
            fs::write(full, content).unwrap();
        }
        LoadedLayer::scan(kind, &root).unwrap()
    }

    fn vars(pairs: &[(&str, &str)]) -> serde_json::Map<String, serde_json::Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), serde_json::Value::String(v.to_string())))
            .collect()
    }

    #[test]
    fn test_assemble_renders_variables() {
        let dir = TempDir::new().unwrap();
        let pack = layer_from(
            &dir,
            LayerKind::SystemPack,
            &[("slots/greet/prompt.md", "Hello {{ name }}!")],
        );
        let assembler = PromptAssembler::from_layers(vec![pack]);

        let prompt = assembler.assemble("greet", &vars(&[("name", "Ann")])).unwrap();
        assert_eq!(prompt.text, "Hello Ann!");
        assert_eq!(prompt.lineage.len(), 1);
        assert_eq!(prompt.lineage[0].path, "slots/greet/prompt.md");
    }

    #[test]
    fn test_missing_slot() {
        let dir = TempDir::new().unwrap();
        let pack =
            layer_from(&dir, LayerKind::SystemPack, &[("slots/a/prompt.md", "x")]);
        let assembler = PromptAssembler::from_layers(vec![pack]);

        let err = assembler.assemble("missing", &vars(&[])).unwrap_err();
        assert!(matches!(err, AssemblyError::MissingSlot(_)));
    }

    #[test]
    fn test_include_candidate_order() {
        let dir = TempDir::new().unwrap();
        let pack = layer_from(
            &dir,
            LayerKind::SystemPack,
            &[
                ("slots/q/prompt.md", "A {% include \"domain.md\" %} B"),
                ("slots/q/domain.md", "slot-domain"),
                ("slots/__default/domain.md", "default-domain"),
            ],
        );
        let assembler = PromptAssembler::from_layers(vec![pack]);

        let prompt = assembler.assemble("q", &vars(&[])).unwrap();
        assert_eq!(prompt.text, "A slot-domain B");
    }

    #[test]
    fn test_include_falls_back_to_default_then_templates() {
        let dir = TempDir::new().unwrap();
        let shared = layer_from(
            &dir,
            LayerKind::SharedTemplates,
            &[("footer.md", "shared-footer")],
        );
        let pack = layer_from(
            &dir,
            LayerKind::SystemPack,
            &[
                ("slots/q/prompt.md", "{% include \"common.md\" %}|{% include \"footer.md\" %}"),
                ("slots/__default/common.md", "default-common"),
            ],
        );
        let assembler = PromptAssembler::from_layers(vec![shared, pack]);

        let prompt = assembler.assemble("q", &vars(&[])).unwrap();
        assert_eq!(prompt.text, "default-common|shared-footer");
    }

    #[test]
    fn test_optional_include_may_miss() {
        let dir = TempDir::new().unwrap();
        let pack = layer_from(
            &dir,
            LayerKind::SystemPack,
            &[("slots/q/prompt.md", "A{% include \"extra.md\" ignore missing %}B")],
        );
        let assembler = PromptAssembler::from_layers(vec![pack]);

        let prompt = assembler.assemble("q", &vars(&[])).unwrap();
        assert_eq!(prompt.text, "AB");
    }

    #[test]
    fn test_required_include_missing_fails() {
        let dir = TempDir::new().unwrap();
        let pack = layer_from(
            &dir,
            LayerKind::SystemPack,
            &[("slots/q/prompt.md", "{% include \"extra.md\" %}")],
        );
        let assembler = PromptAssembler::from_layers(vec![pack]);

        let err = assembler.assemble("q", &vars(&[])).unwrap_err();
        assert!(matches!(err, AssemblyError::MissingFragment { .. }));
    }

    #[test]
    fn test_cyclic_include_names_cycle() {
        let dir = TempDir::new().unwrap();
        let pack = layer_from(
            &dir,
            LayerKind::SystemPack,
            &[
                ("slots/q/prompt.md", "{% include \"a.md\" %}"),
                ("slots/q/a.md", "{% include \"b.md\" %}"),
                ("slots/q/b.md", "{% include \"a.md\" %}"),
            ],
        );
        let assembler = PromptAssembler::from_layers(vec![pack]);

        let err = assembler.assemble("q", &vars(&[])).unwrap_err();
        match err {
            AssemblyError::CyclicInclude { cycle } => {
                assert!(cycle.contains(&"slots/q/a.md".to_string()));
                assert!(cycle.contains(&"slots/q/b.md".to_string()));
                assert_eq!(cycle.first(), Some(&"slots/q/prompt.md".to_string()));
            },
            other => panic!("expected cycle error, got {:?}", other),
        }
    }

    #[test]
    fn test_ambiguous_stem_reference() {
        let dir = TempDir::new().unwrap();
        let pack = layer_from(
            &dir,
            LayerKind::SystemPack,
            &[
                ("slots/q/prompt.md", "{% include \"domain\" %}"),
                ("slots/q/domain.md", "x"),
                ("slots/q/domain.yaml", "y: 1"),
            ],
        );
        let assembler = PromptAssembler::from_layers(vec![pack]);

        let err = assembler.assemble("q", &vars(&[])).unwrap_err();
        assert!(matches!(err, AssemblyError::AmbiguousCandidate { .. }));
    }

    #[test]
    fn test_overlay_shadows_pack_fragment() {
        let dir = TempDir::new().unwrap();
        let pack = layer_from(
            &dir,
            LayerKind::SystemPack,
            &[
                ("slots/q/prompt.md", "{% include \"rules.md\" %}"),
                ("slots/q/rules.md", "system rules"),
            ],
        );
        let overlay = layer_from(
            &dir,
            LayerKind::ClientOverlay,
            &[("slots/q/rules.md", "client rules")],
        );
        let env_overlay = layer_from(
            &dir,
            LayerKind::ClientEnvOverlay,
            &[("slots/q/rules.md", "client env rules")],
        );

        let assembler =
            PromptAssembler::from_layers(vec![pack.clone(), overlay.clone()]);
        assert_eq!(assembler.assemble("q", &vars(&[])).unwrap().text, "client rules");

        let assembler = PromptAssembler::from_layers(vec![pack, overlay, env_overlay]);
        let prompt = assembler.assemble("q", &vars(&[])).unwrap();
        assert_eq!(prompt.text, "client env rules");
        assert_eq!(prompt.lineage.last().unwrap().layer, "client-env-overlay");
    }

    #[test]
    fn test_required_variable_enforced() {
        let dir = TempDir::new().unwrap();
        let pack = layer_from(
            &dir,
            LayerKind::SystemPack,
            &[
                ("slots/q/prompt.md", "{{ user_request }}"),
                ("slots/q/meta.yaml", "variables:\n  required: [user_request]\n  optional: [history]"),
            ],
        );
        let assembler = PromptAssembler::from_layers(vec![pack]);

        let err = assembler.assemble("q", &vars(&[])).unwrap_err();
        match err {
            AssemblyError::MissingVariable { variable, .. } => {
                assert_eq!(variable, "user_request");
            },
            other => panic!("unexpected: {:?}", other),
        }

        let ok = assembler
            .assemble("q", &vars(&[("user_request", "list users")]))
            .unwrap();
        assert_eq!(ok.text, "list users");
    }

    #[test]
    fn test_resources_visible_in_templates() {
        let dir = TempDir::new().unwrap();
        let pack = layer_from(
            &dir,
            LayerKind::SystemPack,
            &[
                ("slots/q/prompt.md", "{{ resources.glossary.tone }}"),
                ("resources/glossary.yaml", "tone: precise"),
            ],
        );
        let assembler = PromptAssembler::from_layers(vec![pack]);

        let prompt = assembler.assemble("q", &vars(&[])).unwrap();
        assert_eq!(prompt.text, "precise");
    }

    #[test]
    fn test_resource_list_merge_with_strategy() {
        let dir = TempDir::new().unwrap();
        let pack = layer_from(
            &dir,
            LayerKind::SystemPack,
            &[
                (
                    "slots/q/prompt.md",
                    "{% for r in resources.rules.banned %}{{ r }};{% endfor %}",
                ),
                ("resources/rules.yaml", "banned: [drop, truncate]"),
            ],
        );
        let overlay = layer_from(
            &dir,
            LayerKind::ClientOverlay,
            &[("resources/rules.yaml", "banned:\n  strategy: append\n  items: [grant]")],
        );
        let assembler = PromptAssembler::from_layers(vec![pack, overlay]);

        let prompt = assembler.assemble("q", &vars(&[])).unwrap();
        assert_eq!(prompt.text, "drop;truncate;grant;");
    }

    #[test]
    fn test_replay_reproduces_identical_prompt_and_lineage() {
        let dir = TempDir::new().unwrap();
        let pack = layer_from(
            &dir,
            LayerKind::SystemPack,
            &[
                ("slots/q/prompt.md", "{% include \"ctx.md\" %} {{ question }}"),
                ("slots/q/ctx.md", "context"),
            ],
        );
        let assembler = PromptAssembler::from_layers(vec![pack]);
        let variables = vars(&[("question", "why?")]);

        let first = assembler.assemble("q", &variables).unwrap();
        let second = assembler.assemble("q", &variables).unwrap();
        assert_eq!(first.text, second.text);
        assert_eq!(first.lineage, second.lineage);
    }

    #[test]
    fn test_render_error_names_fragment() {
        let dir = TempDir::new().unwrap();
        let pack = layer_from(
            &dir,
            LayerKind::SystemPack,
            &[("slots/q/prompt.md", "{% for x in %}broken{% endfor %}")],
        );
        let assembler = PromptAssembler::from_layers(vec![pack]);

        let err = assembler.assemble("q", &vars(&[])).unwrap_err();
        match err {
            AssemblyError::Render { path, .. } => assert!(path.contains("slots/q/prompt.md")),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_slot_names() {
        let dir = TempDir::new().unwrap();
        let pack = layer_from(
            &dir,
            LayerKind::SystemPack,
            &[
                ("slots/interactive_query/prompt.md", "x"),
                ("slots/intent_analyzer/prompt.md", "y"),
                ("slots/__default/footer.md", "z"),
            ],
        );
        let assembler = PromptAssembler::from_layers(vec![pack]);
        assert_eq!(assembler.slot_names(), vec!["intent_analyzer", "interactive_query"]);
    }
}
