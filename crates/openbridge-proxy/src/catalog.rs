//! Static model catalog and alias resolution.

use std::collections::HashMap;

use openbridge_protocol::openai::{ModelInfo, ModelsResponse};

/// Backend model ids advertised on `/v1/models`.
const BACKEND_MODELS: &[&str] = &[
    "claude-opus-4-1",
    "claude-opus-4-0",
    "claude-sonnet-4-5",
    "claude-sonnet-4-0",
    "claude-3-7-sonnet-latest",
    "claude-haiku-4-5",
    "claude-3-5-haiku-latest",
];

/// OpenAI-style names and short names mapped onto backend ids.
const BUILTIN_ALIASES: &[(&str, &str)] = &[
    ("gpt-4o", "claude-sonnet-4-5"),
    ("gpt-4o-mini", "claude-haiku-4-5"),
    ("gpt-4.1", "claude-sonnet-4-5"),
    ("gpt-4.1-mini", "claude-haiku-4-5"),
    ("gpt-4", "claude-opus-4-1"),
    ("gpt-4-turbo", "claude-opus-4-1"),
    ("gpt-3.5-turbo", "claude-haiku-4-5"),
    ("o1", "claude-opus-4-1"),
    ("o3", "claude-opus-4-1"),
    ("o3-mini", "claude-sonnet-4-5"),
    ("opus", "claude-opus-4-1"),
    ("sonnet", "claude-sonnet-4-5"),
    ("haiku", "claude-haiku-4-5"),
];

/// Fixed creation timestamp reported for every catalog entry.
const CATALOG_CREATED: i64 = 1_727_740_800;

#[derive(Debug, Clone)]
pub struct ModelCatalog {
    aliases: HashMap<String, String>,
}

impl ModelCatalog {
    /// Built-in aliases with `overrides` layered on top.
    pub fn new(overrides: &HashMap<String, String>) -> Self {
        let mut aliases: HashMap<String, String> = BUILTIN_ALIASES
            .iter()
            .map(|(alias, id)| (alias.to_string(), id.to_string()))
            .collect();
        aliases.extend(overrides.iter().map(|(k, v)| (k.clone(), v.clone())));
        Self { aliases }
    }

    /// Map a requested model onto a backend id. Unknown names pass through.
    pub fn resolve<'a>(&'a self, requested: &'a str) -> &'a str {
        self.aliases
            .get(requested)
            .map(String::as_str)
            .unwrap_or(requested)
    }

    pub fn list(&self) -> ModelsResponse {
        let mut ids: Vec<&str> = BACKEND_MODELS.to_vec();
        let mut alias_ids: Vec<&str> = self.aliases.keys().map(String::as_str).collect();
        alias_ids.sort_unstable();
        ids.extend(alias_ids);

        ModelsResponse {
            object: "list",
            data: ids.into_iter().map(model_info).collect(),
        }
    }

    /// Look up one model id (backend id or alias).
    pub fn get(&self, id: &str) -> Option<ModelInfo> {
        let known = BACKEND_MODELS.contains(&id) || self.aliases.contains_key(id);
        known.then(|| model_info(id))
    }
}

impl Default for ModelCatalog {
    fn default() -> Self {
        Self::new(&HashMap::new())
    }
}

fn model_info(id: &str) -> ModelInfo {
    ModelInfo {
        id: id.to_string(),
        object: "model",
        created: CATALOG_CREATED,
        owned_by: "anthropic".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_aliases_and_passes_unknown_through() {
        let catalog = ModelCatalog::default();
        assert_eq!(catalog.resolve("gpt-4o"), "claude-sonnet-4-5");
        assert_eq!(catalog.resolve("claude-opus-4-1"), "claude-opus-4-1");
        assert_eq!(catalog.resolve("some-future-model"), "some-future-model");
    }

    #[test]
    fn overrides_win_over_builtins() {
        let overrides = HashMap::from([("gpt-4o".to_string(), "claude-opus-4-1".to_string())]);
        let catalog = ModelCatalog::new(&overrides);
        assert_eq!(catalog.resolve("gpt-4o"), "claude-opus-4-1");
    }

    #[test]
    fn lookup_covers_backend_ids_and_aliases() {
        let catalog = ModelCatalog::default();
        assert!(catalog.get("claude-haiku-4-5").is_some());
        assert!(catalog.get("sonnet").is_some());
        assert!(catalog.get("nope").is_none());

        let list = catalog.list();
        assert_eq!(list.object, "list");
        assert_eq!(list.data[0].id, "claude-opus-4-1");
        assert!(list.data.iter().any(|m| m.id == "gpt-4o"));
    }
}
