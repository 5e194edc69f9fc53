use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use url::Url;

/// Endpoints one engine exposes. Missing endpoints mean the engine does not
/// offer that capability.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineTarget {
    pub name: String,
    #[serde(default)]
    pub evaluate_url: Option<String>,
    #[serde(default)]
    pub accuracy_url: Option<String>,
    #[serde(default)]
    pub delete_url: Option<String>,
    #[serde(default)]
    pub validation_url: Option<String>,
    #[serde(default)]
    pub functions_url: Option<String>,
    #[serde(default)]
    pub documentation_url: Option<String>,
}

impl EngineTarget {
    /// Target whose endpoints follow the routes served by `dpgate-engine`.
    pub fn standard(name: impl Into<String>, base: &str) -> Self {
        let base = base.trim_end_matches('/');
        Self {
            name: name.into(),
            evaluate_url: Some(format!("{base}/evaluate")),
            accuracy_url: Some(format!("{base}/accuracy")),
            delete_url: Some(format!("{base}/cache")),
            validation_url: Some(format!("{base}/validate")),
            functions_url: Some(format!("{base}/functions")),
            documentation_url: Some(format!("{base}/documentation")),
        }
    }

    fn urls(&self) -> impl Iterator<Item = (&'static str, &String)> {
        [
            ("evaluate_url", &self.evaluate_url),
            ("accuracy_url", &self.accuracy_url),
            ("delete_url", &self.delete_url),
            ("validation_url", &self.validation_url),
            ("functions_url", &self.functions_url),
            ("documentation_url", &self.documentation_url),
        ]
        .into_iter()
        .filter_map(|(field, url)| url.as_ref().map(|url| (field, url)))
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnginesConfig {
    #[serde(default)]
    pub default: String,
    #[serde(default)]
    pub engines: Vec<EngineTarget>,
}

impl EnginesConfig {
    /// Engines keyed by lower-cased name. Later duplicates win.
    pub fn by_name(&self) -> BTreeMap<String, EngineTarget> {
        self.engines
            .iter()
            .map(|engine| (engine.name.to_lowercase(), engine.clone()))
            .collect()
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.engines.is_empty() {
            return Err("at least one engine must be configured".into());
        }
        for engine in &self.engines {
            if engine.name.trim().is_empty() {
                return Err("engine name cannot be empty".into());
            }
            for (field, url) in engine.urls() {
                Url::parse(url)
                    .map_err(|err| format!("engine {}: invalid {field} {url:?}: {err}", engine.name))?;
            }
        }
        Ok(())
    }
}
