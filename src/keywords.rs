/// Keyword resolution
///
/// Turns built-in identifiers and custom keyword descriptors into the parallel
/// label / asset / sensitivity sequences the engine is initialized with.
/// Resolution only validates and looks up; custom assets are provisioned later
/// by the controller.

use crate::error::EngineError;
use crate::model_store::ModelSource;
use std::fmt;
use std::str::FromStr;
use tracing::debug;

/// Sensitivity used when a keyword does not specify one
pub const DEFAULT_SENSITIVITY: f32 = 0.5;

/// Prefix of the reserved asset names used for built-in keywords
pub const BUILTIN_ASSET_PREFIX: &str = "builtin:";

/// Keywords that ship with the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BuiltInKeyword {
    Alexa,
    Americano,
    Blueberry,
    Bumblebee,
    Computer,
    Grapefruit,
    Grasshopper,
    HeyGoogle,
    HeySiri,
    Jarvis,
    OkGoogle,
    Picovoice,
    Porcupine,
    Terminator,
}

impl BuiltInKeyword {
    pub const ALL: [BuiltInKeyword; 14] = [
        BuiltInKeyword::Alexa,
        BuiltInKeyword::Americano,
        BuiltInKeyword::Blueberry,
        BuiltInKeyword::Bumblebee,
        BuiltInKeyword::Computer,
        BuiltInKeyword::Grapefruit,
        BuiltInKeyword::Grasshopper,
        BuiltInKeyword::HeyGoogle,
        BuiltInKeyword::HeySiri,
        BuiltInKeyword::Jarvis,
        BuiltInKeyword::OkGoogle,
        BuiltInKeyword::Picovoice,
        BuiltInKeyword::Porcupine,
        BuiltInKeyword::Terminator,
    ];

    /// Human-readable phrase, also used as the detection label
    pub fn label(self) -> &'static str {
        match self {
            BuiltInKeyword::Alexa => "alexa",
            BuiltInKeyword::Americano => "americano",
            BuiltInKeyword::Blueberry => "blueberry",
            BuiltInKeyword::Bumblebee => "bumblebee",
            BuiltInKeyword::Computer => "computer",
            BuiltInKeyword::Grapefruit => "grapefruit",
            BuiltInKeyword::Grasshopper => "grasshopper",
            BuiltInKeyword::HeyGoogle => "hey google",
            BuiltInKeyword::HeySiri => "hey siri",
            BuiltInKeyword::Jarvis => "jarvis",
            BuiltInKeyword::OkGoogle => "ok google",
            BuiltInKeyword::Picovoice => "picovoice",
            BuiltInKeyword::Porcupine => "porcupine",
            BuiltInKeyword::Terminator => "terminator",
        }
    }

    /// Reserved asset name understood by the model store and engine
    pub fn asset_name(self) -> String {
        format!("{}{}", BUILTIN_ASSET_PREFIX, self.label().replace(' ', "_"))
    }
}

impl fmt::Display for BuiltInKeyword {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for BuiltInKeyword {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s
            .replace(['_', '-'], " ")
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
            .to_lowercase();

        BuiltInKeyword::ALL
            .iter()
            .copied()
            .find(|k| k.label() == normalized)
            .ok_or_else(|| EngineError::Validation(format!("Unknown built-in keyword: '{}'", s)))
    }
}

/// Keyword backed by an application-supplied model asset
#[derive(Debug, Clone)]
pub struct CustomKeyword {
    pub label: String,
    pub source: ModelSource,
    pub sensitivity: Option<f32>,

    /// Storage key in the model store (defaults to `<storage_path>-<label>`)
    pub storage_path: Option<String>,
    pub force_overwrite: bool,
    pub version: u32,
}

impl CustomKeyword {
    pub fn new(label: impl Into<String>, source: ModelSource) -> Self {
        Self {
            label: label.into(),
            source,
            sensitivity: None,
            storage_path: None,
            force_overwrite: false,
            version: 1,
        }
    }

    pub fn with_sensitivity(mut self, sensitivity: f32) -> Self {
        self.sensitivity = Some(sensitivity);
        self
    }

    pub fn with_storage_path(mut self, storage_path: impl Into<String>) -> Self {
        self.storage_path = Some(storage_path.into());
        self
    }

    pub fn with_force_overwrite(mut self, force_overwrite: bool) -> Self {
        self.force_overwrite = force_overwrite;
        self
    }

    pub fn with_version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }
}

/// One keyword as supplied by the application
#[derive(Debug, Clone)]
pub enum KeywordSpec {
    BuiltIn {
        keyword: BuiltInKeyword,
        sensitivity: Option<f32>,
    },

    /// Built-in keyword given by name, checked during resolution
    Named {
        name: String,
        sensitivity: Option<f32>,
    },

    Custom(CustomKeyword),
}

impl KeywordSpec {
    pub fn with_sensitivity(self, sensitivity: f32) -> Self {
        match self {
            KeywordSpec::BuiltIn { keyword, .. } => KeywordSpec::BuiltIn {
                keyword,
                sensitivity: Some(sensitivity),
            },
            KeywordSpec::Named { name, .. } => KeywordSpec::Named {
                name,
                sensitivity: Some(sensitivity),
            },
            KeywordSpec::Custom(custom) => KeywordSpec::Custom(custom.with_sensitivity(sensitivity)),
        }
    }
}

impl From<BuiltInKeyword> for KeywordSpec {
    fn from(keyword: BuiltInKeyword) -> Self {
        KeywordSpec::BuiltIn {
            keyword,
            sensitivity: None,
        }
    }
}

impl From<&str> for KeywordSpec {
    fn from(name: &str) -> Self {
        KeywordSpec::Named {
            name: name.to_string(),
            sensitivity: None,
        }
    }
}

impl From<String> for KeywordSpec {
    fn from(name: String) -> Self {
        KeywordSpec::Named {
            name,
            sensitivity: None,
        }
    }
}

impl From<CustomKeyword> for KeywordSpec {
    fn from(custom: CustomKeyword) -> Self {
        KeywordSpec::Custom(custom)
    }
}

/// Where a resolved keyword's model comes from
#[derive(Debug, Clone)]
pub enum KeywordAsset {
    BuiltIn(BuiltInKeyword),
    Custom {
        source: ModelSource,
        storage_key: String,
        force_overwrite: bool,
        version: u32,
    },
}

/// Resolved keywords as parallel, index-aligned sequences
#[derive(Debug, Clone, Default)]
pub struct KeywordSet {
    labels: Vec<String>,
    assets: Vec<KeywordAsset>,
    sensitivities: Vec<f32>,
}

impl KeywordSet {
    fn push(&mut self, label: String, asset: KeywordAsset, sensitivity: f32) {
        self.labels.push(label);
        self.assets.push(asset);
        self.sensitivities.push(sensitivity);
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    pub fn assets(&self) -> &[KeywordAsset] {
        &self.assets
    }

    pub fn sensitivities(&self) -> &[f32] {
        &self.sensitivities
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

fn check_sensitivity(label: &str, sensitivity: Option<f32>) -> Result<f32, EngineError> {
    let value = sensitivity.unwrap_or(DEFAULT_SENSITIVITY);
    if !(0.0..=1.0).contains(&value) {
        return Err(EngineError::Validation(format!(
            "Sensitivity for '{}' must be between 0.0 and 1.0, got {}",
            label, value
        )));
    }
    Ok(value)
}

/// Storage keys name a single file in the model store
pub(crate) fn check_storage_key(owner: &str, key: &str) -> Result<(), EngineError> {
    if key.trim().is_empty() || key == "." || key == ".." || key.contains(['/', '\\']) {
        return Err(EngineError::Validation(format!(
            "Storage key '{}' for '{}' must be a plain file name",
            key, owner
        )));
    }
    Ok(())
}

/// Validate and resolve keywords in input order
///
/// `default_storage_path` seeds the storage key of custom keywords that do not
/// name their own.
pub fn resolve_keywords<I, K>(keywords: I, default_storage_path: &str) -> Result<KeywordSet, EngineError>
where
    I: IntoIterator<Item = K>,
    K: Into<KeywordSpec>,
{
    let mut set = KeywordSet::default();

    for spec in keywords.into_iter().map(Into::into) {
        match spec {
            KeywordSpec::BuiltIn { keyword, sensitivity } => {
                let sensitivity = check_sensitivity(keyword.label(), sensitivity)?;
                set.push(keyword.label().to_string(), KeywordAsset::BuiltIn(keyword), sensitivity);
            }
            KeywordSpec::Named { name, sensitivity } => {
                let keyword: BuiltInKeyword = name.parse()?;
                let sensitivity = check_sensitivity(keyword.label(), sensitivity)?;
                set.push(keyword.label().to_string(), KeywordAsset::BuiltIn(keyword), sensitivity);
            }
            KeywordSpec::Custom(custom) => {
                if custom.label.trim().is_empty() {
                    return Err(EngineError::Validation(
                        "Custom keyword label must not be empty".to_string(),
                    ));
                }
                if custom.source.is_empty() {
                    return Err(EngineError::Validation(format!(
                        "Custom keyword '{}' has an empty model source",
                        custom.label
                    )));
                }
                let sensitivity = check_sensitivity(&custom.label, custom.sensitivity)?;
                let storage_key = custom
                    .storage_path
                    .unwrap_or_else(|| format!("{}-{}", default_storage_path, custom.label));
                check_storage_key(&custom.label, &storage_key)?;

                set.push(
                    custom.label,
                    KeywordAsset::Custom {
                        source: custom.source,
                        storage_key,
                        force_overwrite: custom.force_overwrite,
                        version: custom.version,
                    },
                    sensitivity,
                );
            }
        }
    }

    if set.is_empty() {
        return Err(EngineError::Validation("At least one keyword is required".to_string()));
    }

    debug!("Resolved {} keyword(s): {:?}", set.len(), set.labels());
    Ok(set)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_parse_builtin_names() {
        assert_eq!("porcupine".parse::<BuiltInKeyword>().unwrap(), BuiltInKeyword::Porcupine);
        assert_eq!("Hey_Google".parse::<BuiltInKeyword>().unwrap(), BuiltInKeyword::HeyGoogle);
        assert_eq!("ok-google".parse::<BuiltInKeyword>().unwrap(), BuiltInKeyword::OkGoogle);
        assert!("hey aether".parse::<BuiltInKeyword>().is_err());
    }

    #[test]
    fn test_asset_names() {
        assert_eq!(BuiltInKeyword::HeySiri.asset_name(), "builtin:hey_siri");
        assert_eq!(BuiltInKeyword::Jarvis.asset_name(), "builtin:jarvis");
    }

    #[test]
    fn test_order_and_length_preserved() {
        let specs = vec![
            KeywordSpec::from(BuiltInKeyword::Computer).with_sensitivity(0.1),
            KeywordSpec::from("jarvis").with_sensitivity(0.9),
            CustomKeyword::new("aether", ModelSource::Base64("AAEC".to_string()))
                .with_sensitivity(0.3)
                .into(),
        ];

        let set = resolve_keywords(specs, "porcupine_model").unwrap();

        assert_eq!(set.len(), 3);
        assert_eq!(set.labels(), ["computer", "jarvis", "aether"]);
        assert_relative_eq!(set.sensitivities()[0], 0.1);
        assert_relative_eq!(set.sensitivities()[1], 0.9);
        assert_relative_eq!(set.sensitivities()[2], 0.3);
        match &set.assets()[2] {
            KeywordAsset::Custom { storage_key, .. } => assert_eq!(storage_key, "porcupine_model-aether"),
            other => panic!("Expected custom asset, got {:?}", other),
        }
    }

    #[test]
    fn test_default_sensitivity() {
        let set = resolve_keywords(["porcupine"], "model").unwrap();
        assert_relative_eq!(set.sensitivities()[0], DEFAULT_SENSITIVITY);
    }

    #[test]
    fn test_sensitivity_bounds() {
        for bad in [-0.01, 1.01, f32::NAN] {
            let result = resolve_keywords([KeywordSpec::from("porcupine").with_sensitivity(bad)], "model");
            assert!(matches!(result, Err(EngineError::Validation(_))), "accepted {}", bad);
        }

        for good in [0.0, 1.0] {
            assert!(resolve_keywords([KeywordSpec::from("porcupine").with_sensitivity(good)], "model").is_ok());
        }
    }

    #[test]
    fn test_empty_inputs_rejected() {
        let none: Vec<KeywordSpec> = Vec::new();
        assert!(matches!(resolve_keywords(none, "model"), Err(EngineError::Validation(_))));

        let unlabeled = CustomKeyword::new("  ", ModelSource::Base64("AAEC".to_string()));
        assert!(resolve_keywords([unlabeled], "model").is_err());

        let no_payload = CustomKeyword::new("aether", ModelSource::Base64(String::new()));
        assert!(resolve_keywords([no_payload], "model").is_err());
    }

    #[test]
    fn test_custom_label_with_path_separator_rejected() {
        for label in ["hey/aether", "hey\\aether"] {
            let custom = CustomKeyword::new(label, ModelSource::Base64("AAEC".to_string()));
            let err = resolve_keywords([custom], "model").unwrap_err();
            assert!(matches!(err, EngineError::Validation(_)), "got {:?}", err);
        }

        let custom = CustomKeyword::new("hey aether", ModelSource::Base64("AAEC".to_string()))
            .with_storage_path("../escape");
        assert!(matches!(
            resolve_keywords([custom], "model"),
            Err(EngineError::Validation(_))
        ));

        let custom = CustomKeyword::new("hey aether", ModelSource::Base64("AAEC".to_string()));
        assert!(resolve_keywords([custom], "model").is_ok());
    }

    #[test]
    fn test_unknown_identifier() {
        let err = resolve_keywords(["porcupine", "marmot"], "model").unwrap_err();
        assert!(err.to_string().contains("marmot"));
    }
}
