use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;

use crate::config::LanguageConfig;
use crate::error::{RegistryError, ValidationError};

/// Stem of the source file inside every workspace
pub const SOURCE_STEM: &str = "Main";
pub const INPUT_FILE: &str = "input.txt";
pub const OUTPUT_FILE: &str = "output.txt";

/// How to build and run one language inside a container
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LanguageProfile {
    pub name: String,
    pub extension: String,
    pub image: String,
    #[serde(skip)]
    pub command: String,
}

impl LanguageProfile {
    pub fn source_file_name(&self) -> String {
        format!("{SOURCE_STEM}.{}", self.extension)
    }

    /// Substitutes the canonical file names into the command template.
    ///
    /// Only the fixed names above ever reach the shell; nothing derived from
    /// the request or the workspace location is interpolated.
    pub fn render_command(&self) -> String {
        let source = self.source_file_name();
        let mapping = [
            ("%SOURCE%", source.as_str()),
            ("%INPUT%", INPUT_FILE),
            ("%OUTPUT%", OUTPUT_FILE),
        ];
        apply_template(&self.command, &mapping)
    }

    fn check(&self) -> Result<(), RegistryError> {
        let invalid = |reason| RegistryError::InvalidProfile {
            name: self.name.clone(),
            reason,
        };
        if self.extension.is_empty() || !self.extension.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(invalid("extension must be a non-empty alphanumeric token"));
        }
        if self.image.trim().is_empty() {
            return Err(invalid("image must not be empty"));
        }
        if !self.command.contains("%SOURCE%") {
            return Err(invalid("command must reference %SOURCE%"));
        }
        Ok(())
    }
}

impl From<&LanguageConfig> for LanguageProfile {
    fn from(config: &LanguageConfig) -> Self {
        Self {
            name: config.name.clone(),
            extension: config.extension.clone(),
            image: config.image.clone(),
            command: config.command.clone(),
        }
    }
}

/// Read-only lookup table from language name to profile
#[derive(Debug, Clone)]
pub struct LanguageRegistry {
    profiles: HashMap<String, Arc<LanguageProfile>>,
}

impl LanguageRegistry {
    /// The languages supported out of the box
    pub fn builtin() -> Self {
        Self {
            profiles: builtin_profiles()
                .into_iter()
                .map(|p| (p.name.clone(), Arc::new(p)))
                .collect(),
        }
    }

    /// Builds the table from the built-ins, with configured entries replacing
    /// built-ins of the same name or adding new languages
    pub fn from_configs(languages: &[LanguageConfig]) -> Result<Self, RegistryError> {
        let mut registry = Self::builtin();
        let mut seen = Vec::with_capacity(languages.len());

        for (index, language) in languages.iter().enumerate() {
            if language.name.trim().is_empty() {
                return Err(RegistryError::EmptyName { index });
            }
            if seen.contains(&language.name.as_str()) {
                return Err(RegistryError::Duplicate {
                    name: language.name.clone(),
                });
            }
            seen.push(language.name.as_str());

            let profile = LanguageProfile::from(language);
            profile.check()?;
            if registry.profiles.contains_key(&profile.name) {
                log::info!("Language {} overridden by configuration", profile.name);
            }
            registry
                .profiles
                .insert(profile.name.clone(), Arc::new(profile));
        }

        Ok(registry)
    }

    pub fn resolve(&self, name: &str) -> Result<Arc<LanguageProfile>, ValidationError> {
        self.profiles
            .get(name)
            .cloned()
            .ok_or_else(|| ValidationError::UnknownLanguage(name.to_string()))
    }

    /// All profiles, sorted by name
    pub fn list(&self) -> Vec<Arc<LanguageProfile>> {
        let mut profiles: Vec<_> = self.profiles.values().cloned().collect();
        profiles.sort_by(|a, b| a.name.cmp(&b.name));
        profiles
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }
}

fn builtin_profiles() -> Vec<LanguageProfile> {
    let profile = |name: &str, extension: &str, image: &str, command: &str| LanguageProfile {
        name: name.to_string(),
        extension: extension.to_string(),
        image: image.to_string(),
        command: command.to_string(),
    };

    vec![
        profile(
            "c_cpp",
            "cpp",
            "gcc:14",
            "g++ -O2 -std=c++17 -o main %SOURCE% && ./main < %INPUT% > %OUTPUT%",
        ),
        profile(
            "java",
            "java",
            "eclipse-temurin:21-jdk",
            "javac %SOURCE% && java -cp . Main < %INPUT% > %OUTPUT%",
        ),
        profile(
            "python",
            "py",
            "python:3.12-slim",
            "python3 %SOURCE% < %INPUT% > %OUTPUT%",
        ),
        profile(
            "javascript",
            "js",
            "node:20-slim",
            "node %SOURCE% < %INPUT% > %OUTPUT%",
        ),
    ]
}

/// Replaces every placeholder in the template with its mapped value
fn apply_template(template: &str, mapping: &[(&str, &str)]) -> String {
    mapping
        .iter()
        .fold(template.to_string(), |t, (k, v)| t.replace(k, v))
}
