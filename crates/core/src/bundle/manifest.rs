use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// `manifest.json` at the root of every bundle artifact
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleManifest {
    pub name: String,
    pub version: String,
    /// Path of the entry file, relative to the bundle root
    pub entry: String,
    /// Host capabilities the handler may use (`fs`, `network`, `process`)
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl BundleManifest {
    pub fn allows(&self, capability: &str) -> bool {
        self.capabilities.iter().any(|c| c == capability)
    }
}

/// Parsed `bundle:<slug>@<version>[#<export>]` entry-point binding
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleBinding {
    pub slug: String,
    pub version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub export: Option<String>,
}

impl BundleBinding {
    pub const PREFIX: &'static str = "bundle:";

    pub fn is_binding(entry_point: &str) -> bool {
        entry_point.starts_with(Self::PREFIX)
    }

    pub fn parse(entry_point: &str) -> Result<Self> {
        let rest = entry_point.strip_prefix(Self::PREFIX).ok_or_else(|| {
            Error::validation(format!("'{entry_point}' is not a bundle entry point"))
        })?;

        let (spec, export) = match rest.split_once('#') {
            Some((spec, export)) if !export.is_empty() => (spec, Some(export.to_string())),
            Some((spec, _)) => (spec, None),
            None => (rest, None),
        };

        let (slug, version) = spec.split_once('@').ok_or_else(|| {
            Error::validation(format!(
                "bundle binding '{entry_point}' must take the form bundle:<slug>@<version>"
            ))
        })?;
        if slug.is_empty() {
            return Err(Error::validation(format!(
                "bundle binding '{entry_point}' has an empty slug"
            )));
        }
        let version: u32 = version.parse().map_err(|_| {
            Error::validation(format!(
                "bundle binding '{entry_point}' has a non-numeric version"
            ))
        })?;

        Ok(Self {
            slug: slug.to_string(),
            version,
            export,
        })
    }
}

impl std::fmt::Display for BundleBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "bundle:{}@{}", self.slug, self.version)?;
        if let Some(export) = &self.export {
            write!(f, "#{export}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_binding_with_export() {
        let binding = BundleBinding::parse("bundle:reporting@4#renderDaily").unwrap();
        assert_eq!(binding.slug, "reporting");
        assert_eq!(binding.version, 4);
        assert_eq!(binding.export.as_deref(), Some("renderDaily"));
        assert_eq!(binding.to_string(), "bundle:reporting@4#renderDaily");
    }

    #[test]
    fn parses_binding_without_export() {
        let binding = BundleBinding::parse("bundle:reporting@1").unwrap();
        assert_eq!(binding.export, None);
    }

    #[test]
    fn rejects_malformed_bindings() {
        assert!(BundleBinding::parse("reporting@1").is_err());
        assert!(BundleBinding::parse("bundle:reporting").is_err());
        assert!(BundleBinding::parse("bundle:@1").is_err());
        assert!(BundleBinding::parse("bundle:reporting@latest").is_err());
    }
}
