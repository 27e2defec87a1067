use serde::{Deserialize, Serialize};

use crate::manifest::ManifestId;

/// A composable selection of installable content.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub id: String,
    pub name: String,
    /// Primary content reference, usually a client manifest.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary: Option<ManifestId>,
    #[serde(default)]
    pub enabled: Vec<ManifestId>,
}

/// Partial profile update: only fields being rewritten are specified.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ProfileChanges {
    /// `Some(None)` clears the primary reference.
    pub primary: Option<Option<ManifestId>>,
    pub enabled: Option<Vec<ManifestId>>,
}

impl ProfileChanges {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.primary.is_none() && self.enabled.is_none()
    }

    #[must_use]
    pub fn set_primary(mut self, primary: Option<ManifestId>) -> Self {
        self.primary = Some(primary);
        self
    }

    #[must_use]
    pub fn set_enabled(mut self, enabled: Vec<ManifestId>) -> Self {
        self.enabled = Some(enabled);
        self
    }

    pub fn apply_to(&self, profile: &mut Profile) {
        if let Some(primary) = &self.primary {
            profile.primary = primary.clone();
        }
        if let Some(enabled) = &self.enabled {
            profile.enabled = enabled.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    #[test]
    fn changes_only_touch_specified_fields() -> Result<()> {
        let primary = ManifestId::parse("v1:1.0.0:acme:client:base")?;
        let kept = ManifestId::parse("v1:1.0.0:acme:mod:kept")?;
        let mut profile = Profile {
            id: "p1".into(),
            name: "Main".into(),
            primary: Some(primary.clone()),
            enabled: vec![kept.clone()],
        };

        ProfileChanges::default()
            .set_enabled(vec![])
            .apply_to(&mut profile);
        assert_eq!(profile.primary, Some(primary));
        assert!(profile.enabled.is_empty());

        ProfileChanges::default()
            .set_primary(None)
            .apply_to(&mut profile);
        assert_eq!(profile.primary, None);
        Ok(())
    }

    #[test]
    fn empty_changes_are_detectable() {
        assert!(ProfileChanges::default().is_empty());
        assert!(!ProfileChanges::default().set_enabled(vec![]).is_empty());
    }
}
