use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use zeroize::Zeroizing;

use crate::crypto::secret_from_hex;

pub const DEFAULT_SLOT_NAME: &str = "token-slot-1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SlotKind {
    Ed25519,
    Xchacha20poly1305,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct SlotSettings {
    pub name: String,
    pub kind: SlotKind,
    /// Hex key material. Absent means a fresh key is generated at start-up.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub material_hex: Option<Zeroizing<String>>,
}

impl std::fmt::Debug for SlotSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotSettings")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("material_hex", &self.material_hex.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SoftTokenSettings {
    pub slots: Vec<SlotSettings>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewaySettings {
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub socket_path: Option<PathBuf>,
    pub soft_token: SoftTokenSettings,
}

fn default_log_filter() -> String {
    "info".into()
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            log_filter: default_log_filter(),
            socket_path: None,
            soft_token: SoftTokenSettings {
                slots: vec![SlotSettings {
                    name: DEFAULT_SLOT_NAME.into(),
                    kind: SlotKind::Ed25519,
                    material_hex: None,
                }],
            },
        }
    }
}

impl GatewaySettings {
    /// Reads settings from `path`, falling back to defaults when the file does
    /// not exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let data = std::fs::read(path)?;
        let settings: GatewaySettings = serde_json::from_slice(&data)
            .map_err(|e| anyhow!("settings {}: {e}", path.display()))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        self.validate()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let data = serde_json::to_vec_pretty(self)?;
        std::fs::write(path, data)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.soft_token.slots.is_empty() {
            anyhow::bail!("soft token needs at least one slot");
        }
        let mut seen = HashSet::new();
        for slot in &self.soft_token.slots {
            if slot.name.trim().is_empty() {
                anyhow::bail!("slot names must not be empty");
            }
            if !seen.insert(slot.name.as_str()) {
                anyhow::bail!("duplicate slot name '{}'", slot.name);
            }
            if let Some(material) = &slot.material_hex {
                secret_from_hex(material).map_err(|e| anyhow!("slot '{}': {e}", slot.name))?;
            }
        }
        Ok(())
    }
}
