use serde::{Deserialize, Serialize};
use std::fmt;

/// Assurance grade of a device model.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum Grade {
    Dangerous,
    #[default]
    Signed,
    Secured,
}

impl fmt::Display for Grade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Grade::Dangerous => "dangerous",
            Grade::Signed => "signed",
            Grade::Secured => "secured",
        };
        f.write_str(s)
    }
}

/// Identity of a device model as used for sealing.
///
/// Two models are the same for sealing purposes only if every field
/// matches, including the signing key.
#[derive(
    Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct SealingModel {
    #[serde(rename = "brand-id")]
    pub brand_id: String,
    pub model: String,
    pub grade: Grade,
    #[serde(rename = "sign-key-id")]
    pub sign_key_id: String,
    #[serde(default)]
    pub series: String,
    #[serde(default)]
    pub classic: bool,
}

impl SealingModel {
    /// Unique identifier used to group sealing parameters by model.
    pub fn unique_id(&self) -> String {
        format!(
            "{}/{},{},{}",
            self.brand_id, self.model, self.grade, self.sign_key_id
        )
    }
}

impl fmt::Display for SealingModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.brand_id, self.model)
    }
}
