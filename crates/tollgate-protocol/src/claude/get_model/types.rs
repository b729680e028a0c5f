use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::claude::list_models::types::ModelType;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    pub display_name: String,
    /// Always "model" for this API.
    #[serde(rename = "type")]
    pub r#type: ModelType,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_model_info() {
        let json = r#"{
            "id": "claude-3-opus-20240229",
            "created_at": "2024-02-29T00:00:00Z",
            "display_name": "Claude 3 Opus",
            "type": "model"
        }"#;
        let parsed: ModelInfo = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.id, "claude-3-opus-20240229");
        assert_eq!(parsed.r#type, ModelType::Model);
    }
}
