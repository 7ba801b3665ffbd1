use serde::{Deserialize, Serialize};

/// Error body returned by the activity, conversation and flag services.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiError {
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tracking_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<ApiErrorDetail>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiErrorDetail {
    pub description: String,
}

impl ApiError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            tracking_id: None,
            errors: Vec::new(),
        }
    }

    /// Best human readable description: the first detail entry when the top
    /// level message is empty.
    pub fn description(&self) -> &str {
        if !self.message.is_empty() {
            return &self.message;
        }
        self.errors
            .first()
            .map(|detail| detail.description.as_str())
            .unwrap_or("unknown service error")
    }
}
