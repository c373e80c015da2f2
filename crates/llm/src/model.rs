use serde::{Deserialize, Serialize};

const BYTES_PER_GIB: f64 = 1024.0 * 1024.0 * 1024.0;

/// An installed model as the backend's `/api/tags` lists it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Model {
    pub name: String,
    #[serde(rename = "size", default, skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
}

impl Model {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            size_bytes: None,
        }
    }

    pub fn with_size(mut self, size_bytes: u64) -> Self {
        self.size_bytes = Some(size_bytes);
        self
    }

    /// Size in GiB with one decimal, e.g. `3.8GB`.
    pub fn size_label(&self) -> Option<String> {
        self.size_bytes
            .map(|bytes| format!("{:.1}GB", bytes as f64 / BYTES_PER_GIB))
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct ModelListPayload {
    #[serde(default)]
    pub(crate) models: Vec<Model>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_label_uses_gibibytes() {
        let model = Model::new("llama2").with_size(3_826_793_677);
        assert_eq!(model.size_label().as_deref(), Some("3.6GB"));
        assert_eq!(Model::new("bare").size_label(), None);
    }

    #[test]
    fn tags_payload_ignores_unknown_fields() {
        let payload: ModelListPayload = serde_json::from_str(
            r#"{"models":[{"name":"llama2:latest","size":3826793677,"digest":"abc"},{"name":"tiny"}]}"#,
        )
        .unwrap();
        assert_eq!(payload.models.len(), 2);
        assert_eq!(payload.models[0].size_bytes, Some(3_826_793_677));
        assert_eq!(payload.models[1].size_bytes, None);
    }
}
