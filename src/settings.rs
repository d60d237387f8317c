use crate::config::Endpoints;
use reqwest::Url;
use serde::Deserialize;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigUpdate {
    pub model_service_url: Option<String>,
    pub node_exporter_url: Option<String>,
    pub node_name: Option<String>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SettingsError {
    #[error("nodeName must not be empty")]
    MissingNodeName,
    #[error("modelServiceUrl must not be empty")]
    MissingModelServiceUrl,
    #[error("modelServiceUrl is not a valid URL")]
    InvalidModelServiceUrl,
    #[error("nodeExporterUrl is not a valid URL")]
    InvalidNodeExporterUrl,
}

#[derive(Clone)]
pub struct SettingsStore {
    inner: Arc<RwLock<Endpoints>>,
}

impl SettingsStore {
    pub fn new(initial: Endpoints) -> Self {
        Self {
            inner: Arc::new(RwLock::new(initial)),
        }
    }

    pub async fn current(&self) -> Endpoints {
        self.inner.read().await.clone()
    }

    pub async fn update(&self, update: ConfigUpdate) -> Result<Endpoints, SettingsError> {
        let node_name = non_blank(update.node_name.as_deref()).ok_or(SettingsError::MissingNodeName)?;
        let model_service_url = non_blank(update.model_service_url.as_deref())
            .ok_or(SettingsError::MissingModelServiceUrl)?;
        if Url::parse(model_service_url).is_err() {
            return Err(SettingsError::InvalidModelServiceUrl);
        }
        let node_exporter_url = non_blank(update.node_exporter_url.as_deref());
        if let Some(url) = node_exporter_url {
            if Url::parse(url).is_err() {
                return Err(SettingsError::InvalidNodeExporterUrl);
            }
        }

        let mut guard = self.inner.write().await;
        guard.node_name = node_name.to_string();
        guard.model_service_url = model_service_url.to_string();
        if let Some(url) = node_exporter_url {
            guard.node_exporter_url = url.to_string();
        }
        Ok(guard.clone())
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn update(model: &str, exporter: Option<&str>, node: &str) -> ConfigUpdate {
        ConfigUpdate {
            model_service_url: Some(model.to_string()),
            node_exporter_url: exporter.map(str::to_string),
            node_name: Some(node.to_string()),
        }
    }

    #[tokio::test]
    async fn stores_trimmed_values() {
        let store = SettingsStore::new(Endpoints::default());
        let saved = store
            .update(update(
                " http://10.0.0.5:19000 ",
                Some("http://10.0.0.5:9100\n"),
                " hw002 ",
            ))
            .await
            .unwrap();
        assert_eq!(saved.model_service_url, "http://10.0.0.5:19000");
        assert_eq!(saved.node_exporter_url, "http://10.0.0.5:9100");
        assert_eq!(saved.node_name, "hw002");
        assert_eq!(store.current().await, saved);
    }

    #[tokio::test]
    async fn blank_exporter_keeps_previous_value() {
        let store = SettingsStore::new(Endpoints::default());
        let saved = store
            .update(update("http://model:19000", Some("  "), "n1"))
            .await
            .unwrap();
        assert_eq!(saved.node_exporter_url, Endpoints::default().node_exporter_url);
        assert_eq!(saved.api_base_url, Endpoints::default().api_base_url);
    }

    #[tokio::test]
    async fn rejects_invalid_input_without_changing_anything() {
        let store = SettingsStore::new(Endpoints::default());

        let err = store.update(update("http://m", None, " ")).await.unwrap_err();
        assert_eq!(err, SettingsError::MissingNodeName);

        let err = store.update(update("", None, "n1")).await.unwrap_err();
        assert_eq!(err, SettingsError::MissingModelServiceUrl);

        let err = store.update(update("not a url", None, "n1")).await.unwrap_err();
        assert_eq!(err, SettingsError::InvalidModelServiceUrl);

        let err = store
            .update(update("http://m", Some("::bad::"), "n1"))
            .await
            .unwrap_err();
        assert_eq!(err, SettingsError::InvalidNodeExporterUrl);

        assert_eq!(store.current().await, Endpoints::default());
    }
}
