//! Blob storage for article images.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header;
use reqwest::{Client, Url};
use serde_json::json;
use tracing::debug;

use crate::application::repos::{AssetStorage, ImageTransform, RepoError};

use super::error::InfraError;

/// Storage API of the hosted backend, scoped to one public bucket.
pub struct RestAssetStorage {
    client: Client,
    storage_base: Url,
    bucket: String,
    service_key: String,
}

impl RestAssetStorage {
    pub fn new(
        base_url: &Url,
        bucket: impl Into<String>,
        service_key: impl Into<String>,
        request_timeout: Duration,
    ) -> Result<Self, InfraError> {
        let client = Client::builder()
            .user_agent(concat!("paddock/", env!("CARGO_PKG_VERSION")))
            .timeout(request_timeout)
            .build()
            .map_err(InfraError::HttpClient)?;
        let storage_base = base_url
            .join("storage/v1/")
            .map_err(|err| InfraError::endpoint("storage", err.to_string()))?;
        Ok(Self {
            client,
            storage_base,
            bucket: bucket.into(),
            service_key: service_key.into(),
        })
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }
}

#[async_trait]
impl AssetStorage for RestAssetStorage {
    async fn remove(&self, path: &str) -> Result<(), RepoError> {
        let url = self
            .storage_base
            .join(&format!("object/{}", self.bucket))
            .map_err(RepoError::transport)?;
        let response = self
            .client
            .delete(url)
            .header("apikey", self.service_key.as_str())
            .header(header::AUTHORIZATION, format!("Bearer {}", self.service_key))
            .json(&json!({ "prefixes": [path] }))
            .send()
            .await
            .map_err(RepoError::transport)?;

        let status = response.status();
        if status.is_success() {
            debug!(bucket = %self.bucket, path, "Removed stored asset");
            return Ok(());
        }
        let message = response.text().await.unwrap_or_default();
        Err(RepoError::Status {
            status: status.as_u16(),
            code: None,
            message,
        })
    }

    fn public_url(&self, path: &str, transform: &ImageTransform) -> String {
        let path = path.trim_start_matches('/');
        let mut url = self.storage_base.clone();
        // Path segments are pushed one by one so each is percent-encoded.
        if let Ok(mut segments) = url.path_segments_mut() {
            segments
                .pop_if_empty()
                .extend(["render", "image", "public", self.bucket.as_str()])
                .extend(path.split('/'));
        }
        url.query_pairs_mut()
            .append_pair("width", &transform.width.to_string())
            .append_pair("quality", &transform.quality.to_string())
            .append_pair("resize", "contain");
        url.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn storage() -> RestAssetStorage {
        let base = Url::parse("https://project.example.co/").expect("url");
        RestAssetStorage::new(&base, "post-images", "service", Duration::from_secs(5))
            .expect("storage")
    }

    #[test]
    fn public_url_renders_through_the_transform_endpoint() {
        let url = storage().public_url("2024/monaco grid.jpg", &ImageTransform::default());
        assert_eq!(
            url,
            "https://project.example.co/storage/v1/render/image/public/post-images/2024/monaco%20grid.jpg?width=1200&quality=75&resize=contain"
        );
    }

    #[test]
    fn leading_slash_is_ignored() {
        let storage = storage();
        let transform = ImageTransform {
            width: 640,
            quality: 60,
        };
        assert_eq!(
            storage.public_url("/a.png", &transform),
            storage.public_url("a.png", &transform)
        );
    }
}
