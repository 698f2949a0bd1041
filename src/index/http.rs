use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use log::debug;
use reqwest::{Client, Url};
use serde::{Deserialize, Serialize};

use super::{Hit, Metadata, SimilarityIndex};

/// 通过 HTTP 访问的图片签名索引服务
#[derive(Debug, Clone)]
pub struct HttpSimilarityIndex {
    client: Client,
    base_url: Url,
    namespace: String,
}

#[derive(Serialize)]
struct SearchRequest<'a> {
    path: &'a str,
    distance_cutoff: f32,
}

#[derive(Deserialize)]
struct SearchResponse {
    #[serde(default)]
    hits: Vec<Hit>,
}

#[derive(Serialize)]
struct AddRequest<'a> {
    path: &'a str,
    metadata: &'a Metadata,
}

impl HttpSimilarityIndex {
    pub fn new(endpoint: &str, namespace: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build similarity index client")?;

        let mut base_url = Url::parse(endpoint).context("invalid similarity index URL")?;
        // 确保 join 时不会吞掉最后一级路径
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        let namespace = namespace.into();
        if namespace.is_empty() || namespace.contains('/') {
            return Err(anyhow!("无效的索引命名空间: {:?}", namespace));
        }

        Ok(Self { client, base_url, namespace })
    }

    fn url(&self, action: &str) -> Result<Url> {
        self.base_url
            .join(&format!("{}/{}", self.namespace, action))
            .context("failed to build similarity index URL")
    }
}

impl SimilarityIndex for HttpSimilarityIndex {
    async fn search_near_duplicates(
        &self,
        reference: &str,
        distance_threshold: f32,
    ) -> Result<Vec<Hit>> {
        let url = self.url("search")?;
        let body = SearchRequest { path: reference, distance_cutoff: distance_threshold };

        let response = self
            .client
            .post(url)
            .json(&body)
            .send()
            .await
            .context("similarity search request failed")?
            .error_for_status()
            .context("similarity search endpoint returned error status")?
            .json::<SearchResponse>()
            .await
            .context("failed to deserialize similarity search response")?;

        debug!("{} 的搜索结果数量: {}", reference, response.hits.len());
        Ok(response.hits)
    }

    async fn add(&self, reference: &str, metadata: &Metadata) -> Result<()> {
        let url = self.url("add")?;
        self.client
            .post(url)
            .json(&AddRequest { path: reference, metadata })
            .send()
            .await
            .context("similarity index add request failed")?
            .error_for_status()
            .context("similarity index add endpoint returned error status")?;
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        self.client
            .get(self.base_url.clone())
            .send()
            .await
            .context("similarity index health request failed")?
            .error_for_status()
            .context("similarity index health endpoint returned error status")?;
        Ok(())
    }
}
