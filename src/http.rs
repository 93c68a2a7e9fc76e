//! HTTP Fetcher collaborator (spec.md §2 item C, §6).

use async_trait::async_trait;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct FetchResult {
    pub success: bool,
    pub body: String,
    pub error_message: Option<String>,
}

#[async_trait]
pub trait HttpFetcher: Send + Sync {
    async fn get(&self, url: &str) -> FetchResult;
}

pub struct ReqwestFetcher {
    client: reqwest::Client,
}

impl ReqwestFetcher {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(30))
                .build()
                .expect("reqwest client configuration is static and always valid"),
        }
    }
}

impl Default for ReqwestFetcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HttpFetcher for ReqwestFetcher {
    async fn get(&self, url: &str) -> FetchResult {
        match self.client.get(url).send().await {
            Ok(resp) if resp.status().is_success() => match resp.text().await {
                Ok(body) => FetchResult { success: true, body, error_message: None },
                Err(e) => {
                    warn!(url, error = %e, "failed to read response body");
                    FetchResult { success: false, body: String::new(), error_message: Some(e.to_string()) }
                }
            },
            Ok(resp) => {
                let status = resp.status();
                FetchResult {
                    success: false,
                    body: String::new(),
                    error_message: Some(format!("HTTP status {status}")),
                }
            }
            Err(e) => {
                warn!(url, error = %e, "HTTP fetch failed");
                FetchResult { success: false, body: String::new(), error_message: Some(e.to_string()) }
            }
        }
    }
}

#[cfg(test)]
pub mod test_support {
    use super::*;
    use std::collections::HashMap;
    use tokio::sync::Mutex;

    /// Canned-response fetcher keyed by URL, for monitor tests.
    pub struct MockFetcher {
        responses: Mutex<HashMap<String, FetchResult>>,
    }

    impl Default for MockFetcher {
        fn default() -> Self {
            Self::new()
        }
    }

    impl MockFetcher {
        pub fn new() -> Self {
            Self { responses: Mutex::new(HashMap::new()) }
        }

        pub async fn set(&self, url: &str, result: FetchResult) {
            self.responses.lock().await.insert(url.to_string(), result);
        }
    }

    #[async_trait]
    impl HttpFetcher for MockFetcher {
        async fn get(&self, url: &str) -> FetchResult {
            self.responses.lock().await.get(url).cloned().unwrap_or(FetchResult {
                success: false,
                body: String::new(),
                error_message: Some("no mocked response".to_string()),
            })
        }
    }
}
