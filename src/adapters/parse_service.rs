use anyhow::Result;
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tracing::debug;

use crate::core::{ChangedFile, DiffBlock, DiffSource, FetchError, ParsedDiff};

/// Diff source backed by a remote parse endpoint.
///
/// The endpoint receives `{ patch, filename, previousFilename?, contentHash? }`
/// and answers `{ hunks: [...] }` or `{ error }`.
pub struct HttpDiffSource {
    client: Client,
    endpoint: String,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ParseResponse {
    Parsed { hunks: Vec<DiffBlock> },
    Failed { error: String },
}

impl HttpDiffSource {
    pub fn new(endpoint: impl Into<String>, timeout_secs: u64) -> Result<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(timeout_secs))
            .build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }
}

#[async_trait]
impl DiffSource for HttpDiffSource {
    async fn load(&self, file: &ChangedFile) -> Result<ParsedDiff, FetchError> {
        let request = file.to_request();
        debug!("Requesting remote parse of {}", file.filename);

        let response = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await
            .map_err(|e| FetchError::Source(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(FetchError::Source(format!(
                "parse service returned {}: {}",
                status, error_text
            )));
        }

        let parsed: ParseResponse = response
            .json()
            .await
            .map_err(|e| FetchError::Source(format!("unreadable parse response: {}", e)))?;

        match parsed {
            ParseResponse::Parsed { hunks } => Ok(ParsedDiff {
                filename: request.filename,
                previous_filename: request.previous_filename,
                content_hash: request.content_hash,
                blocks: hunks,
            }),
            ParseResponse::Failed { error } => Err(FetchError::Source(error)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::diff_parser::SkipBlock;
    use crate::core::{DiffService, PrefetchConfig};
    use mockito::Matcher;
    use serde_json::json;
    use std::sync::Arc;

    fn changed_file() -> ChangedFile {
        ChangedFile {
            filename: "src/lib.rs".to_string(),
            sha: Some(crate::core::ContentHash::new("0a1b2c")),
            patch: Some("@@ -10,1 +10,1 @@\n-a\n+b".to_string()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_remote_parse_is_cached_by_content_hash() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/parse")
            .match_body(Matcher::PartialJson(json!({
                "filename": "src/lib.rs",
                "contentHash": "0a1b2c"
            })))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                json!({"hunks": [
                    {"type": "skip", "old_start": 1, "new_start": 1, "count": 9, "label": "9 unchanged lines"}
                ]})
                .to_string(),
            )
            .expect(1)
            .create_async()
            .await;

        let source = HttpDiffSource::new(format!("{}/parse", server.url()), 5).unwrap();
        let service = DiffService::new(Arc::new(source), 10, PrefetchConfig::default());

        let first = service.request(&changed_file()).await.unwrap();
        let second = service.request(&changed_file()).await.unwrap();
        mock.assert_async().await;

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.filename, "src/lib.rs");
        assert_eq!(
            first.blocks,
            vec![DiffBlock::Skip(SkipBlock {
                old_start: 1,
                new_start: 1,
                count: 9,
                label: "9 unchanged lines".to_string()
            })]
        );
    }

    #[tokio::test]
    async fn test_error_indicator_becomes_fetch_error() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/parse")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"error": "patch too large"}"#)
            .create_async()
            .await;

        let source = HttpDiffSource::new(format!("{}/parse", server.url()), 5).unwrap();
        let err = source.load(&changed_file()).await.unwrap_err();
        assert_eq!(err, FetchError::Source("patch too large".to_string()));
    }

    #[tokio::test]
    async fn test_server_error_becomes_fetch_error() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/parse")
            .with_status(503)
            .create_async()
            .await;

        let source = HttpDiffSource::new(format!("{}/parse", server.url()), 5).unwrap();
        let err = source.load(&changed_file()).await.unwrap_err();
        assert!(matches!(err, FetchError::Source(message) if message.contains("503")));
    }
}
