//! Fetching the goal-state manifest

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use stride_common::{Error, Result};
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use crate::package::GoalStateModel;

/// Trait abstracting where the goal-state manifest comes from
#[cfg_attr(test, automock)]
#[async_trait]
pub trait GoalStateSource: Send + Sync {
    /// Fetch and parse the current manifest
    ///
    /// Unreachable locations, empty documents and malformed documents are
    /// all [`Error::GoalState`].
    async fn fetch(&self) -> Result<GoalStateModel>;
}

enum Location {
    Http(String),
    File(PathBuf),
}

/// Fetches the manifest over HTTP(S) or from a local file
pub struct HttpGoalStateClient {
    http: reqwest::Client,
    location: Location,
}

impl HttpGoalStateClient {
    /// Client for `uri`: `http://`, `https://`, `file://` or a plain path
    pub fn new(uri: &str) -> Result<Self> {
        let location = if uri.starts_with("http://") || uri.starts_with("https://") {
            Location::Http(uri.to_string())
        } else if let Some(path) = uri.strip_prefix("file://") {
            Location::File(PathBuf::from(path))
        } else if uri.contains("://") || uri.trim().is_empty() {
            return Err(Error::goal_state(format!("unsupported goal state uri '{}'", uri)));
        } else {
            Location::File(PathBuf::from(uri))
        };

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| Error::goal_state(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self { http, location })
    }
}

#[async_trait]
impl GoalStateSource for HttpGoalStateClient {
    async fn fetch(&self) -> Result<GoalStateModel> {
        let body = match &self.location {
            Location::Http(url) => {
                debug!(url = %url, "fetching goal state");
                self.http
                    .get(url)
                    .send()
                    .await
                    .and_then(|r| r.error_for_status())
                    .map_err(|e| Error::goal_state(format!("failed to fetch {}: {}", url, e)))?
                    .text()
                    .await
                    .map_err(|e| Error::goal_state(format!("failed to read {}: {}", url, e)))?
            }
            Location::File(path) => {
                debug!(path = %path.display(), "reading goal state");
                tokio::fs::read_to_string(path).await.map_err(|e| {
                    Error::goal_state(format!("failed to read {}: {}", path.display(), e))
                })?
            }
        };
        GoalStateModel::parse(&body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn reads_manifest_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"Packages": [{{"Version": "6.0", "MinVersion": "5.0"}}]}}"#).unwrap();

        let uri = format!("file://{}", file.path().display());
        let model = HttpGoalStateClient::new(&uri).unwrap().fetch().await.unwrap();
        assert_eq!(model.packages[0].version.to_string(), "6.0");
    }

    #[tokio::test]
    async fn empty_file_is_an_error() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let client = HttpGoalStateClient::new(&file.path().display().to_string()).unwrap();
        assert!(matches!(client.fetch().await, Err(Error::GoalState { .. })));
    }

    #[tokio::test]
    async fn missing_file_is_an_error() {
        let client = HttpGoalStateClient::new("/nonexistent/stride/goal.json").unwrap();
        let err = client.fetch().await.unwrap_err();
        assert!(err.to_string().contains("failed to read"));
    }

    #[test]
    fn rejects_unsupported_schemes() {
        assert!(HttpGoalStateClient::new("ftp://example.test/goal.json").is_err());
        assert!(HttpGoalStateClient::new("").is_err());
    }

    #[tokio::test]
    async fn mock_source_feeds_selection() {
        let mut source = MockGoalStateSource::new();
        source.expect_fetch().returning(|| {
            Ok(GoalStateModel::parse(r#"{"Packages": [{"Version": "6.0", "MinVersion": "5.0"}]}"#)?)
        });
        let model = source.fetch().await.unwrap();
        let selection = crate::select_target(&"5.0".parse().unwrap(), &model);
        assert_eq!(selection.target.to_string(), "6.0");
    }
}
