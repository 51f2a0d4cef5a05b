//! Code package download and configuration extraction

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use stride_cluster::{SettingsSection, WrpConfig};
use stride_common::{CodeVersion, Error, Result};
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

/// File name of the baseline package inside the repository
pub const BASELINE_PACKAGE: &str = "baseline.json";

/// Configuration embedded in a release package
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PackageConfiguration {
    /// Admin configuration version
    pub version: String,
    /// Settings shipped with the package
    #[serde(default)]
    pub settings: Vec<SettingsSection>,
}

/// A release package as stored in the repository
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ReleasePackage {
    /// Code version contained in the package
    pub version: CodeVersion,
    /// Embedded configuration
    #[serde(default)]
    pub configuration: PackageConfiguration,
}

impl ReleasePackage {
    /// Admin configuration carried by this package
    pub fn to_wrp_config(&self) -> WrpConfig {
        WrpConfig {
            version: self.configuration.version.clone(),
            code_version: self.version.clone(),
            is_user_initiated: false,
            settings: self.configuration.settings.clone(),
        }
    }
}

/// Trait abstracting where code packages come from
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PackageStore: Send + Sync {
    /// Fetch the package for `code_version` to a local path
    ///
    /// A package already downloaded for the same version is reused when no
    /// location is given.
    ///
    /// # Arguments
    ///
    /// * `code_version` - Version to fetch
    /// * `location` - Published location; the local repository when `None`
    async fn download(&self, code_version: &CodeVersion, location: Option<String>)
        -> Result<PathBuf>;

    /// Read the admin configuration embedded in a downloaded package
    async fn extract_configuration(&self, package_path: &Path) -> Result<WrpConfig>;

    /// Version of the package the cluster was first deployed from
    async fn baseline_version(&self) -> Result<CodeVersion>;

    /// Delete a downloaded package
    async fn remove_local(&self, package_path: &Path) -> Result<()>;
}

/// Package store backed by a local repository directory and HTTP downloads
pub struct FilePackageStore {
    http: reqwest::Client,
    repository: PathBuf,
    download_dir: PathBuf,
}

impl FilePackageStore {
    /// Store reading `<repository>/<version>.json` and downloading into `download_dir`
    pub fn new(repository: impl Into<PathBuf>, download_dir: impl Into<PathBuf>) -> Result<Self> {
        let download_dir = download_dir.into();
        std::fs::create_dir_all(&download_dir)?;
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(300))
            .build()
            .map_err(|e| Error::internal(format!("failed to create HTTP client: {}", e)))?;
        Ok(Self {
            http,
            repository: repository.into(),
            download_dir,
        })
    }

    fn package_file(&self, code_version: &CodeVersion) -> String {
        format!("{}.json", code_version)
    }

    async fn read_package(&self, path: &Path) -> Result<ReleasePackage> {
        let body = tokio::fs::read_to_string(path).await.map_err(|e| {
            Error::package(path.display().to_string(), format!("failed to read package: {}", e))
        })?;
        serde_json::from_str(&body).map_err(|e| {
            Error::package(path.display().to_string(), format!("malformed package: {}", e))
        })
    }
}

#[async_trait]
impl PackageStore for FilePackageStore {
    async fn download(
        &self,
        code_version: &CodeVersion,
        location: Option<String>,
    ) -> Result<PathBuf> {
        let destination = self.download_dir.join(self.package_file(code_version));
        let version = code_version.to_string();

        match location.as_deref() {
            None if tokio::fs::try_exists(&destination).await.unwrap_or(false) => {
                debug!(version = %version, "reusing downloaded package");
            }
            Some(url) if url.starts_with("http://") || url.starts_with("https://") => {
                debug!(url = %url, version = %version, "downloading package");
                let body = self
                    .http
                    .get(url)
                    .send()
                    .await
                    .and_then(|r| r.error_for_status())
                    .map_err(|e| Error::package(&version, format!("download failed: {}", e)))?
                    .bytes()
                    .await
                    .map_err(|e| Error::package(&version, format!("download failed: {}", e)))?;
                tokio::fs::write(&destination, &body).await?;
            }
            other => {
                let source = match other {
                    Some(path) => PathBuf::from(path.strip_prefix("file://").unwrap_or(path)),
                    None => self.repository.join(self.package_file(code_version)),
                };
                tokio::fs::copy(&source, &destination).await.map_err(|e| {
                    Error::package(
                        &version,
                        format!("failed to copy {}: {}", source.display(), e),
                    )
                })?;
            }
        }

        let package = self.read_package(&destination).await?;
        if package.version != *code_version {
            return Err(Error::package(
                &version,
                format!("package contains version {}", package.version),
            ));
        }
        info!(version = %version, path = %destination.display(), "package downloaded");
        Ok(destination)
    }

    async fn extract_configuration(&self, package_path: &Path) -> Result<WrpConfig> {
        Ok(self.read_package(package_path).await?.to_wrp_config())
    }

    async fn baseline_version(&self) -> Result<CodeVersion> {
        let path = self.repository.join(BASELINE_PACKAGE);
        Ok(self.read_package(&path).await?.version)
    }

    async fn remove_local(&self, package_path: &Path) -> Result<()> {
        tokio::fs::remove_file(package_path).await?;
        Ok(())
    }
}
