//! Read-only collaborators: learner progress and subscription tier.

use std::time::Duration;

use crate::config::{DirectoryConfig, MentoraConfig, QuotaConfig};
use crate::error::{MentoraError, Result};
use crate::model::{ProgressSnapshot, SubscriptionQuota};
use crate::retry::RetryPolicy;

pub trait Directory: Send + Sync {
    fn progress(
        &self,
        user_id: &str,
    ) -> impl std::future::Future<Output = Result<ProgressSnapshot>> + Send;

    fn subscription_quota(
        &self,
        user_id: &str,
    ) -> impl std::future::Future<Output = Result<SubscriptionQuota>> + Send;
}

/// Tier assignments and progress taken straight from configuration. Unknown
/// users get the default tier and an empty progress snapshot.
#[derive(Debug, Clone)]
pub struct StaticDirectory {
    directory: DirectoryConfig,
    quota: QuotaConfig,
}

impl StaticDirectory {
    pub fn new(directory: DirectoryConfig, quota: QuotaConfig) -> Self {
        Self { directory, quota }
    }

    pub fn tier_of(&self, user_id: &str) -> &str {
        self.directory
            .users
            .get(user_id)
            .and_then(|u| u.tier.as_deref())
            .unwrap_or(&self.quota.default_tier)
    }
}

impl Directory for StaticDirectory {
    async fn progress(&self, user_id: &str) -> Result<ProgressSnapshot> {
        Ok(self
            .directory
            .users
            .get(user_id)
            .map(|u| u.progress.clone())
            .unwrap_or_default())
    }

    async fn subscription_quota(&self, user_id: &str) -> Result<SubscriptionQuota> {
        let tier = self.tier_of(user_id);
        Ok(SubscriptionQuota {
            daily_limit: self.quota.limit_for_tier(tier),
        })
    }
}

/// Fetches from the analytics and billing services over HTTP:
/// `GET {base_url}/users/{user}/progress` and
/// `GET {base_url}/users/{user}/subscription`. The user id is always sent
/// as a single percent-encoded path segment.
#[derive(Debug, Clone)]
pub struct HttpDirectory {
    base_url: reqwest::Url,
    api_key: Option<String>,
    client: reqwest::Client,
    retry: RetryPolicy,
}

impl HttpDirectory {
    pub fn from_config(config: &DirectoryConfig) -> Result<Self> {
        let raw = config
            .base_url
            .as_deref()
            .ok_or_else(|| MentoraError::Config("directory.base_url is required for http mode".into()))?;
        let base_url = reqwest::Url::parse(raw)
            .map_err(|e| MentoraError::Config(format!("invalid directory.base_url {raw:?}: {e}")))?;
        if base_url.cannot_be_a_base() {
            return Err(MentoraError::Config(format!(
                "directory.base_url {raw:?} cannot carry a path"
            )));
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            base_url,
            api_key: config.api_key.clone(),
            client,
            retry: RetryPolicy::with_retries(config.retries),
        })
    }

    /// `{base_url}/users/{user_id}/{resource}`. Dot segments would be
    /// normalized away by the server, so they are refused outright.
    fn user_url(&self, user_id: &str, resource: &str) -> Result<reqwest::Url> {
        if user_id.is_empty() || user_id == "." || user_id == ".." {
            return Err(MentoraError::InvalidInput(format!("invalid user id: {user_id:?}")));
        }
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| MentoraError::Config("directory.base_url cannot carry a path".into()))?
            .pop_if_empty()
            .push("users")
            .push(user_id)
            .push(resource);
        Ok(url)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &reqwest::Url) -> Result<T> {
        let mut req = self.client.get(url.clone());
        if let Some(ref key) = self.api_key {
            req = req.bearer_auth(key);
        }
        let resp = req.send().await?;
        let status = resp.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(MentoraError::NotFound(url.to_string()));
        }
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(MentoraError::Storage(format!("directory error {status}: {text}")));
        }
        Ok(resp.json().await?)
    }
}

impl Directory for HttpDirectory {
    async fn progress(&self, user_id: &str) -> Result<ProgressSnapshot> {
        let url = self.user_url(user_id, "progress")?;
        self.retry.run("progress lookup", || self.get_json(&url)).await
    }

    async fn subscription_quota(&self, user_id: &str) -> Result<SubscriptionQuota> {
        let url = self.user_url(user_id, "subscription")?;
        self.retry
            .run("subscription lookup", || self.get_json(&url))
            .await
    }
}

/// Enum dispatch over the directory implementations.
#[derive(Debug, Clone)]
pub enum UserDirectory {
    Static(StaticDirectory),
    Http(HttpDirectory),
}

impl Directory for UserDirectory {
    async fn progress(&self, user_id: &str) -> Result<ProgressSnapshot> {
        match self {
            UserDirectory::Static(d) => d.progress(user_id).await,
            UserDirectory::Http(d) => d.progress(user_id).await,
        }
    }

    async fn subscription_quota(&self, user_id: &str) -> Result<SubscriptionQuota> {
        match self {
            UserDirectory::Static(d) => d.subscription_quota(user_id).await,
            UserDirectory::Http(d) => d.subscription_quota(user_id).await,
        }
    }
}

impl UserDirectory {
    pub fn mode(&self) -> &'static str {
        match self {
            UserDirectory::Static(_) => "static",
            UserDirectory::Http(_) => "http",
        }
    }
}

pub fn create_directory(config: &MentoraConfig) -> Result<UserDirectory> {
    match config.directory.mode.as_str() {
        "static" => Ok(UserDirectory::Static(StaticDirectory::new(
            config.directory.clone(),
            config.quota.clone(),
        ))),
        "http" => Ok(UserDirectory::Http(HttpDirectory::from_config(
            &config.directory,
        )?)),
        other => Err(MentoraError::Config(format!(
            "unknown directory mode: {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DirectoryUser;

    fn directory() -> StaticDirectory {
        let mut config = MentoraConfig::default_config();
        config.directory.users.insert(
            "ada".into(),
            DirectoryUser {
                tier: Some("pro".into()),
                progress: ProgressSnapshot {
                    missions_completed: 12,
                    ..Default::default()
                },
            },
        );
        config.directory.users.insert(
            "eve".into(),
            DirectoryUser {
                tier: Some("legacy-gold".into()),
                ..Default::default()
            },
        );
        StaticDirectory::new(config.directory, config.quota)
    }

    #[tokio::test]
    async fn test_known_user() {
        let d = directory();
        assert_eq!(d.progress("ada").await.unwrap().missions_completed, 12);
        assert_eq!(d.subscription_quota("ada").await.unwrap().daily_limit, None);
    }

    #[tokio::test]
    async fn test_unknown_user_gets_default_tier() {
        let d = directory();
        assert_eq!(d.tier_of("zed"), "free");
        assert_eq!(d.progress("zed").await.unwrap(), ProgressSnapshot::default());
        assert_eq!(d.subscription_quota("zed").await.unwrap().daily_limit, Some(5));
    }

    #[tokio::test]
    async fn test_unknown_tier_resolves_to_default_limit() {
        let d = directory();
        assert_eq!(d.subscription_quota("eve").await.unwrap().daily_limit, Some(5));
    }

    #[test]
    fn test_http_mode_requires_base_url() {
        let mut config = MentoraConfig::default_config();
        config.directory.mode = "http".into();
        assert!(create_directory(&config).is_err());
        config.directory.base_url = Some("http://analytics.internal/".into());
        let d = create_directory(&config).unwrap();
        assert_eq!(d.mode(), "http");
    }

    #[tokio::test]
    async fn test_http_unreachable_is_error() {
        let config = DirectoryConfig {
            mode: "http".into(),
            base_url: Some("http://127.0.0.1:9".into()),
            timeout_secs: 1,
            retries: 0,
            ..Default::default()
        };
        let d = HttpDirectory::from_config(&config).unwrap();
        assert!(d.progress("ada").await.is_err());
    }

    fn http_directory(base_url: &str) -> HttpDirectory {
        HttpDirectory::from_config(&DirectoryConfig {
            mode: "http".into(),
            base_url: Some(base_url.into()),
            timeout_secs: 2,
            retries: 0,
            ..Default::default()
        })
        .unwrap()
    }

    /// Serves one request, answering with `body`, and hands back its
    /// request line.
    async fn serve_once(body: &'static str) -> (String, tokio::task::JoinHandle<String>) {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}/api/", listener.local_addr().unwrap());
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let mut read = 0;
            while !buf[..read].windows(4).any(|w| w == b"\r\n\r\n") {
                let n = socket.read(&mut buf[read..]).await.unwrap();
                if n == 0 {
                    break;
                }
                read += n;
            }
            let response = format!(
                "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len()
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            let request = String::from_utf8_lossy(&buf[..read]).to_string();
            request.lines().next().unwrap_or_default().to_string()
        });
        (base, handle)
    }

    #[tokio::test]
    async fn test_user_id_stays_one_path_segment() {
        let (base, server) = serve_once(r#"{"daily_limit": 3}"#).await;
        let d = http_directory(&base);
        let quota = d
            .subscription_quota("../vip-bob/subscription?x=")
            .await
            .unwrap();
        assert_eq!(quota.daily_limit, Some(3));
        let request_line = server.await.unwrap();
        assert_eq!(
            request_line,
            "GET /api/users/..%2Fvip-bob%2Fsubscription%3Fx=/subscription HTTP/1.1"
        );
    }

    #[tokio::test]
    async fn test_dot_segment_user_ids_are_refused() {
        let d = http_directory("http://127.0.0.1:9");
        for user in ["", ".", ".."] {
            assert!(matches!(
                d.progress(user).await,
                Err(MentoraError::InvalidInput(_))
            ));
            assert!(matches!(
                d.subscription_quota(user).await,
                Err(MentoraError::InvalidInput(_))
            ));
        }
    }

    #[test]
    fn test_http_mode_rejects_unparseable_base_url() {
        let mut config = MentoraConfig::default_config();
        config.directory.mode = "http".into();
        config.directory.base_url = Some("not a url".into());
        assert!(matches!(
            create_directory(&config),
            Err(MentoraError::Config(_))
        ));
    }
}
