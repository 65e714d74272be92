//! HTTP client for the qBittorrent Web API.

use std::time::Duration;

use reqwest::header::{self, HeaderValue};
use reqwest::{multipart, Client as HttpClient, RequestBuilder, StatusCode, Url};
use tokio::sync::RwLock;

use crate::error::{Error, Result};
use crate::models::{MainData, Tracker};

/// Payload for `/api/v2/torrents/add`.
///
/// Exactly one of `urls` or `torrent` is expected to be set; the daemon
/// accepts both in one request but callers here never mix them.
#[derive(Debug, Default)]
pub struct AddTorrentParams {
    /// Download URL(s), newline separated.
    pub urls: Option<String>,
    /// Raw `.torrent` file content with its file name.
    pub torrent: Option<(String, Vec<u8>)>,
    pub category: Option<String>,
    /// Add the torrent without starting it.
    pub stopped: bool,
}

impl AddTorrentParams {
    pub fn from_url(url: impl Into<String>) -> Self {
        Self {
            urls: Some(url.into()),
            ..Default::default()
        }
    }

    pub fn from_file(file_name: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            torrent: Some((file_name.into(), data)),
            ..Default::default()
        }
    }
}

/// Client for one qBittorrent daemon.
///
/// Authentication is cookie based: [`Client::login`] captures the `SID`
/// cookie from the daemon and every later request replays it. A client is
/// cheap to share behind an `Arc`; all methods take `&self`.
#[derive(Debug)]
pub struct Client {
    http: HttpClient,
    base_url: Url,
    sid: RwLock<Option<String>>,
}

impl Client {
    /// Create a client for the daemon at `base_url`.
    ///
    /// `timeout` bounds every request issued through this client, connect
    /// and body read included.
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        // Normalize so join() keeps any path prefix (reverse-proxy setups).
        let mut base_url: Url = base_url.parse()?;
        if !base_url.path().ends_with('/') {
            base_url.set_path(&format!("{}/", base_url.path()));
        }

        let http = HttpClient::builder().timeout(timeout).build()?;

        Ok(Self {
            http,
            base_url,
            sid: RwLock::new(None),
        })
    }

    /// Log in and store the session cookie for subsequent calls.
    pub async fn login(&self, username: &str, password: &str) -> Result<()> {
        let url = self.endpoint("api/v2/auth/login")?;

        let response = self
            .http
            .post(url)
            .header(header::REFERER, self.base_url.as_str())
            .form(&[("username", username), ("password", password)])
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Error::AuthFailed {
                url: self.base_url.to_string(),
            });
        }

        let sid = extract_sid(&response);
        let body = response.text().await?;
        // The daemon answers 200 with a literal "Fails." on bad credentials.
        if !body.starts_with("Ok") {
            return Err(Error::AuthFailed {
                url: self.base_url.to_string(),
            });
        }

        match sid {
            Some(sid) => {
                *self.sid.write().await = Some(sid);
                Ok(())
            }
            None => {
                tracing::warn!(url = %self.base_url, "login succeeded but no SID cookie was set");
                Err(Error::AuthFailed {
                    url: self.base_url.to_string(),
                })
            }
        }
    }

    /// Fetch the full maindata snapshot (`rid=0`).
    pub async fn sync_maindata(&self) -> Result<MainData> {
        let url = self.endpoint("api/v2/sync/maindata")?;
        let response = self
            .get(url)
            .await
            .query(&[("rid", "0")])
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Error::Api {
                endpoint: "sync/maindata",
                status: response.status(),
            });
        }

        Ok(response.json::<MainData>().await?)
    }

    /// Add a torrent by URL or file content.
    ///
    /// Returns the raw response body; the daemon signals acceptance with a
    /// body starting with the literal `Ok`.
    pub async fn add_torrent(&self, params: AddTorrentParams) -> Result<String> {
        let url = self.endpoint("api/v2/torrents/add")?;

        let mut form = multipart::Form::new();
        if let Some(urls) = params.urls {
            form = form.text("urls", urls);
        }
        if let Some((file_name, data)) = params.torrent {
            let part = multipart::Part::bytes(data)
                .file_name(file_name)
                .mime_str("application/x-bittorrent")?;
            form = form.part("torrents", part);
        }
        if let Some(category) = params.category {
            form = form.text("category", category);
        }
        if params.stopped {
            // v5 renamed "paused" to "stopped"; send both so either version
            // honors the flag.
            form = form.text("stopped", "true");
            form = form.text("paused", "true");
        }

        let response = self.post(url).await.multipart(form).send().await?;

        if !response.status().is_success() {
            return Err(Error::Api {
                endpoint: "torrents/add",
                status: response.status(),
            });
        }

        Ok(response.text().await?)
    }

    /// Force a tracker re-announce for the given info-hashes.
    pub async fn reannounce(&self, hashes: &[&str]) -> Result<()> {
        let url = self.endpoint("api/v2/torrents/reannounce")?;
        let response = self
            .post(url)
            .await
            .form(&[("hashes", hashes.join("|"))])
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Error::Api {
                endpoint: "torrents/reannounce",
                status: response.status(),
            });
        }

        Ok(())
    }

    /// List trackers of one torrent.
    pub async fn trackers(&self, hash: &str) -> Result<Vec<Tracker>> {
        let url = self.endpoint("api/v2/torrents/trackers")?;
        let response = self.get(url).await.query(&[("hash", hash)]).send().await?;

        match response.status() {
            StatusCode::NOT_FOUND => Err(Error::Api {
                endpoint: "torrents/trackers",
                status: StatusCode::NOT_FOUND,
            }),
            status if !status.is_success() => Err(Error::Api {
                endpoint: "torrents/trackers",
                status,
            }),
            _ => Ok(response.json::<Vec<Tracker>>().await?),
        }
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        Ok(self.base_url.join(path)?)
    }

    async fn get(&self, url: Url) -> RequestBuilder {
        self.with_cookie(self.http.get(url)).await
    }

    async fn post(&self, url: Url) -> RequestBuilder {
        self.with_cookie(self.http.post(url)).await
    }

    async fn with_cookie(&self, builder: RequestBuilder) -> RequestBuilder {
        match self.sid.read().await.as_deref() {
            Some(sid) => builder.header(header::COOKIE, format!("SID={}", sid)),
            None => builder,
        }
    }
}

/// Pull the `SID` value out of the login response's `Set-Cookie` headers.
fn extract_sid(response: &reqwest::Response) -> Option<String> {
    response
        .headers()
        .get_all(header::SET_COOKIE)
        .iter()
        .filter_map(|value: &HeaderValue| value.to_str().ok())
        .find_map(|cookie| {
            let (name, rest) = cookie.split_once('=')?;
            if name.trim() != "SID" {
                return None;
            }
            let sid = rest.split(';').next()?.trim();
            (!sid.is_empty()).then(|| sid.to_string())
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_gets_trailing_slash() {
        let client = Client::new("http://localhost:8080", Duration::from_secs(5)).unwrap();
        let url = client.endpoint("api/v2/auth/login").unwrap();
        assert_eq!(url.as_str(), "http://localhost:8080/api/v2/auth/login");
    }

    #[test]
    fn test_path_prefix_preserved() {
        let client = Client::new("http://localhost:8080/qbt", Duration::from_secs(5)).unwrap();
        let url = client.endpoint("api/v2/sync/maindata").unwrap();
        assert_eq!(url.as_str(), "http://localhost:8080/qbt/api/v2/sync/maindata");
    }

    #[test]
    fn test_invalid_url_rejected() {
        assert!(Client::new("not a url", Duration::from_secs(5)).is_err());
    }

    #[test]
    fn test_add_params_constructors() {
        let by_url = AddTorrentParams::from_url("https://indexer.example/dl/1.torrent");
        assert!(by_url.urls.is_some());
        assert!(by_url.torrent.is_none());

        let by_file = AddTorrentParams::from_file("a.torrent", vec![1, 2, 3]);
        assert!(by_file.urls.is_none());
        assert_eq!(by_file.torrent.as_ref().unwrap().1, vec![1, 2, 3]);
    }
}
