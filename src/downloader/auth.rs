//! Acquisition auth helpers: cookies.txt detection, the rotating proxy
//! pool, and the YouTube session-token refresh loop.
//!
//! The session generator is a sidecar service that mints po_token/
//! visitor_data pairs; without fresh tokens YouTube increasingly refuses
//! datacenter traffic. Refresh failures alert once after three consecutive
//! misses and announce recovery.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use rand::Rng;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::alerts::Alerts;
use crate::config::{self, Config};

#[derive(Debug, Clone, Deserialize)]
struct SessionTokenResponse {
    #[serde(default)]
    potoken: String,
    #[serde(default)]
    visitor_data: String,
}

#[derive(Default)]
struct CachedTokens {
    po_token: String,
    visitor_data: String,
}

/// Shared acquisition-auth state, owned by the service container.
pub struct AuthService {
    cookies_file: PathBuf,
    session_generator_url: String,
    refresh_interval: Duration,
    proxy_host: Option<String>,
    proxy_port: String,
    proxy_user_prefix: Option<String>,
    proxy_password: Option<String>,
    proxy_count: u32,
    tokens: RwLock<CachedTokens>,
    client: reqwest::Client,
}

impl AuthService {
    pub fn new(config: &Config) -> Self {
        Self {
            cookies_file: PathBuf::from("cookies.txt"),
            session_generator_url: config.session_generator_url.clone(),
            refresh_interval: config.session_token_refresh,
            proxy_host: config.proxy_host.clone(),
            proxy_port: config.proxy_port.clone(),
            proxy_user_prefix: config.proxy_user_prefix.clone(),
            proxy_password: config.proxy_password.clone(),
            proxy_count: config.proxy_count,
            tokens: RwLock::new(CachedTokens::default()),
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
        }
    }

    pub fn has_cookies_file(&self) -> bool {
        self.cookies_file.exists()
    }

    pub fn cookies_path(&self) -> &Path {
        &self.cookies_file
    }

    /// yt-dlp stderr signatures that mean cookies are stale or missing.
    pub fn needs_cookies_retry(error_output: &str) -> bool {
        config::BOT_DETECTION_ERRORS
            .iter()
            .any(|sig| error_output.contains(sig))
    }

    fn cookies_args(&self) -> Vec<String> {
        if self.has_cookies_file() {
            vec![
                "--cookies".to_string(),
                self.cookies_file.to_string_lossy().into_owned(),
            ]
        } else {
            Vec::new()
        }
    }

    fn session_token_args(&self) -> Vec<String> {
        let tokens = self.tokens.read();
        if tokens.po_token.is_empty() || tokens.visitor_data.is_empty() {
            return Vec::new();
        }
        vec![
            "--extractor-args".to_string(),
            format!(
                "youtube:po_token=WEB+{};visitor_data={}",
                tokens.po_token, tokens.visitor_data
            ),
        ]
    }

    /// Cookie + session-token arguments for YouTube-bound yt-dlp runs.
    pub fn youtube_auth_args(&self) -> Vec<String> {
        let mut args = self.cookies_args();
        args.extend(self.session_token_args());
        args
    }

    pub fn has_proxy(&self) -> bool {
        self.proxy_host.is_some() && self.proxy_count > 0
    }

    /// A `--proxy` argument pair pointing at a random pool slot, empty when
    /// no pool is configured.
    pub fn proxy_args(&self) -> Vec<String> {
        let Some(url) = self.random_proxy_url() else {
            return Vec::new();
        };
        vec!["--proxy".to_string(), url]
    }

    fn random_proxy_url(&self) -> Option<String> {
        let host = self.proxy_host.as_deref()?;
        if self.proxy_count == 0 {
            return None;
        }
        let slot = rand::rng().random_range(1..=self.proxy_count);
        match (&self.proxy_user_prefix, &self.proxy_password) {
            (Some(prefix), Some(password)) => Some(format!(
                "http://{prefix}{slot}:{password}@{host}:{}",
                self.proxy_port
            )),
            _ => Some(format!("http://{host}:{}", self.proxy_port)),
        }
    }

    /// Spawn the periodic session-token refresh loop.
    pub fn start_token_refresh(self: &Arc<Self>, alerts: Arc<Alerts>, cancel: CancellationToken) {
        let auth = self.clone();
        tokio::spawn(async move {
            // Initial fetch with short retries so the first downloads have
            // tokens available.
            for attempt in 1..=5u32 {
                if auth.refresh_token().await {
                    info!("Initial session token fetched");
                    break;
                }
                let delay = Duration::from_secs((attempt * 2) as u64);
                debug!(attempt, "Initial session token fetch failed, retrying");
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            let mut consecutive_failures = 0u32;
            let mut alert_sent = false;
            let mut interval = tokio::time::interval(auth.refresh_interval);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("Session token refresh shutting down");
                        break;
                    }
                    _ = interval.tick() => {
                        if auth.refresh_token().await {
                            if consecutive_failures > 0 {
                                info!(failures = consecutive_failures, "Session token refreshed after failures");
                            }
                            if alert_sent {
                                alerts.session_token_recovered();
                                alert_sent = false;
                            }
                            consecutive_failures = 0;
                        } else {
                            consecutive_failures += 1;
                            warn!(consecutive = consecutive_failures, "Session token refresh failed");
                            if consecutive_failures >= 3 && !alert_sent {
                                alerts.session_token_failed(&format!(
                                    "Token refresh failed {consecutive_failures} consecutive times. Generator may be down at {}",
                                    auth.session_generator_url
                                ));
                                alert_sent = true;
                            }
                        }
                    }
                }
            }
        });
    }

    async fn refresh_token(&self) -> bool {
        // POST /update triggers regeneration; a failure here still leaves a
        // chance that GET /token serves a cached pair.
        let update_url = format!("{}/update", self.session_generator_url);
        match self.client.post(&update_url).send().await {
            Ok(resp) if !resp.status().is_success() => {
                debug!(status = %resp.status(), "Session generator /update returned non-200");
            }
            Err(e) => debug!(error = %e, "Session generator /update failed"),
            _ => {}
        }

        let token_url = format!("{}/token", self.session_generator_url);
        let resp = match self.client.get(&token_url).send().await {
            Ok(resp) if resp.status().is_success() => resp,
            Ok(resp) => {
                debug!(status = %resp.status(), "Session generator /token returned non-200");
                return false;
            }
            Err(e) => {
                debug!(error = %e, "Session generator /token failed");
                return false;
            }
        };

        let token: SessionTokenResponse = match resp.json().await {
            Ok(token) => token,
            Err(e) => {
                debug!(error = %e, "Session token response was not valid JSON");
                return false;
            }
        };
        if token.potoken.is_empty() || token.visitor_data.is_empty() {
            debug!("Session token response missing fields");
            return false;
        }

        let mut tokens = self.tokens.write();
        tokens.po_token = token.potoken;
        tokens.visitor_data = token.visitor_data;
        true
    }

    #[cfg(test)]
    fn set_tokens(&self, po: &str, visitor: &str) {
        let mut tokens = self.tokens.write();
        tokens.po_token = po.to_string();
        tokens.visitor_data = visitor.to_string();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with(f: impl FnOnce(&mut Config)) -> Config {
        let mut config = Config {
            port: 3001,
            env_mode: "test".into(),
            bot_secret: None,
            tunnel_api_key: None,
            transcription_api_key: None,
            proxy_host: None,
            proxy_port: "80".into(),
            proxy_user_prefix: None,
            proxy_password: None,
            proxy_count: 0,
            discord_webhook_url: None,
            discord_ping_user_id: None,
            session_generator_url: "http://localhost:8080".into(),
            session_token_refresh: Duration::from_secs(900),
            whisper_script: "whisper.py".into(),
        };
        f(&mut config);
        config
    }

    #[test]
    fn no_tokens_means_no_extractor_args() {
        let auth = AuthService::new(&config_with(|_| {}));
        assert!(auth.session_token_args().is_empty());

        auth.set_tokens("PO", "VISITOR");
        let args = auth.session_token_args();
        assert_eq!(args[0], "--extractor-args");
        assert_eq!(args[1], "youtube:po_token=WEB+PO;visitor_data=VISITOR");
    }

    #[test]
    fn proxy_args_need_host_and_count() {
        let auth = AuthService::new(&config_with(|_| {}));
        assert!(!auth.has_proxy());
        assert!(auth.proxy_args().is_empty());

        let auth = AuthService::new(&config_with(|c| {
            c.proxy_host = Some("proxy.example".into());
            c.proxy_count = 3;
            c.proxy_user_prefix = Some("user-".into());
            c.proxy_password = Some("pw".into());
        }));
        assert!(auth.has_proxy());
        let args = auth.proxy_args();
        assert_eq!(args[0], "--proxy");
        assert!(args[1].starts_with("http://user-"));
        assert!(args[1].contains("@proxy.example:80"));
    }

    #[test]
    fn proxy_without_credentials_is_plain() {
        let auth = AuthService::new(&config_with(|c| {
            c.proxy_host = Some("proxy.example".into());
            c.proxy_count = 1;
        }));
        assert_eq!(auth.proxy_args()[1], "http://proxy.example:80");
    }

    #[test]
    fn bot_detection_signatures() {
        assert!(AuthService::needs_cookies_retry(
            "ERROR: Sign in to confirm you're not a bot"
        ));
        assert!(AuthService::needs_cookies_retry("Private video"));
        assert!(!AuthService::needs_cookies_retry("HTTP Error 500"));
    }
}
