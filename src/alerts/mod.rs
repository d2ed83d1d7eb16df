//! Discord webhook alerts.
//!
//! Operational failures post an embed to a configured webhook. Each alert
//! category has a cooldown so a stuck upstream cannot flood the channel;
//! the POST itself runs on a detached task and never blocks a pipeline.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use reqwest::Client;
use serde_json::json;
use tracing::{debug, warn};

use crate::config::Config;

const COLOR_ORANGE: u32 = 0xFFA500;
const COLOR_RED: u32 = 0xFF4444;
const COLOR_CRIT: u32 = 0xFF0000;
const COLOR_GREEN: u32 = 0x2ECC71;

pub struct Alerts {
    webhook_url: Option<String>,
    ping_user_id: Option<String>,
    version: &'static str,
    cooldowns: Mutex<HashMap<&'static str, Instant>>,
    client: Client,
}

impl Alerts {
    pub fn new(config: &Config) -> Self {
        Self {
            webhook_url: config.discord_webhook_url.clone(),
            ping_user_id: config.discord_ping_user_id.clone(),
            version: env!("CARGO_PKG_VERSION"),
            cooldowns: Mutex::new(HashMap::new()),
            client: Client::new(),
        }
    }

    pub fn enabled(&self) -> bool {
        self.webhook_url.is_some()
    }

    fn send(
        &self,
        category: &'static str,
        cooldown: Duration,
        ping: bool,
        color: u32,
        title: &str,
        description: &str,
        fields: &[(&str, String)],
    ) {
        let Some(webhook_url) = self.webhook_url.clone() else {
            return;
        };

        {
            let mut cooldowns = self.cooldowns.lock();
            let now = Instant::now();
            if cooldown > Duration::ZERO {
                if let Some(last) = cooldowns.get(category) {
                    if now.saturating_duration_since(*last) < cooldown {
                        return;
                    }
                }
            }
            cooldowns.insert(category, now);
        }

        let embed_fields: Vec<_> = fields
            .iter()
            .filter(|(_, v)| !v.is_empty())
            .map(|(name, value)| {
                json!({
                    "name": name,
                    "value": truncate(value, 1024),
                    "inline": true,
                })
            })
            .collect();

        let mut payload = json!({
            "embeds": [{
                "title": title,
                "description": truncate(description, 2048),
                "color": color,
                "fields": embed_fields,
                "timestamp": chrono::Utc::now().to_rfc3339(),
                "footer": { "text": "yoink" },
            }]
        });
        if ping {
            if let Some(user_id) = &self.ping_user_id {
                payload["content"] = json!(format!("<@{user_id}>"));
            }
        }

        let client = self.client.clone();
        tokio::spawn(async move {
            match client.post(&webhook_url).json(&payload).send().await {
                Ok(resp) if !resp.status().is_success() => {
                    warn!(status = %resp.status(), "Discord webhook returned an error");
                }
                Err(e) => warn!(error = %e, "Discord webhook send failed"),
                _ => debug!("Discord alert sent"),
            }
        });
    }

    pub fn server_started(&self, port: u16) {
        self.send(
            "server-start",
            Duration::ZERO,
            false,
            COLOR_GREEN,
            "Server Started",
            &format!("yoink {} listening on :{port}", self.version),
            &[],
        );
    }

    pub fn server_stopping(&self) {
        self.send(
            "server-stop",
            Duration::ZERO,
            false,
            COLOR_ORANGE,
            "Server Stopping",
            "yoink is shutting down",
            &[],
        );
    }

    pub fn download_failed(&self, job_id: &str, url: &str, error: &str) {
        self.send(
            "download",
            Duration::from_secs(5),
            true,
            COLOR_RED,
            "Download Failed",
            error,
            &[
                ("Job", job_id.to_string()),
                ("URL", truncate(url, 200)),
                ("Error", truncate(error, 500)),
            ],
        );
    }

    pub fn playlist_failed(&self, job_id: &str, url: &str, error: &str) {
        self.send(
            "playlist",
            Duration::from_secs(5),
            true,
            COLOR_RED,
            "Playlist Failed",
            error,
            &[
                ("Job", job_id.to_string()),
                ("URL", truncate(url, 200)),
                ("Error", truncate(error, 500)),
            ],
        );
    }

    pub fn conversion_failed(&self, job_id: &str, format: &str, error: &str) {
        self.send(
            "conversion",
            Duration::from_secs(5),
            true,
            COLOR_RED,
            "Conversion Failed",
            error,
            &[
                ("Job", job_id.to_string()),
                ("Format", format.to_string()),
                ("Error", truncate(error, 500)),
            ],
        );
    }

    pub fn compression_failed(&self, job_id: &str, error: &str) {
        self.send(
            "compression",
            Duration::from_secs(5),
            true,
            COLOR_RED,
            "Compression Failed",
            error,
            &[("Job", job_id.to_string()), ("Error", truncate(error, 500))],
        );
    }

    pub fn gallery_failed(&self, job_id: &str, url: &str, error: &str) {
        self.send(
            "gallery",
            Duration::from_secs(5),
            true,
            COLOR_RED,
            "Gallery Failed",
            error,
            &[
                ("Job", job_id.to_string()),
                ("URL", truncate(url, 200)),
                ("Error", truncate(error, 500)),
            ],
        );
    }

    pub fn transcription_failed(&self, job_id: &str, error: &str) {
        self.send(
            "transcription",
            Duration::from_secs(5),
            true,
            COLOR_RED,
            "Transcription Failed",
            error,
            &[("Job", job_id.to_string()), ("Error", truncate(error, 500))],
        );
    }

    pub fn bot_job_failed(&self, job_id: &str, url: &str, error: &str) {
        self.send(
            "bot",
            Duration::from_secs(5),
            true,
            COLOR_RED,
            "Bot Download Failed",
            error,
            &[
                ("Job", job_id.to_string()),
                ("URL", truncate(url, 200)),
                ("Error", truncate(error, 500)),
            ],
        );
    }

    pub fn cookie_issue(&self, details: &str) {
        self.send(
            "cookie",
            Duration::from_secs(60),
            true,
            COLOR_ORANGE,
            "Cookie Issue",
            details,
            &[],
        );
    }

    pub fn tunnel_all_failed(&self, job_id: &str, url: &str, error: &str) {
        self.send(
            "tunnel",
            Duration::from_secs(10),
            false,
            COLOR_ORANGE,
            "All Tunnel Instances Failed",
            error,
            &[
                ("Job", job_id.to_string()),
                ("URL", truncate(url, 200)),
                ("Error", truncate(error, 500)),
            ],
        );
    }

    pub fn proxy_error(&self, details: &str) {
        self.send(
            "proxy",
            Duration::from_secs(60),
            true,
            COLOR_CRIT,
            "Proxy Error",
            details,
            &[],
        );
    }

    pub fn session_token_failed(&self, details: &str) {
        self.send(
            "session-token",
            Duration::from_secs(60),
            true,
            COLOR_ORANGE,
            "Session Token Failed",
            details,
            &[],
        );
    }

    pub fn session_token_recovered(&self) {
        self.send(
            "session-token-recovered",
            Duration::ZERO,
            false,
            COLOR_GREEN,
            "Session Token Recovered",
            "YouTube session tokens are being refreshed successfully again.",
            &[],
        );
    }
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() > max_len {
        let cut: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{cut}...")
    } else {
        s.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn disabled_alerts() -> Alerts {
        let config = Config {
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
        Alerts::new(&config)
    }

    #[tokio::test]
    async fn disabled_webhook_never_sends() {
        let alerts = disabled_alerts();
        assert!(!alerts.enabled());
        // Must be a silent no-op.
        alerts.download_failed("job-1", "https://example.com", "boom");
        alerts.server_started(3001);
    }

    #[test]
    fn truncate_honors_limit() {
        assert_eq!(truncate("short", 10), "short");
        let long = "x".repeat(20);
        let t = truncate(&long, 10);
        assert_eq!(t.chars().count(), 10);
        assert!(t.ends_with("..."));
    }

    #[tokio::test]
    async fn cooldown_suppresses_repeats() {
        let alerts = disabled_alerts();
        // With no webhook the cooldown map is untouched; exercise it
        // directly instead.
        let mut cooldowns = alerts.cooldowns.lock();
        cooldowns.insert("download", Instant::now());
        drop(cooldowns);
        // A second alert inside the window would early-return before
        // building the payload; nothing observable beyond not panicking.
        alerts.download_failed("job-1", "u", "e");
    }
}
