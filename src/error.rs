//! Application-wide error types.

use thiserror::Error;

/// Application-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Application-wide error type.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("{0}")]
    Admission(String),

    #[error("Download cancelled")]
    Cancelled,

    #[error("{0}")]
    Upstream(String),

    #[error("{0}")]
    Encoding(String),

    #[error("{0}")]
    Timeout(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn upstream(msg: impl Into<String>) -> Self {
        Self::Upstream(msg.into())
    }

    pub fn encoding(msg: impl Into<String>) -> Self {
        Self::Encoding(msg.into())
    }

    /// True when this error represents a cancellation rather than a failure.
    pub fn is_cancelled(&self) -> bool {
        match self {
            Self::Cancelled => true,
            Self::Upstream(m) | Self::Other(m) => {
                let m = m.to_ascii_lowercase();
                m.contains("cancelled") || m.contains("canceled")
            }
            _ => false,
        }
    }

    /// The message shown to end users for this error.
    pub fn user_message(&self) -> String {
        match self {
            Self::Cancelled => "Download cancelled".to_string(),
            Self::Validation(m) | Self::Admission(m) => m.clone(),
            Self::Encoding(_) => "Processing failed".to_string(),
            other => to_user_error(&other.to_string()),
        }
    }
}

/// Map an upstream error message to the fixed user-facing vocabulary.
///
/// Matching is case-insensitive substring matching; unknown errors fold to
/// "Download failed". The order of checks matters: more specific platform
/// signatures come before generic network phrases.
pub fn to_user_error(message: &str) -> String {
    let msg = message.to_ascii_lowercase();
    let has = |needle: &str| msg.contains(needle);

    let phrase = if has("cancelled") || has("canceled") {
        "Download cancelled"
    } else if has("content.video.unavailable")
        || has("video unavailable")
        || has("private video")
        || has("this content is private")
    {
        "This video is unavailable or has been removed"
    } else if has("content.video.live") || has("live stream") {
        "Live streams can't be downloaded yet"
    } else if has("content.video.age") || has("age-restricted") || has("age restricted") {
        "This video is age-restricted"
    } else if has("content.too_long") || has("too_long") {
        "Video is too long (3+ hours)"
    } else if has("api.youtube.login") || has("youtube.login") {
        "YouTube requires login for this video"
    } else if has("api.rate_limited") {
        "Rate limited, try again in a minute"
    } else if has("api.link.unsupported") {
        "This link type isn't supported"
    } else if has("sign in to confirm") || has("sign in to verify") {
        "YouTube is blocking this request, try again later"
    } else if has("geo restricted") || has("geo-restricted") || has("not available in your country")
    {
        "This video isn't available in the server's region"
    } else if has("copyright") {
        "This video was removed for copyright"
    } else if has("members only") || has("members-only") {
        "This is a members-only video"
    } else if has("premium") {
        "This video requires YouTube Premium"
    } else if has("http error 403") || has("403 forbidden") {
        "Access denied, the site is blocking downloads"
    } else if has("http error 404") || has("404 not found") {
        "Video not found, it may have been deleted"
    } else if has("unsupported url") {
        "This website isn't supported"
    } else if has("no video formats") || has("requested format not available") {
        "No downloadable formats found"
    } else if has("rate") && !has("format") {
        "Rate limited, please wait and try again"
    } else if has("econnreset") || has("fetch failed") || (has("connection") && !has("connected"))
    {
        "Connection dropped, try again"
    } else if has("etimedout") || has("timed out") || has("timeout") {
        "Connection timed out, try again"
    } else if has("enotfound") || has("dns") {
        "Couldn't reach the server, try again"
    } else if has("processing failed") || has("encoding failed") {
        "Processing failed"
    } else if has("download interrupted") {
        "Download interrupted"
    } else if has("no videos were successfully downloaded") {
        "No videos were successfully downloaded"
    } else if has("playlist too large") || has("too many active") {
        // Admission and size-limit messages are already user-facing.
        return message.to_string();
    } else if has("downloaded file not found") || has("file not found") {
        "Download failed"
    } else {
        "Download failed"
    };

    phrase.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_platform_signatures() {
        assert_eq!(
            to_user_error("ERROR: Private video. Sign in if you've been granted access"),
            "This video is unavailable or has been removed"
        );
        assert_eq!(to_user_error("this is a Members Only broadcast"), "This is a members-only video");
        assert_eq!(
            to_user_error("HTTP Error 403: Forbidden"),
            "Access denied, the site is blocking downloads"
        );
    }

    #[test]
    fn unknown_errors_fold_to_generic() {
        assert_eq!(to_user_error("segfault in libxyz"), "Download failed");
    }

    #[test]
    fn admission_messages_pass_through_verbatim() {
        let msg = "Too many active download jobs (limit: 6)";
        assert_eq!(to_user_error(msg), msg);
        let msg = "Playlist too large. Maximum 1000 videos allowed. This playlist has 1200 videos.";
        assert_eq!(to_user_error(msg), msg);
    }

    #[test]
    fn cancellation_is_detected() {
        assert!(Error::Cancelled.is_cancelled());
        assert!(Error::Upstream("Cancelled".into()).is_cancelled());
        assert!(!Error::Upstream("HTTP 500".into()).is_cancelled());
    }

    #[test]
    fn cancelled_never_reports_as_failure() {
        assert_eq!(Error::Cancelled.user_message(), "Download cancelled");
        assert_eq!(to_user_error("operation canceled by peer"), "Download cancelled");
    }
}
