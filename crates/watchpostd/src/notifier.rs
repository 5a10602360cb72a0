//! Outbound alert delivery (Telegram `sendPhoto`).

use chrono::{DateTime, Local};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

const TELEGRAM_API_BASE: &str = "https://api.telegram.org";
const CAPTION_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("TELEGRAM_BOT_TOKEN and TELEGRAM_CHAT_ID must both be set")]
    MissingCredentials,
    #[error("cannot attach {path}: {source}")]
    Attachment {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("API returned error: {status} - {message}")]
    Api { status: u16, message: String },
}

/// Sends a photo with a caption somewhere a person will see it.
pub trait Notifier: Send {
    fn notify(&self, image: &Path, caption: &str) -> Result<(), NotifyError>;
}

/// Expand `{time}` in `template`; fall back to a fixed caption on any other
/// placeholder or unbalanced brace. `{{` and `}}` are literal braces.
pub fn render_caption(template: &str, at: DateTime<Local>) -> String {
    let time = at.format(CAPTION_TIME_FORMAT).to_string();
    expand(template, &time).unwrap_or_else(|| format!("Unknown face at {time}"))
}

fn expand(template: &str, time: &str) -> Option<String> {
    let mut out = String::with_capacity(template.len() + time.len());
    let mut chars = template.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                out.push('{');
            }
            '{' => {
                let mut name = String::new();
                loop {
                    match chars.next()? {
                        '}' => break,
                        ch => name.push(ch),
                    }
                }
                if name != "time" {
                    return None;
                }
                out.push_str(time);
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                out.push('}');
            }
            '}' => return None,
            ch => out.push(ch),
        }
    }
    Some(out)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelegramCredentials {
    pub bot_token: String,
    pub chat_id: String,
}

impl TelegramCredentials {
    /// Read `TELEGRAM_BOT_TOKEN` / `TELEGRAM_CHAT_ID` through `lookup`.
    pub fn from_env(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, NotifyError> {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        match (non_empty("TELEGRAM_BOT_TOKEN"), non_empty("TELEGRAM_CHAT_ID")) {
            (Some(bot_token), Some(chat_id)) => Ok(Self { bot_token, chat_id }),
            _ => Err(NotifyError::MissingCredentials),
        }
    }
}

/// Blocking Telegram Bot API client.
///
/// Construct and use it off the async runtime; the pipeline thread owns it.
pub struct TelegramNotifier {
    client: reqwest::blocking::Client,
    credentials: TelegramCredentials,
    api_base: String,
}

impl TelegramNotifier {
    pub fn new(credentials: TelegramCredentials, timeout: Duration) -> Result<Self, NotifyError> {
        let client = reqwest::blocking::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            credentials,
            api_base: TELEGRAM_API_BASE.to_string(),
        })
    }

    fn send_photo_url(&self) -> String {
        format!("{}/bot{}/sendPhoto", self.api_base, self.credentials.bot_token)
    }
}

impl Notifier for TelegramNotifier {
    fn notify(&self, image: &Path, caption: &str) -> Result<(), NotifyError> {
        let form = reqwest::blocking::multipart::Form::new()
            .text("chat_id", self.credentials.chat_id.clone())
            .text("caption", caption.to_string())
            .file("photo", image)
            .map_err(|source| NotifyError::Attachment {
                path: image.to_path_buf(),
                source,
            })?;

        let response = self.client.post(self.send_photo_url()).multipart(form).send()?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().unwrap_or_default();
            return Err(NotifyError::Api {
                status: status.as_u16(),
                message,
            });
        }
        tracing::info!(image = %image.display(), "telegram photo sent");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::collections::HashMap;

    fn at() -> DateTime<Local> {
        Local.with_ymd_and_hms(2025, 10, 11, 11, 22, 33).unwrap()
    }

    #[test]
    fn test_time_placeholder() {
        assert_eq!(
            render_caption("Unknown face at {time}", at()),
            "Unknown face at 2025-10-11 11:22:33"
        );
        assert_eq!(render_caption("{time}|{time}", at()), "2025-10-11 11:22:33|2025-10-11 11:22:33");
        assert_eq!(render_caption("no placeholders", at()), "no placeholders");
    }

    #[test]
    fn test_escaped_braces() {
        assert_eq!(render_caption("{{alert}} {time}", at()), "{alert} 2025-10-11 11:22:33");
    }

    #[test]
    fn test_bad_templates_fall_back() {
        let fallback = "Unknown face at 2025-10-11 11:22:33";
        for template in ["{who} at {time}", "{time", "oops }", "{}", "{time:%H}"] {
            assert_eq!(render_caption(template, at()), fallback, "template {template:?}");
        }
    }

    #[test]
    fn test_credentials_from_env() {
        let vars: HashMap<&str, &str> =
            [("TELEGRAM_BOT_TOKEN", "123:abc"), ("TELEGRAM_CHAT_ID", "42")].into_iter().collect();
        let creds = TelegramCredentials::from_env(|k| vars.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(creds.chat_id, "42");

        let missing = TelegramCredentials::from_env(|k| {
            (k == "TELEGRAM_BOT_TOKEN").then(|| "123:abc".to_string())
        });
        assert!(matches!(missing, Err(NotifyError::MissingCredentials)));

        let blank = TelegramCredentials::from_env(|_| Some("  ".to_string()));
        assert!(matches!(blank, Err(NotifyError::MissingCredentials)));
    }

    #[test]
    fn test_send_photo_url() {
        let n = TelegramNotifier::new(
            TelegramCredentials {
                bot_token: "123:abc".into(),
                chat_id: "42".into(),
            },
            Duration::from_secs(30),
        )
        .unwrap();
        assert_eq!(n.send_photo_url(), "https://api.telegram.org/bot123:abc/sendPhoto");
    }

    #[test]
    fn test_missing_attachment_is_reported() {
        let n = TelegramNotifier::new(
            TelegramCredentials {
                bot_token: "t".into(),
                chat_id: "c".into(),
            },
            Duration::from_secs(1),
        )
        .unwrap();
        let err = n.notify(Path::new("/definitely/not/here.jpg"), "x").unwrap_err();
        assert!(matches!(err, NotifyError::Attachment { .. }));
    }
}
