use crate::{env_optional, ConfigError, FromEnv};

/// Chat webhook for order notifications
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NotifierSettings {
    /// Without a webhook, notifications are only logged
    pub slack_webhook_url: Option<String>,
}

impl FromEnv for NotifierSettings {
    fn from_env() -> Result<Self, ConfigError> {
        let slack_webhook_url = env_optional("SLACK_WEBHOOK_URL");
        if let Some(url) = &slack_webhook_url {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(ConfigError::Invalid {
                    key: "SLACK_WEBHOOK_URL".to_string(),
                    details: "must be an http(s) URL".to_string(),
                });
            }
        }
        Ok(Self { slack_webhook_url })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_webhook_is_optional() {
        temp_env::with_var_unset("SLACK_WEBHOOK_URL", || {
            assert_eq!(NotifierSettings::from_env().unwrap().slack_webhook_url, None);
        });
    }

    #[test]
    fn test_webhook_must_be_http() {
        temp_env::with_var("SLACK_WEBHOOK_URL", Some("hooks.slack.com/x"), || {
            let err = NotifierSettings::from_env().unwrap_err();
            assert!(err.to_string().contains("SLACK_WEBHOOK_URL"));
        });
        temp_env::with_var("SLACK_WEBHOOK_URL", Some("https://hooks.slack.com/x"), || {
            let settings = NotifierSettings::from_env().unwrap();
            assert_eq!(settings.slack_webhook_url.as_deref(), Some("https://hooks.slack.com/x"));
        });
    }
}
