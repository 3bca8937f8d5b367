//! Built-in service catalogue.
//!
//! Covers the common external APIs agents reach for. A user service file may
//! override any entry by name.

use super::{AuthMode, HeaderPair, ServiceSpec};

fn header(
    name: &str,
    upstream: &str,
    host_patterns: &[&str],
    header: &str,
    prefix: Option<&str>,
    credential_key: &str,
) -> ServiceSpec {
    ServiceSpec {
        name: name.to_owned(),
        upstream: upstream.to_owned(),
        auth: AuthMode::Header {
            header: header.to_owned(),
            prefix: prefix.map(str::to_owned),
            credential_key: credential_key.to_owned(),
        },
        host_patterns: host_patterns.iter().map(|p| (*p).to_owned()).collect(),
    }
}

/// The default catalogue, in registry insertion order.
#[must_use]
pub fn builtin_services() -> Vec<ServiceSpec> {
    vec![
        header(
            "anthropic",
            "https://api.anthropic.com",
            &["api.anthropic.com"],
            "x-api-key",
            None,
            "api_key",
        ),
        header(
            "openai",
            "https://api.openai.com",
            &["api.openai.com"],
            "Authorization",
            Some("Bearer "),
            "api_key",
        ),
        header(
            "github",
            "https://api.github.com",
            &["api.github.com"],
            "Authorization",
            Some("Bearer "),
            "token",
        ),
        header(
            "slack",
            "https://slack.com",
            &["slack.com", "*.slack.com"],
            "Authorization",
            Some("Bearer "),
            "bot_token",
        ),
        header(
            "discord",
            "https://discord.com",
            &["discord.com", "*.discord.com"],
            "Authorization",
            Some("Bot "),
            "bot_token",
        ),
        header(
            "pagerduty",
            "https://api.pagerduty.com",
            &["api.pagerduty.com"],
            "Authorization",
            Some("Token token="),
            "api_key",
        ),
        header(
            "sentry",
            "https://sentry.io",
            &["sentry.io", "*.sentry.io"],
            "Authorization",
            Some("Bearer "),
            "auth_token",
        ),
        header(
            "npm",
            "https://registry.npmjs.org",
            &["registry.npmjs.org"],
            "Authorization",
            Some("Bearer "),
            "token",
        ),
        header(
            "stripe",
            "https://api.stripe.com",
            &["api.stripe.com"],
            "Authorization",
            Some("Bearer "),
            "secret_key",
        ),
        header(
            "google-ai",
            "https://generativelanguage.googleapis.com",
            &["generativelanguage.googleapis.com"],
            "x-goog-api-key",
            None,
            "api_key",
        ),
        header(
            "openrouter",
            "https://openrouter.ai",
            &["openrouter.ai"],
            "Authorization",
            Some("Bearer "),
            "api_key",
        ),
        header(
            "groq",
            "https://api.groq.com",
            &["api.groq.com"],
            "Authorization",
            Some("Bearer "),
            "api_key",
        ),
        header(
            "mistral",
            "https://api.mistral.ai",
            &["api.mistral.ai"],
            "Authorization",
            Some("Bearer "),
            "api_key",
        ),
        header(
            "elevenlabs",
            "https://api.elevenlabs.io",
            &["api.elevenlabs.io"],
            "xi-api-key",
            None,
            "api_key",
        ),
        header(
            "huggingface",
            "https://api-inference.huggingface.co",
            &["api-inference.huggingface.co", "huggingface.co"],
            "Authorization",
            Some("Bearer "),
            "token",
        ),
        header(
            "sendgrid",
            "https://api.sendgrid.com",
            &["api.sendgrid.com"],
            "Authorization",
            Some("Bearer "),
            "api_key",
        ),
        header(
            "gitlab",
            "https://gitlab.com",
            &["gitlab.com"],
            "PRIVATE-TOKEN",
            None,
            "token",
        ),
        // Telegram carries the bot token inside the URL path.
        ServiceSpec {
            name: "telegram".to_owned(),
            upstream: "https://api.telegram.org".to_owned(),
            auth: AuthMode::UrlPath {
                prefix: "bot".to_owned(),
                credential_key: "bot_token".to_owned(),
            },
            host_patterns: vec!["api.telegram.org".to_owned()],
        },
        // Twilio authenticates with account SID + auth token over basic auth.
        ServiceSpec {
            name: "twilio".to_owned(),
            upstream: "https://api.twilio.com".to_owned(),
            auth: AuthMode::Basic {
                username_key: "account_sid".to_owned(),
                password_key: "auth_token".to_owned(),
            },
            host_patterns: vec!["api.twilio.com".to_owned()],
        },
        // Supabase wants the key both as `apikey` and as a bearer token.
        ServiceSpec {
            name: "supabase".to_owned(),
            upstream: "https://api.supabase.com".to_owned(),
            auth: AuthMode::HeaderMulti {
                pairs: vec![
                    HeaderPair {
                        header: "apikey".to_owned(),
                        prefix: None,
                        credential_key: "service_key".to_owned(),
                    },
                    HeaderPair {
                        header: "Authorization".to_owned(),
                        prefix: Some("Bearer ".to_owned()),
                        credential_key: "service_key".to_owned(),
                    },
                ],
            },
            host_patterns: vec!["*.supabase.co".to_owned()],
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ServiceRegistry;

    #[test]
    fn test_builtin_names_are_unique() {
        let services = builtin_services();
        let mut names: Vec<&str> = services.iter().map(|s| s.name.as_str()).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), services.len(), "duplicate builtin name");
    }

    #[test]
    fn test_builtins_pass_validation() {
        for spec in builtin_services() {
            ServiceRegistry::validate(&spec)
                .unwrap_or_else(|errors| panic!("builtin '{}' invalid: {errors:?}", spec.name));
        }
    }

    #[test]
    fn test_anthropic_injects_x_api_key() {
        let services = builtin_services();
        let anthropic = services.iter().find(|s| s.name == "anthropic").unwrap();
        match &anthropic.auth {
            AuthMode::Header {
                header,
                prefix,
                credential_key,
            } => {
                assert_eq!(header, "x-api-key");
                assert!(prefix.is_none());
                assert_eq!(credential_key, "api_key");
            }
            other => panic!("unexpected auth mode: {other:?}"),
        }
    }
}
