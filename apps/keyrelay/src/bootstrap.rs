//! Wires configuration into a running `Core`: seeds each configured
//! service's provider from its comma-separated secret list, spawns the
//! background checker when enabled, and registers upstream endpoints.
//! Mirrors the shape (not the storage-backed content) of the teacher's
//! `gproxy-core::bootstrap::bootstrap_from_env`.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use keyrelay_core::{Core, UpstreamProxy};
use keyrelay_provider_core::{EventHub, KeyPool, TerminalEventSink};
use keyrelay_provider_impl::{
    AnthropicProbe, ApiKeyProvider, CheckerConfig, GoogleProbe, KeyChecker, KeyProbe, OpenAiProbe,
};

use crate::cli::CliArgs;

pub struct Bootstrap {
    pub core: Core,
}

/// Splits a comma-separated secret list, trims whitespace, drops empty
/// entries, and dedupes by exact string (§3 Lifecycle) so a repeated
/// secret never produces two `KeyRecord`s sharing a hash.
fn split_secrets(raw: &str) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .filter(|s| seen.insert(s.to_string()))
        .map(str::to_string)
        .collect()
}

pub async fn bootstrap(args: &CliArgs) -> anyhow::Result<Bootstrap> {
    let services: [(&str, Option<&str>, &'static str, Arc<dyn KeyProbe>); 3] = [
        ("openai", args.openai_key.as_deref(), "https://api.openai.com", Arc::new(OpenAiProbe::default())),
        (
            "anthropic",
            args.anthropic_key.as_deref(),
            "https://api.anthropic.com",
            Arc::new(AnthropicProbe::default()),
        ),
        (
            "google-ai",
            args.google_ai_key.as_deref(),
            "https://generativelanguage.googleapis.com",
            Arc::new(GoogleProbe::default()),
        ),
    ];

    if services.iter().all(|(_, secrets, ..)| secrets.map(|s| split_secrets(s).is_empty()).unwrap_or(true)) {
        bail!("NoKeysConfigured: at least one of OPENAI_KEY, ANTHROPIC_KEY, GOOGLE_AI_KEY must be set");
    }

    let events = EventHub::new(1024);
    events.add_sink(Arc::new(TerminalEventSink::new())).await;

    let mut pool = KeyPool::new(vec![
        ("gpt-".to_string(), "openai".to_string()),
        ("text-".to_string(), "openai".to_string()),
        ("dall-e".to_string(), "openai".to_string()),
        ("claude-".to_string(), "anthropic".to_string()),
        ("gemini-".to_string(), "google-ai".to_string()),
    ]);

    let client = wreq::Client::builder().build().context("build upstream http client")?;
    let mut upstream = UpstreamProxy::new(client);

    for (service, secrets, base_url, probe) in services {
        let Some(secrets) = secrets.map(split_secrets) else { continue };
        if secrets.is_empty() {
            continue;
        }

        let provider = ApiKeyProvider::new(service, events.clone()).with_timing(
            Duration::from_millis(args.key_reuse_delay_millis),
            Duration::from_millis(args.lockout_window_millis),
        );
        for secret in secrets {
            provider.add_key(secret).await;
        }
        let provider = Arc::new(provider);

        if args.check_keys {
            let checker = Arc::new(KeyChecker::new(provider.clone(), probe, CheckerConfig::default()));
            checker.spawn();
        }

        pool.register(provider);
        upstream.register(service, service_endpoint(service, base_url));
    }

    if args.prompt_logging {
        tracing::info!("prompt logging requested; wire a request-body sink at the HTTP edge to enable it");
    }

    let pool = Arc::new(pool);
    let core = Core::new(pool, upstream);
    Ok(Bootstrap { core })
}

fn service_endpoint(service: &str, base_url: &str) -> keyrelay_core::ServiceEndpoint {
    use keyrelay_core::ServiceFamily;
    let family = match service {
        "openai" => ServiceFamily::OpenAi,
        "anthropic" => ServiceFamily::Anthropic,
        "google-ai" => ServiceFamily::GoogleAi,
        other => unreachable!("no endpoint family for service '{other}'"),
    };
    keyrelay_core::ServiceEndpoint { base_url: base_url.to_string(), family }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_secrets_dedupes_exact_string_matches() {
        assert_eq!(split_secrets("sk-a,sk-a, sk-b ,sk-a"), vec!["sk-a", "sk-b"]);
    }

    #[test]
    fn split_secrets_drops_empty_entries() {
        assert_eq!(split_secrets("sk-a,,  ,sk-b"), vec!["sk-a", "sk-b"]);
    }
}
