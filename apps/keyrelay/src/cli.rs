use clap::Parser;

/// Recognised configuration, §6: one comma-separated secret list per
/// service, plus the switches that tune checking, logging, and timing.
/// clap gives CLI flags and env vars the same name for free.
#[derive(Debug, Clone, Parser)]
#[command(name = "keyrelay", version, about = "Multiplexing reverse proxy for generative AI API credentials")]
pub struct CliArgs {
    #[arg(long, env = "OPENAI_KEY")]
    pub openai_key: Option<String>,

    #[arg(long, env = "ANTHROPIC_KEY")]
    pub anthropic_key: Option<String>,

    #[arg(long, env = "GOOGLE_AI_KEY")]
    pub google_ai_key: Option<String>,

    #[arg(long, env = "CHECK_KEYS", default_value_t = true)]
    pub check_keys: bool,

    #[arg(long, env = "PROMPT_LOGGING", default_value_t = false)]
    pub prompt_logging: bool,

    /// Millis a key stays deprioritized after a genuine 429, applied to
    /// every service uniformly; §4.1 names per-service values as a future
    /// refinement, not a day-one requirement.
    #[arg(long, env = "LOCKOUT_WINDOW_MILLIS", default_value_t = 20_000)]
    pub lockout_window_millis: u64,

    #[arg(long, env = "KEY_REUSE_DELAY_MILLIS", default_value_t = 500)]
    pub key_reuse_delay_millis: u64,

    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    pub host: String,

    #[arg(long, env = "PORT", default_value_t = 8080)]
    pub port: u16,
}
