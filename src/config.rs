use std::time::Duration;

/// Process-wide settings, read once from the environment at startup and
/// passed by value into the engine. No hidden globals.
#[derive(Debug, Clone)]
pub struct Settings {
    pub bind_addr: String,
    pub port: u16,

    pub llm_base_url: String,
    pub llm_api_key: String,
    pub search_api_key: String,

    // Model selection per agent.
    pub product_manager_model: String,
    pub finance_manager_model: String,
    pub marketing_strategist_model: String,
    pub leadgen_model: String,
    pub outbound_mail_model: String,
    pub call_prep_model: String,
    pub engineer_model: String,
    pub assistant_model: String,

    pub webhook_secret: String,
    pub internal_bearer_key: String,
    pub store_path: String,

    // Limiter knobs.
    pub k_global: usize,
    pub k_user: usize,
    pub bucket_capacity: f64,
    pub bucket_refill_per_sec: f64,

    // Agent execution.
    pub max_depth: usize,
    pub max_response_tokens: u32,

    // Research.
    pub research_max_sources: usize,
    pub per_source_char_cap: usize,

    // Timeouts.
    pub agent_deadline: Duration,
    pub research_deadline: Duration,
    pub webhook_ack_timeout: Duration,
    pub model_call_timeout: Duration,
    pub extended_model_call_timeout: Duration,
    pub fetch_timeout: Duration,

    // Cache TTLs.
    pub cache_ttl_model: Duration,
    pub cache_ttl_page: Duration,
    pub cache_ttl_research: Duration,

    // Workers.
    pub workers: usize,
    pub queue_poll_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub lease_ttl: Duration,
    pub shutdown_grace: Duration,

    // Conversation memory.
    pub memory_recent_verbatim: usize,
    pub memory_token_budget: usize,
}

fn env_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_secs(key: &str, default_secs: u64) -> Duration {
    Duration::from_secs(env_parse(key, default_secs))
}

impl Settings {
    pub fn from_env() -> Self {
        let default_model = env_str("CREWD_DEFAULT_MODEL", "nvidia/nemotron-4-340b-instruct");
        Self {
            bind_addr: env_str("CREWD_BIND", "127.0.0.1"),
            port: env_parse("CREWD_PORT", 8000),

            llm_base_url: env_str("CREWD_LLM_BASE_URL", "https://openrouter.ai/api/v1"),
            llm_api_key: env_str("CREWD_LLM_API_KEY", ""),
            search_api_key: env_str("CREWD_SEARCH_API_KEY", ""),

            product_manager_model: env_str("CREWD_PRODUCT_MANAGER_MODEL", &default_model),
            finance_manager_model: env_str("CREWD_FINANCE_MANAGER_MODEL", &default_model),
            marketing_strategist_model: env_str("CREWD_MARKETING_STRATEGIST_MODEL", &default_model),
            leadgen_model: env_str("CREWD_LEADGEN_MODEL", &default_model),
            outbound_mail_model: env_str("CREWD_OUTBOUND_MAIL_MODEL", &default_model),
            call_prep_model: env_str("CREWD_CALL_PREP_MODEL", &default_model),
            engineer_model: env_str("CREWD_ENGINEER_MODEL", "anthropic/claude-3-haiku"),
            assistant_model: env_str("CREWD_ASSISTANT_MODEL", &default_model),

            webhook_secret: env_str("CREWD_WEBHOOK_SECRET", "change-this-in-production"),
            internal_bearer_key: env_str("CREWD_INTERNAL_BEARER_KEY", "change-this-in-production"),
            store_path: env_str("CREWD_STORE_PATH", "crewd.db"),

            k_global: env_parse("CREWD_MAX_CONCURRENT_MODEL_CALLS", 3),
            k_user: env_parse("CREWD_MAX_CONCURRENT_MODEL_CALLS_PER_USER", 2),
            bucket_capacity: env_parse("CREWD_BUCKET_CAPACITY", 60.0),
            bucket_refill_per_sec: env_parse("CREWD_BUCKET_REFILL_PER_SEC", 1.0),

            max_depth: env_parse("CREWD_MAX_DELEGATION_DEPTH", 3),
            max_response_tokens: env_parse("CREWD_MAX_RESPONSE_TOKENS", 2000),

            research_max_sources: env_parse("CREWD_RESEARCH_MAX_SOURCES", 5),
            per_source_char_cap: env_parse("CREWD_PER_SOURCE_CHAR_CAP", 8000),

            agent_deadline: env_secs("CREWD_AGENT_DEADLINE_SECS", 60),
            research_deadline: env_secs("CREWD_RESEARCH_DEADLINE_SECS", 120),
            webhook_ack_timeout: env_secs("CREWD_WEBHOOK_ACK_SECS", 1),
            model_call_timeout: env_secs("CREWD_MODEL_CALL_TIMEOUT_SECS", 30),
            extended_model_call_timeout: env_secs("CREWD_EXTENDED_MODEL_CALL_TIMEOUT_SECS", 60),
            fetch_timeout: env_secs("CREWD_SCRAPE_TIMEOUT_SECS", 15),

            cache_ttl_model: env_secs("CREWD_MODEL_CACHE_TTL_SECS", 86_400),
            cache_ttl_page: env_secs("CREWD_PAGE_CACHE_TTL_SECS", 86_400),
            cache_ttl_research: env_secs("CREWD_RESEARCH_CACHE_TTL_SECS", 21_600),

            workers: env_parse("CREWD_WORKERS", 4),
            queue_poll_timeout: env_secs("CREWD_QUEUE_POLL_SECS", 30),
            heartbeat_interval: env_secs("CREWD_HEARTBEAT_SECS", 10),
            lease_ttl: env_secs("CREWD_LEASE_TTL_SECS", 30),
            shutdown_grace: env_secs("CREWD_SHUTDOWN_GRACE_SECS", 10),

            memory_recent_verbatim: env_parse("CREWD_MEMORY_RECENT_VERBATIM", 10),
            memory_token_budget: env_parse("CREWD_MEMORY_TOKEN_BUDGET", 3000),
        }
    }

    /// Model id configured for an agent. Unknown ids fall back to the
    /// assistant's model; the registry rejects unknown agents before this
    /// is consulted on any hot path.
    pub fn model_for(&self, agent_id: &str) -> &str {
        match agent_id {
            "product_manager" => &self.product_manager_model,
            "finance_manager" => &self.finance_manager_model,
            "marketing_strategist" => &self.marketing_strategist_model,
            "leadgen" => &self.leadgen_model,
            "outbound_mail" => &self.outbound_mail_model,
            "call_prep" => &self.call_prep_model,
            "engineer" => &self.engineer_model,
            _ => &self.assistant_model,
        }
    }

    /// Per-attempt model call timeout for an agent's timeout class.
    pub fn model_timeout_for(&self, extended: bool) -> Duration {
        if extended {
            self.extended_model_call_timeout
        } else {
            self.model_call_timeout
        }
    }

    #[cfg(test)]
    pub fn for_tests() -> Self {
        let mut s = Self::from_env();
        s.store_path = ":memory:".to_string();
        s.webhook_secret = "test-webhook-secret".to_string();
        s.internal_bearer_key = "test-bearer-key".to_string();
        s
    }
}
