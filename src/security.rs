use regex::Regex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Named regex patterns that mark prompt-injection attempts.
fn injection_patterns() -> Vec<(&'static str, Regex)> {
    [
        (
            "ignore_instructions",
            r"(?i)ignore\s+(all\s+)?(previous|prior|above)\s+(instructions?|prompts?)",
        ),
        ("forget_command", r"(?i)forget\s+(everything|all|previous)"),
        (
            "role_change",
            r"(?i)you\s+are\s+now\s+(a|an)\s+(?:different|new)",
        ),
        ("pretend_command", r"(?i)pretend\s+(to\s+be|you\s+are)"),
        (
            "disregard_command",
            r"(?i)disregard\s+(all\s+)?(previous|prior|above)",
        ),
        ("override_command", r"(?i)override\s+(security|safety|instructions?)"),
        ("sudo_command", r"(?i)sudo\s+mode"),
        ("developer_mode", r"(?i)developer\s+mode"),
        ("jailbreak_attempt", r"(?i)jailbreak"),
    ]
    .into_iter()
    .filter_map(|(name, pattern)| Regex::new(pattern).ok().map(|re| (name, re)))
    .collect()
}

/// Words treated as toxic in model output. A deliberately crude heuristic,
/// gated behind a settings toggle.
const TOXIC_KEYWORDS: [&str; 7] = [
    "violence",
    "harmful",
    "dangerous",
    "offensive",
    "inappropriate",
    "toxic",
    "abusive",
];

/// Outcome of scanning one prompt for injection attempts.
#[derive(Debug, Clone, Serialize)]
pub struct InjectionReport {
    /// Labels of the patterns and keywords that matched
    pub flags: Vec<String>,
    /// 100 minus 15 per matched pattern, floored at 0
    pub score: u32,
    /// "high" above two matched patterns, "medium" for one or two, "low"
    /// when clean
    pub severity: String,
}

impl InjectionReport {
    pub fn is_clean(&self) -> bool {
        self.flags.is_empty()
    }
}

/// Scan a prompt against the fixed pattern set plus the configured keywords.
pub fn detect_injection(prompt: &str, extra_keywords: &[String]) -> InjectionReport {
    let lower = prompt.to_lowercase();
    let mut flags = Vec::new();

    for (name, pattern) in injection_patterns() {
        if pattern.is_match(prompt) {
            flags.push(name.to_string());
        }
    }
    for keyword in extra_keywords {
        let keyword = keyword.to_lowercase();
        if !keyword.is_empty() && lower.contains(&keyword) {
            let flag = format!("keyword:{}", keyword.replace(' ', "_"));
            if !flags.contains(&flag) {
                flags.push(flag);
            }
        }
    }

    let score = 100u32.saturating_sub(15 * flags.len() as u32);
    let severity = if flags.len() > 2 {
        "high"
    } else if !flags.is_empty() {
        "medium"
    } else {
        "low"
    };

    InjectionReport {
        score,
        severity: severity.to_string(),
        flags,
    }
}

/// Keyword heuristic for toxic model output.
pub fn detect_toxicity(text: &str) -> bool {
    let lower = text.to_lowercase();
    TOXIC_KEYWORDS.iter().any(|keyword| lower.contains(keyword))
}

/// Per-client sliding-window rate limiter keyed by IP address.
pub struct RateLimiter {
    max_requests: u32,
    window: Duration,
    requests: Mutex<HashMap<String, Vec<Instant>>>,
}

impl RateLimiter {
    pub fn new(max_requests_per_minute: u32) -> Self {
        Self {
            max_requests: max_requests_per_minute,
            window: Duration::from_secs(60),
            requests: Mutex::new(HashMap::new()),
        }
    }

    /// Record one request for the client. Returns false when the client has
    /// exhausted its window.
    pub fn check(&self, client: &str) -> bool {
        let now = Instant::now();
        let mut requests = match self.requests.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        let timestamps = requests.entry(client.to_string()).or_default();
        timestamps.retain(|t| now.duration_since(*t) < self.window);

        if timestamps.len() >= self.max_requests as usize {
            return false;
        }
        timestamps.push(now);
        true
    }
}

/// Resolve the client address for rate limiting, preferring proxy headers.
pub fn client_ip(headers: &axum::http::HeaderMap) -> String {
    if let Some(forwarded) = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
    {
        if let Some(first) = forwarded.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return first.to_string();
            }
        }
    }
    if let Some(real_ip) = headers.get("x-real-ip").and_then(|v| v.to_str().ok()) {
        let real_ip = real_ip.trim();
        if !real_ip.is_empty() {
            return real_ip.to_string();
        }
    }
    "unknown".to_string()
}
