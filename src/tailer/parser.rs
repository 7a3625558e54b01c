//! Backend log line grammar
//!
//! Lines look like `[YYYY-MM-DD HH:MM:SS][LEVEL] message`. Malformed lines
//! are ignored. Well-formed lines always become `debug_log` events; a
//! subset of messages additionally yield typed telemetry events.

use crate::bus::events;
use regex::Regex;
use serde_json::{json, Map, Number, Value};
use std::sync::LazyLock;

static LINE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\[(\d{4}-\d{2}-\d{2} \d{2}:\d{2}:\d{2})\]\[(INFO|DEBUG|WARN|ERROR)\] (.*)$")
        .expect("valid line regex")
});

static KV_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"([a-z_]+)\s*=\s*(-?\d+(?:\.\d+)?)").expect("valid kv regex"));

static PROGRESS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Prompt processing progress:\s*(-?\d+(?:\.\d+)?)%").expect("valid progress regex")
});

static CACHE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"Cache reuse summary:\s*(\d+)/(\d+) of prompt \((\d+(?:\.\d+)?)%\),\s*(\d+) prefix,\s*(\d+) non-prefix",
    )
    .expect("valid cache regex")
});

static GENERATE_KV_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(n_ctx|n_batch|n_predict|n_keep)\s*=\s*(-?\d+)").expect("valid generate regex")
});

static TOTAL_PROMPT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Total prompt tokens:\s*(\d+)").expect("valid total regex"));

static DECODE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Prompt tokens to decode:\s*(\d+)").expect("valid decode regex"));

/// Sampling parameter names the backend is known to print.
const SAMPLING_KEYS: &[&str] = &[
    "repeat_last_n",
    "repeat_penalty",
    "frequency_penalty",
    "presence_penalty",
    "dry_multiplier",
    "dry_base",
    "dry_allowed_length",
    "dry_penalty_last_n",
    "top_k",
    "top_p",
    "min_p",
    "xtc_probability",
    "xtc_threshold",
    "typical_p",
    "top_n_sigma",
    "temp",
    "mirostat",
    "mirostat_lr",
    "mirostat_ent",
];

/// A structurally valid log line.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedLine {
    pub timestamp: String,
    pub level: String,
    pub message: String,
}

/// Parse one line. Returns None for anything outside the grammar.
pub fn parse_line(line: &str) -> Option<ParsedLine> {
    let caps = LINE_RE.captures(line)?;
    Some(ParsedLine {
        timestamp: caps[1].to_string(),
        level: caps[2].to_string(),
        message: caps[3].to_string(),
    })
}

/// Typed events extracted from a message, in addition to its `debug_log`.
pub fn extract_events(message: &str) -> Vec<(&'static str, Value)> {
    let mut out = Vec::new();

    if message.contains("Running chat completion on conversation") {
        out.push((events::CHAT_START, json!({ "message": message })));
    }

    if message.contains("Sampling params:") {
        let mut params = Map::new();
        for caps in KV_RE.captures_iter(message) {
            let key = &caps[1];
            if !SAMPLING_KEYS.contains(&key) {
                continue;
            }
            if let Some(value) = parse_number(&caps[2]) {
                params.insert(key.to_string(), value);
            }
        }
        if !params.is_empty() {
            out.push((events::SAMPLING_PARAMS, Value::Object(params)));
        }
    }

    if let Some(caps) = PROGRESS_RE.captures(message) {
        if let Ok(progress) = caps[1].parse::<f64>() {
            out.push((
                events::PROMPT_PROGRESS,
                json!({
                    "progress": progress.clamp(0.0, 100.0),
                    "message": message,
                }),
            ));
        }
    }

    if let Some(caps) = CACHE_RE.captures(message) {
        let ints: Option<(u64, u64, u64, u64)> = (|| {
            Some((
                caps[1].parse().ok()?,
                caps[2].parse().ok()?,
                caps[4].parse().ok()?,
                caps[5].parse().ok()?,
            ))
        })();
        if let (Some((reused, total, prefix, non_prefix)), Ok(percentage)) =
            (ints, caps[3].parse::<f64>())
        {
            out.push((
                events::CACHE_STATS,
                json!({
                    "reused": reused,
                    "total": total,
                    "percentage": percentage,
                    "prefix": prefix,
                    "non_prefix": non_prefix,
                    "message": message,
                }),
            ));
        }
    }

    if message.contains("Generate:") {
        let mut fields = Map::new();
        for caps in GENERATE_KV_RE.captures_iter(message) {
            if let Ok(n) = caps[2].parse::<i64>() {
                fields.insert(caps[1].to_string(), Value::Number(n.into()));
            }
        }
        if !fields.is_empty() {
            out.push((events::TOKEN_INFO, Value::Object(fields)));
        }
    }
    if let Some(caps) = TOTAL_PROMPT_RE.captures(message) {
        if let Ok(n) = caps[1].parse::<u64>() {
            out.push((events::TOKEN_INFO, json!({ "total_prompt_tokens": n })));
        }
    }
    if let Some(caps) = DECODE_RE.captures(message) {
        if let Ok(n) = caps[1].parse::<u64>() {
            out.push((events::TOKEN_INFO, json!({ "prompt_tokens_to_decode": n })));
        }
    }

    if message.contains("BeginProcessingPrompt") {
        out.push((
            events::PROCESSING_START,
            json!({ "message": "Prompt processing started" }),
        ));
    }

    out
}

fn parse_number(raw: &str) -> Option<Value> {
    if raw.contains('.') {
        Number::from_f64(raw.parse::<f64>().ok()?).map(Value::Number)
    } else {
        raw.parse::<i64>().ok().map(|n| Value::Number(n.into()))
    }
}
