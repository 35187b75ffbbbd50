//! Noise rejection ahead of the LLM.
//!
//! Pure predicates over message text (pipeline granularity) and extracted
//! facts (post-filter granularity). Everything here must stay reproducible
//! in isolation — no I/O, no config beyond the two length thresholds.

use regex::Regex;

use engram_core::config::NoiseConfig;

pub struct NoiseFilter {
    min_chars: usize,
    max_chars: usize,
    denial: Regex,
    meta_question: Regex,
    boilerplate: Regex,
    log_prefix: Regex,
}

impl NoiseFilter {
    pub fn new(config: &NoiseConfig) -> Self {
        Self {
            min_chars: config.min_chars,
            max_chars: config.max_chars,
            // "I don't have data / recall / remember", EN + ZH
            denial: Regex::new(
                r"(?i)\b(i (don't|dont|do not) (have|recall|remember|know)|no (data|information|record) (about|on|of))\b|我不知道|我沒有|我没有|不记得|不記得|沒有相關|没有相关",
            )
            .expect("denial pattern"),
            // "do you remember…" and friends
            meta_question: Regex::new(
                r"(?i)\b(do you (remember|recall|know)|what did (i|we) (say|tell)|can you remember)\b|你记得|你記得|还记得|還記得",
            )
            .expect("meta-question pattern"),
            // greetings and bare acknowledgements, EN + ZH
            boilerplate: Regex::new(
                r"(?i)^(hi|hello|hey|thanks|thank you|thx|ok|okay|sure|yes|no|yep|nope|got it|sounds good|will do|你好|謝謝|谢谢|好的|收到|嗯|是的)[.!?。！～]*$",
            )
            .expect("boilerplate pattern"),
            log_prefix: Regex::new(
                r"^(\[?\d{4}-\d{2}-\d{2}[T ]\d{2}:\d{2}|\[?(INFO|WARN|WARNING|ERROR|DEBUG|TRACE)\]?[: ])",
            )
            .expect("log-prefix pattern"),
        }
    }

    /// Message-granularity check used before extraction.
    pub fn is_noise_message(&self, text: &str) -> bool {
        let t = text.trim();
        if t.chars().count() < self.min_chars || t.chars().count() > self.max_chars {
            return true;
        }
        if self.denial.is_match(t) || self.meta_question.is_match(t) || self.boilerplate.is_match(t)
        {
            return true;
        }
        if is_fenced_code_block(t) || is_pure_json(t) || is_markdown_skeleton(t) {
            return true;
        }
        // A message that is nothing but log lines is tool output, not speech.
        t.lines().all(|l| {
            let l = l.trim();
            l.is_empty() || self.log_prefix.is_match(l)
        })
    }

    /// Fact-granularity post-filter over extractor output. Length ceilings do
    /// not apply — long values are legitimate — but denials and meta noise
    /// that leaked through the model are dropped.
    pub fn is_noise_fact(&self, _key: &str, value: &str) -> bool {
        let v = value.trim();
        if v.chars().count() < 2 {
            return true;
        }
        self.denial.is_match(v) || self.meta_question.is_match(v) || self.boilerplate.is_match(v)
    }
}

/// Entirely a fenced code block (``` … ```).
fn is_fenced_code_block(text: &str) -> bool {
    let t = text.trim();
    t.starts_with("```") && t.ends_with("```") && t.len() > 6
}

/// Parses as JSON object/array — raw payloads pasted into chat.
fn is_pure_json(text: &str) -> bool {
    let t = text.trim();
    if !(t.starts_with('{') || t.starts_with('[')) {
        return false;
    }
    serde_json::from_str::<serde_json::Value>(t).is_ok()
}

/// A single line that is only a markdown header or a bare list marker.
fn is_markdown_skeleton(text: &str) -> bool {
    let t = text.trim();
    if t.lines().count() != 1 {
        return false;
    }
    let hashes = t.chars().take_while(|c| *c == '#').count();
    let header = (1..=6).contains(&hashes)
        && t.chars().nth(hashes).map_or(true, |c| c == ' ');
    let marker = matches!(t, "-" | "*" | "+") || {
        let rest = t
            .strip_prefix("- ")
            .or_else(|| t.strip_prefix("* "))
            .or_else(|| t.strip_prefix("+ "));
        rest.is_some_and(|r| r.trim().is_empty())
    };
    header || marker
}
