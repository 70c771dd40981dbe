//! Workload analysis and engine recommendation.
//!
//! The analyzer is a pure function of its input. It estimates token usage,
//! scans the prompt (and optional spec description) for capability,
//! complexity and priority keywords, and maps the result through a fixed
//! decision table to an ordered engine preference list.

use serde::{Deserialize, Serialize};

use crate::{CoreError, Engine};

const STREAMING_KEYWORDS: &[&str] = &["stream", "real-time", "realtime", "live ", "interactive"];

const VISION_KEYWORDS: &[&str] = &[
    "image",
    "screenshot",
    "diagram",
    "photo",
    "picture",
    "visual",
    "chart",
];

const FUNCTION_CALLING_KEYWORDS: &[&str] = &[
    "function call",
    "tool call",
    "tool use",
    "api call",
    "invoke",
    "json schema",
];

const COMPLEX_KEYWORDS: &[&str] = &[
    "architecture",
    "refactor",
    "redesign",
    "distributed",
    "optimize",
    "migrate",
    "security audit",
    "concurrency",
];

const MEDIUM_KEYWORDS: &[&str] = &["implement", "review", "analyze", "analyse", "debug", "test"];

const HIGH_PRIORITY_KEYWORDS: &[&str] = &[
    "urgent",
    "asap",
    "critical",
    "immediately",
    "hotfix",
    "production down",
];

const LOW_PRIORITY_KEYWORDS: &[&str] = &[
    "no rush",
    "low priority",
    "when possible",
    "eventually",
    "background",
];

/// Token-size bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SizeClass {
    Tiny,
    Small,
    Medium,
    Large,
    Xlarge,
}

impl SizeClass {
    pub fn from_tokens(tokens: u64) -> Self {
        match tokens {
            t if t < 500 => Self::Tiny,
            t if t < 2_000 => Self::Small,
            t if t < 10_000 => Self::Medium,
            t if t < 50_000 => Self::Large,
            _ => Self::Xlarge,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Complexity {
    Simple,
    Medium,
    Complex,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PriorityLevel {
    Low,
    Normal,
    High,
}

impl PriorityLevel {
    /// Map a task's numeric 1-10 priority onto a level.
    pub fn from_numeric(priority: u8) -> Self {
        match priority {
            0..=3 => Self::Low,
            4..=7 => Self::Normal,
            _ => Self::High,
        }
    }
}

/// Input to [`WorkloadAnalyzer::analyze`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkloadRequest {
    /// Prompt text sent to the engine.
    pub prompt: String,

    /// Optional longer description of the work.
    pub spec_description: Option<String>,

    /// Output token budget, if the caller set one.
    pub max_tokens: Option<i64>,

    /// Numeric task priority. Overrides keyword-derived priority when set.
    pub priority: Option<u8>,
}

impl WorkloadRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Default::default()
        }
    }

    pub fn with_spec_description(mut self, spec: impl Into<String>) -> Self {
        self.spec_description = Some(spec.into());
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: i64) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }
}

/// Derived characteristics of a request. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadCharacteristics {
    pub estimated_tokens: u64,
    pub size_class: SizeClass,
    pub requires_streaming: bool,
    pub requires_vision: bool,
    pub requires_function_calling: bool,
    pub complexity: Complexity,
    pub priority: PriorityLevel,
}

/// Routing guidance for a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recommendation {
    /// Engines in order of preference.
    pub engines: Vec<Engine>,
    pub reason: String,
    pub cost_optimized: bool,
    pub speed_optimized: bool,
}

impl Recommendation {
    fn new(engines: &[Engine], reason: &str) -> Self {
        Self {
            engines: engines.to_vec(),
            reason: reason.to_string(),
            cost_optimized: false,
            speed_optimized: false,
        }
    }

    fn cost(mut self) -> Self {
        self.cost_optimized = true;
        self
    }

    fn speed(mut self) -> Self {
        self.speed_optimized = true;
        self
    }

    /// The most preferred engine.
    pub fn primary(&self) -> Option<Engine> {
        self.engines.first().copied()
    }
}

/// Stateless request classifier.
#[derive(Debug, Clone, Copy, Default)]
pub struct WorkloadAnalyzer;

impl WorkloadAnalyzer {
    pub fn new() -> Self {
        Self
    }

    /// Classify a request.
    pub fn analyze(&self, request: &WorkloadRequest) -> Result<WorkloadCharacteristics, CoreError> {
        if request.prompt.trim().is_empty() {
            return Err(CoreError::InvalidInput(
                "prompt must be a non-empty string".to_string(),
            ));
        }
        let max_tokens = match request.max_tokens {
            Some(t) if t < 0 => {
                return Err(CoreError::InvalidInput(format!(
                    "max_tokens must be a non-negative integer, got {t}"
                )))
            }
            Some(t) => Some(t as u64),
            None => None,
        };

        let prompt_tokens = (request.prompt.chars().count() as u64).div_ceil(4);
        let output_tokens = max_tokens.unwrap_or_else(|| (prompt_tokens as f64 * 0.35).ceil() as u64);
        let estimated_tokens = prompt_tokens + output_tokens;

        let mut text = request.prompt.to_lowercase();
        if let Some(spec) = &request.spec_description {
            text.push('\n');
            text.push_str(&spec.to_lowercase());
        }
        let text_tokens = text.chars().count() as u64 / 4;

        let priority = match request.priority {
            Some(p) => PriorityLevel::from_numeric(p),
            None => keyword_priority(&text),
        };

        Ok(WorkloadCharacteristics {
            estimated_tokens,
            size_class: SizeClass::from_tokens(estimated_tokens),
            requires_streaming: contains_any(&text, STREAMING_KEYWORDS),
            requires_vision: contains_any(&text, VISION_KEYWORDS),
            requires_function_calling: contains_any(&text, FUNCTION_CALLING_KEYWORDS),
            complexity: complexity(&text, text_tokens),
            priority,
        })
    }

    /// Map characteristics to an engine preference list.
    ///
    /// Branches are evaluated top to bottom and the first match wins.
    pub fn recommend(&self, c: &WorkloadCharacteristics) -> Recommendation {
        use Engine::*;

        if c.size_class == SizeClass::Xlarge {
            return Recommendation::new(
                &[Gemini, Claude, Codex],
                "very large context: prefer the longest context window",
            );
        }
        if c.requires_streaming && c.priority == PriorityLevel::High {
            return Recommendation::new(
                &[Grok, Claude, Gemini],
                "streaming with high priority: prefer lowest latency",
            )
            .speed();
        }
        if c.requires_vision {
            return Recommendation::new(&[Gemini, Claude, Grok], "vision input required");
        }
        if c.requires_function_calling {
            return Recommendation::new(&[Claude, Codex, Gemini], "function calling required");
        }
        if c.complexity == Complexity::Complex {
            return Recommendation::new(
                &[Claude, Codex, Gemini],
                "complex task: prefer strongest reasoning",
            );
        }
        if c.priority == PriorityLevel::High {
            return Recommendation::new(&[Grok, Gemini, Claude], "high priority: prefer speed")
                .speed();
        }
        if matches!(c.size_class, SizeClass::Tiny | SizeClass::Small)
            && c.complexity == Complexity::Simple
        {
            return Recommendation::new(&[Glm, Grok, Gemini], "small simple task: prefer lowest cost")
                .cost()
                .speed();
        }
        if c.size_class == SizeClass::Large {
            return Recommendation::new(&[Gemini, Claude, Codex], "large context").cost();
        }
        if c.priority == PriorityLevel::Low {
            return Recommendation::new(&[Glm, Gemini, Codex], "low priority: prefer lowest cost")
                .cost();
        }
        Recommendation::new(&[Claude, Gemini, Codex], "balanced default")
    }

    /// `analyze` followed by `recommend`.
    pub fn route(&self, request: &WorkloadRequest) -> Result<Recommendation, CoreError> {
        self.analyze(request).map(|c| self.recommend(&c))
    }
}

fn contains_any(text: &str, keywords: &[&str]) -> bool {
    keywords.iter().any(|k| text.contains(k))
}

fn keyword_priority(text: &str) -> PriorityLevel {
    if contains_any(text, HIGH_PRIORITY_KEYWORDS) {
        PriorityLevel::High
    } else if contains_any(text, LOW_PRIORITY_KEYWORDS) {
        PriorityLevel::Low
    } else {
        PriorityLevel::Normal
    }
}

fn complexity(text: &str, text_tokens: u64) -> Complexity {
    let by_keyword = if contains_any(text, COMPLEX_KEYWORDS) {
        Complexity::Complex
    } else if contains_any(text, MEDIUM_KEYWORDS) {
        Complexity::Medium
    } else {
        Complexity::Simple
    };
    let by_size = if text_tokens > 2_000 {
        Complexity::Complex
    } else if text_tokens > 500 {
        Complexity::Medium
    } else {
        Complexity::Simple
    };
    by_keyword.max(by_size)
}
