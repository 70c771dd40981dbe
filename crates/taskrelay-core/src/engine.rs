//! External AI execution engines and the requested-engine choice.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::CoreError;

/// An external AI execution backend a task can be dispatched to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Engine {
    Gemini,
    Claude,
    Codex,
    Glm,
    Grok,
}

impl Engine {
    /// Every known engine.
    pub const ALL: [Engine; 5] = [
        Self::Gemini,
        Self::Claude,
        Self::Codex,
        Self::Glm,
        Self::Grok,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Gemini => "gemini",
            Self::Claude => "claude",
            Self::Codex => "codex",
            Self::Glm => "glm",
            Self::Grok => "grok",
        }
    }
}

impl fmt::Display for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Engine {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.trim();
        Self::ALL
            .into_iter()
            .find(|engine| engine.as_str().eq_ignore_ascii_case(name))
            .ok_or_else(|| CoreError::UnknownEngine(s.to_string()))
    }
}

/// Engine requested at task creation: routed automatically or pinned.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineChoice {
    #[default]
    Auto,
    #[serde(untagged)]
    Specific(Engine),
}

impl EngineChoice {
    pub fn is_auto(&self) -> bool {
        matches!(self, Self::Auto)
    }

    /// The pinned engine, if any.
    pub fn engine(&self) -> Option<Engine> {
        match self {
            Self::Auto => None,
            Self::Specific(engine) => Some(*engine),
        }
    }
}

impl fmt::Display for EngineChoice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Auto => f.write_str("auto"),
            Self::Specific(engine) => engine.fmt(f),
        }
    }
}

impl FromStr for EngineChoice {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim().is_empty() || s.trim().eq_ignore_ascii_case("auto") {
            return Ok(Self::Auto);
        }
        s.parse().map(Self::Specific)
    }
}

impl From<Engine> for EngineChoice {
    fn from(engine: Engine) -> Self {
        Self::Specific(engine)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_engine_choice() {
        assert_eq!("auto".parse::<EngineChoice>().unwrap(), EngineChoice::Auto);
        assert_eq!("".parse::<EngineChoice>().unwrap(), EngineChoice::Auto);
        assert_eq!(
            "Claude".parse::<EngineChoice>().unwrap(),
            EngineChoice::Specific(Engine::Claude)
        );
        assert!(matches!(
            "gpt".parse::<EngineChoice>(),
            Err(CoreError::UnknownEngine(_))
        ));
    }

    #[test]
    fn test_engine_choice_serde() {
        let json = serde_json::to_string(&EngineChoice::Specific(Engine::Grok)).unwrap();
        assert_eq!(json, "\"grok\"");
        let auto: EngineChoice = serde_json::from_str("\"auto\"").unwrap();
        assert_eq!(auto, EngineChoice::Auto);
        let glm: EngineChoice = serde_json::from_str("\"glm\"").unwrap();
        assert_eq!(glm, EngineChoice::Specific(Engine::Glm));
    }
}
