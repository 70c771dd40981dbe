//! Command-line configuration.

use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use clap::Parser;
use thiserror::Error;

use taskrelay_core::Engine;
use taskrelay_engine::{BreakerConfig, CoalescerConfig, EngineConfig};

/// TaskRelay MCP server.
#[derive(Parser, Debug)]
#[command(
    name = "taskrelay-server",
    about = "Resilient multi-engine task execution over MCP"
)]
pub struct Args {
    /// HTTP address serving /mcp, /health and /metrics
    #[arg(long, default_value = "127.0.0.1:50060")]
    pub http_addr: String,

    /// Failures within the window that open an engine's circuit
    #[arg(long, default_value = "5")]
    pub failure_threshold: u32,

    /// Half-open successes that close an engine's circuit
    #[arg(long, default_value = "3")]
    pub success_threshold: u32,

    /// Milliseconds an open circuit waits before admitting trial requests
    #[arg(long, default_value = "30000")]
    pub reset_timeout_ms: u64,

    /// Sliding failure window in milliseconds
    #[arg(long, default_value = "60000")]
    pub failure_window_ms: u64,

    /// Concurrent trial requests allowed while half-open
    #[arg(long, default_value = "1")]
    pub half_open_max_requests: u32,

    /// Hard timeout for one engine execution, in milliseconds
    #[arg(long, default_value = "120000")]
    pub execution_timeout_ms: u64,

    /// In-flight executions above which coalescing is bypassed
    #[arg(long, default_value = "1000")]
    pub max_pending: usize,

    /// Deepest delegation chain accepted by create_task
    #[arg(long, default_value = "3")]
    pub max_delegation_depth: u32,

    /// Seconds between expired-task sweeps
    #[arg(long, default_value = "300")]
    pub sweep_interval_secs: u64,

    /// Engine CLI override, e.g. `--engine-command "claude=claude -p"`.
    /// May be repeated. Engines without an override run a program named
    /// after the engine.
    #[arg(long = "engine-command", value_name = "ENGINE=COMMAND")]
    pub engine_commands: Vec<EngineCommandArg>,
}

impl Args {
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            breaker: BreakerConfig {
                failure_threshold: self.failure_threshold,
                success_threshold: self.success_threshold,
                reset_timeout: Duration::from_millis(self.reset_timeout_ms),
                failure_window: Duration::from_millis(self.failure_window_ms),
                half_open_max_requests: self.half_open_max_requests,
            },
            coalescer: CoalescerConfig {
                max_pending: self.max_pending,
                timeout: Duration::from_millis(self.execution_timeout_ms),
            },
            max_delegation_depth: self.max_delegation_depth,
            ..EngineConfig::default()
        }
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    /// Command lines keyed by engine, last override wins.
    pub fn engine_commands(&self) -> HashMap<Engine, EngineCommand> {
        self.engine_commands
            .iter()
            .map(|arg| (arg.engine, arg.command.clone()))
            .collect()
    }
}

/// A program and its leading arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl EngineCommand {
    /// Run a program named after the engine, with no arguments.
    pub fn default_for(engine: Engine) -> Self {
        Self {
            program: engine.as_str().to_string(),
            args: Vec::new(),
        }
    }
}

/// Parsed `ENGINE=COMMAND` argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineCommandArg {
    pub engine: Engine,
    pub command: EngineCommand,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EngineCommandParseError {
    #[error("expected ENGINE=COMMAND, got '{0}'")]
    MissingSeparator(String),

    #[error("unknown engine '{0}'")]
    UnknownEngine(String),

    #[error("empty command for engine '{0}'")]
    EmptyCommand(String),
}

impl FromStr for EngineCommandArg {
    type Err = EngineCommandParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (name, command) = s
            .split_once('=')
            .ok_or_else(|| EngineCommandParseError::MissingSeparator(s.to_string()))?;
        let engine: Engine = name
            .trim()
            .parse()
            .map_err(|_| EngineCommandParseError::UnknownEngine(name.trim().to_string()))?;

        let mut words = command.split_whitespace().map(str::to_string);
        let program = words
            .next()
            .ok_or_else(|| EngineCommandParseError::EmptyCommand(name.trim().to_string()))?;

        Ok(Self {
            engine,
            command: EngineCommand {
                program,
                args: words.collect(),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_engine_config() {
        let args = Args::parse_from(["taskrelay-server"]);
        let config = args.engine_config();
        let defaults = EngineConfig::default();

        assert_eq!(config.breaker.failure_threshold, defaults.breaker.failure_threshold);
        assert_eq!(config.breaker.reset_timeout, defaults.breaker.reset_timeout);
        assert_eq!(config.coalescer.timeout, defaults.coalescer.timeout);
        assert_eq!(config.max_delegation_depth, 3);
        assert!(args.engine_commands().is_empty());
    }

    #[test]
    fn test_engine_command_overrides() {
        let args = Args::parse_from([
            "taskrelay-server",
            "--engine-command",
            "claude=claude -p --output-format json",
            "--engine-command",
            "GLM=/opt/glm/bin/glm",
            "--failure-threshold",
            "2",
        ]);
        let commands = args.engine_commands();

        assert_eq!(commands[&Engine::Claude].program, "claude");
        assert_eq!(
            commands[&Engine::Claude].args,
            vec!["-p", "--output-format", "json"]
        );
        assert_eq!(commands[&Engine::Glm].program, "/opt/glm/bin/glm");
        assert_eq!(args.engine_config().breaker.failure_threshold, 2);
    }

    #[test]
    fn test_engine_command_parse_errors() {
        assert_eq!(
            "claude".parse::<EngineCommandArg>(),
            Err(EngineCommandParseError::MissingSeparator("claude".to_string()))
        );
        assert_eq!(
            "gpt=gpt".parse::<EngineCommandArg>(),
            Err(EngineCommandParseError::UnknownEngine("gpt".to_string()))
        );
        assert_eq!(
            "grok=  ".parse::<EngineCommandArg>(),
            Err(EngineCommandParseError::EmptyCommand("grok".to_string()))
        );
    }
}
