use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseError {
    pub kind: &'static str,
    pub value: String,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown {}: {}", self.kind, self.value)
    }
}

impl std::error::Error for ParseError {}

macro_rules! string_enum {
    ($name:ident, $kind:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = ParseError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s.trim().to_ascii_lowercase().as_str() {
                    $($text => Ok($name::$variant),)+
                    _ => Err(ParseError {
                        kind: $kind,
                        value: s.to_string(),
                    }),
                }
            }
        }
    };
}

/// Lifecycle state of an instance process.
///
/// `Stopped -> Starting -> Running -> Stopping -> Stopped`; `Error` is reachable
/// from any state on crash or start failure and is left by a new `start`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Stopped,
    Starting,
    Running,
    Stopping,
    Error,
}

string_enum!(InstanceStatus, "instance status", {
    Stopped => "stopped",
    Starting => "starting",
    Running => "running",
    Stopping => "stopping",
    Error => "error",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Unknown,
    Healthy,
    Unhealthy,
}

string_enum!(HealthStatus, "health status", {
    Unknown => "unknown",
    Healthy => "healthy",
    Unhealthy => "unhealthy",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserRole {
    Admin,
    User,
}

string_enum!(UserRole, "user role", {
    Admin => "admin",
    User => "user",
});

/// How a credential is presented to an agent's upstream API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamAuth {
    /// Raw key in the named header.
    Header(&'static str),
    /// `Authorization: Bearer <key>`.
    Bearer,
}

/// Minimal round-trip used to verify a credential: an authenticated `GET`
/// against a cheap listing endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpstreamProbe {
    pub default_base_url: &'static str,
    pub path: &'static str,
    pub auth: UpstreamAuth,
    pub extra_headers: &'static [(&'static str, &'static str)],
}

/// Supported AI agent integrations.
///
/// Adding a variant forces every mapping below to be extended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AgentType {
    ClaudeCode,
    Codex,
    GeminiCli,
}

string_enum!(AgentType, "agent type", {
    ClaudeCode => "claude-code",
    Codex => "codex",
    GeminiCli => "gemini-cli",
});

impl AgentType {
    /// Environment variable receiving the decrypted API key.
    pub fn api_key_var(&self) -> &'static str {
        match self {
            AgentType::ClaudeCode => "ANTHROPIC_API_KEY",
            AgentType::Codex => "OPENAI_API_KEY",
            AgentType::GeminiCli => "GEMINI_API_KEY",
        }
    }

    /// Environment variable pointing the agent at its per-instance config directory.
    pub fn config_dir_var(&self) -> &'static str {
        match self {
            AgentType::ClaudeCode => "CLAUDE_CONFIG_DIR",
            AgentType::Codex => "CODEX_HOME",
            AgentType::GeminiCli => "GEMINI_CONFIG_DIR",
        }
    }

    pub fn upstream_probe(&self) -> UpstreamProbe {
        match self {
            AgentType::ClaudeCode => UpstreamProbe {
                default_base_url: "https://api.anthropic.com",
                path: "/v1/models",
                auth: UpstreamAuth::Header("x-api-key"),
                extra_headers: &[("anthropic-version", "2023-06-01")],
            },
            AgentType::Codex => UpstreamProbe {
                default_base_url: "https://api.openai.com",
                path: "/v1/models",
                auth: UpstreamAuth::Bearer,
                extra_headers: &[],
            },
            AgentType::GeminiCli => UpstreamProbe {
                default_base_url: "https://generativelanguage.googleapis.com",
                path: "/v1beta/models",
                auth: UpstreamAuth::Header("x-goog-api-key"),
                extra_headers: &[],
            },
        }
    }
}
