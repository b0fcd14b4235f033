use crate::providers::Provider;
use serde::{Deserialize, Serialize};

/// Cost/rate partition a model belongs to. Every queue and key-pool decision
/// is keyed by family, never by the raw model string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ModelFamily {
    Turbo,
    Gpt4,
    #[serde(rename = "gpt4-32k")]
    Gpt4_32k,
    Claude,
    Bison,
    AwsClaude,
}

impl ModelFamily {
    pub const ALL: [ModelFamily; 6] = [
        ModelFamily::Turbo,
        ModelFamily::Gpt4,
        ModelFamily::Gpt4_32k,
        ModelFamily::Claude,
        ModelFamily::Bison,
        ModelFamily::AwsClaude,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Turbo => "turbo",
            Self::Gpt4 => "gpt4",
            Self::Gpt4_32k => "gpt4-32k",
            Self::Claude => "claude",
            Self::Bison => "bison",
            Self::AwsClaude => "aws-claude",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "turbo" => Some(Self::Turbo),
            "gpt4" => Some(Self::Gpt4),
            "gpt4-32k" => Some(Self::Gpt4_32k),
            "claude" => Some(Self::Claude),
            "bison" => Some(Self::Bison),
            "aws-claude" => Some(Self::AwsClaude),
            _ => None,
        }
    }

    /// Each family is served by exactly one upstream service.
    pub fn provider(&self) -> Provider {
        match self {
            Self::Turbo | Self::Gpt4 | Self::Gpt4_32k => Provider::OpenAi,
            Self::Claude => Provider::Anthropic,
            Self::Bison => Provider::GooglePalm,
            Self::AwsClaude => Provider::Aws,
        }
    }
}

impl std::fmt::Display for ModelFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Maps a request onto its partition. Total: unknown model strings fall back
/// to `turbo`, and anything routed through the AWS service is `aws-claude`
/// regardless of what the model string says.
pub fn partition(provider: Provider, model: &str) -> ModelFamily {
    if provider == Provider::Aws {
        return ModelFamily::AwsClaude;
    }
    match provider.dialect() {
        crate::providers::ApiDialect::Anthropic => ModelFamily::Claude,
        crate::providers::ApiDialect::GooglePalm => ModelFamily::Bison,
        crate::providers::ApiDialect::OpenAi => {
            if model.starts_with("gpt-4-32k") {
                ModelFamily::Gpt4_32k
            } else if model.starts_with("gpt-4") {
                ModelFamily::Gpt4
            } else {
                ModelFamily::Turbo
            }
        }
    }
}
