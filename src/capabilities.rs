//! Per-model capability traits.
//!
//! Drives two decisions in the AI loop: whether structured-output directives
//! can coexist with tools, and whether single-tool models need continuation
//! injection to finish multi-step work.

use tracing::warn;

/// Model-specific behavioral limitations observed in calibration runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Quirks {
    /// Model rejects `response_format` when tools are also enabled
    /// (e.g. Gemini: "Function calling with response mime type:
    /// 'application/json' is unsupported").
    pub no_tools_with_structured_output: bool,
    /// Model supports structured output but reports otherwise in capability
    /// probes (Claude 3.5+ via OpenRouter).
    pub structured_output_hidden: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelCapabilities {
    pub multi_tool: bool,
    pub parallel_tools: bool,
    pub max_tools_per_turn: u32,
    pub structured_output: bool,
    pub quirks: Quirks,
}

const NO_QUIRKS: Quirks = Quirks {
    no_tools_with_structured_output: false,
    structured_output_hidden: false,
};

const HIDDEN_STRUCTURED: Quirks = Quirks {
    no_tools_with_structured_output: false,
    structured_output_hidden: true,
};

const NO_TOOLS_WITH_STRUCTURED: Quirks = Quirks {
    no_tools_with_structured_output: true,
    structured_output_hidden: false,
};

const fn caps(
    multi_tool: bool,
    parallel_tools: bool,
    max_tools_per_turn: u32,
    structured_output: bool,
    quirks: Quirks,
) -> ModelCapabilities {
    ModelCapabilities {
        multi_tool,
        parallel_tools,
        max_tools_per_turn,
        structured_output,
        quirks,
    }
}

/// Conservative default for models missing from the table.
pub const DEFAULT_CAPABILITIES: ModelCapabilities = caps(false, false, 1, false, NO_QUIRKS);

/// Calibrated capability table, keyed by canonical model identifier.
/// Entries double as prefixes: "openai/gpt-4o-2024-08-06" resolves through
/// "openai/gpt-4o".
const MODEL_CAPABILITIES: &[(&str, ModelCapabilities)] = &[
    // OpenAI
    ("openai/gpt-4o-mini", caps(true, true, 10, true, NO_QUIRKS)),
    ("openai/gpt-4o", caps(true, true, 10, true, NO_QUIRKS)),
    ("openai/gpt-4-turbo", caps(true, true, 10, false, NO_QUIRKS)),
    ("openai/gpt-4.1-mini", caps(true, true, 2, true, NO_QUIRKS)),
    ("openai/gpt-4.1", caps(true, true, 2, true, NO_QUIRKS)),
    ("openai/gpt-4", caps(false, false, 1, false, NO_QUIRKS)),
    ("openai/gpt-3.5-turbo", caps(true, true, 10, false, NO_QUIRKS)),
    // Anthropic
    ("anthropic/claude-3-opus", caps(true, true, 10, true, HIDDEN_STRUCTURED)),
    ("anthropic/claude-3-5-sonnet-latest", caps(true, true, 10, true, HIDDEN_STRUCTURED)),
    ("anthropic/claude-3-5-sonnet", caps(true, true, 10, true, NO_QUIRKS)),
    ("anthropic/claude-3-sonnet", caps(false, false, 1, true, NO_QUIRKS)),
    ("anthropic/claude-3.5-sonnet", caps(false, false, 1, true, HIDDEN_STRUCTURED)),
    ("anthropic/claude-3.7-sonnet", caps(false, false, 1, true, HIDDEN_STRUCTURED)),
    ("anthropic/claude-sonnet-4", caps(true, true, 10, true, HIDDEN_STRUCTURED)),
    ("anthropic/claude-4-opus", caps(true, true, 10, true, HIDDEN_STRUCTURED)),
    ("anthropic/claude-3-5-haiku-latest", caps(true, true, 10, true, HIDDEN_STRUCTURED)),
    ("anthropic/claude-3-5-haiku", caps(true, true, 10, true, HIDDEN_STRUCTURED)),
    ("anthropic/claude-3-haiku", caps(false, false, 1, false, NO_QUIRKS)),
    ("anthropic/claude-2.1", caps(true, true, 5, false, NO_QUIRKS)),
    // Google
    ("google/gemini-2.5-flash-preview", caps(true, true, 10, true, NO_TOOLS_WITH_STRUCTURED)),
    ("google/gemini-2.5-pro-preview", caps(true, true, 2, true, NO_TOOLS_WITH_STRUCTURED)),
    ("google/gemini-1.5-pro", caps(false, false, 1, true, NO_TOOLS_WITH_STRUCTURED)),
    ("google/gemini-1.5-flash", caps(false, false, 1, true, NO_TOOLS_WITH_STRUCTURED)),
    ("google/gemini-pro", caps(false, false, 1, true, NO_TOOLS_WITH_STRUCTURED)),
    ("google/gemini-flash-1.5-8b", caps(true, true, 2, true, NO_TOOLS_WITH_STRUCTURED)),
    ("google/gemini-flash-1.5", caps(false, false, 0, true, NO_QUIRKS)),
    // Meta
    ("meta-llama/llama-3.3-70b-instruct", caps(false, false, 1, true, NO_QUIRKS)),
    ("meta-llama/llama-3-70b-instruct", caps(true, true, 10, false, NO_QUIRKS)),
    // Mistral
    ("mistralai/mistral-7b-instruct", caps(true, true, 2, false, NO_QUIRKS)),
    ("mistralai/mistral-nemo", caps(true, true, 2, true, NO_QUIRKS)),
    ("mistralai/mixtral-8x7b-instruct", caps(false, false, 0, true, NO_QUIRKS)),
    // Fireworks
    ("fireworks/mixtral-8x7b-instruct", caps(false, false, 1, true, NO_QUIRKS)),
    ("fireworks/mixtral-8x22b-instruct", caps(false, false, 1, true, NO_QUIRKS)),
    // DeepSeek
    ("deepseek/deepseek-chat-v3-0324", caps(true, true, 2, false, NO_QUIRKS)),
];

/// Look up capabilities for a model: exact match, then prefix match, then the
/// conservative default.
pub fn capabilities_for(model: &str) -> ModelCapabilities {
    if let Some((_, caps)) = MODEL_CAPABILITIES.iter().find(|(name, _)| *name == model) {
        return *caps;
    }
    if let Some((_, caps)) = MODEL_CAPABILITIES
        .iter()
        .find(|(prefix, _)| model.starts_with(prefix))
    {
        return *caps;
    }
    warn!(
        model,
        "model not in capability table, assuming single-tool defaults"
    );
    DEFAULT_CAPABILITIES
}

pub fn supports_multi_tool(model: &str) -> bool {
    capabilities_for(model).multi_tool
}

pub fn supports_structured_output(model: &str) -> bool {
    capabilities_for(model).structured_output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_match() {
        let caps = capabilities_for("openai/gpt-4o");
        assert!(caps.multi_tool);
        assert!(caps.structured_output);
        assert_eq!(caps.max_tools_per_turn, 10);
    }

    #[test]
    fn prefix_match_resolves_dated_variants() {
        let caps = capabilities_for("openai/gpt-4o-2024-08-06");
        assert!(caps.multi_tool);
    }

    #[test]
    fn gpt4_exact_is_not_shadowed_by_turbo() {
        // "openai/gpt-4" must hit its own entry, not a longer sibling.
        let caps = capabilities_for("openai/gpt-4");
        assert!(!caps.multi_tool);
        assert_eq!(caps.max_tools_per_turn, 1);
    }

    #[test]
    fn unknown_model_gets_conservative_default() {
        let caps = capabilities_for("acme/novelty-model");
        assert_eq!(caps, DEFAULT_CAPABILITIES);
        assert!(!caps.multi_tool);
        assert_eq!(caps.max_tools_per_turn, 1);
    }

    #[test]
    fn gemini_quirk_flags() {
        let caps = capabilities_for("google/gemini-1.5-pro");
        assert!(caps.quirks.no_tools_with_structured_output);
        assert!(!caps.quirks.structured_output_hidden);
    }

    #[test]
    fn claude_hidden_structured_output() {
        let caps = capabilities_for("anthropic/claude-sonnet-4");
        assert!(caps.structured_output);
        assert!(caps.quirks.structured_output_hidden);
    }
}
