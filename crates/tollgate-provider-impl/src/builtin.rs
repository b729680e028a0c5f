//! Seed rows for the built-in providers, inserted at bootstrap time when a
//! fresh database has no `providers` rows yet. Each seed carries the
//! provider's default `ProviderConfig` (channel settings, not credentials).

use tollgate_provider_core::config::ProviderConfig;

pub struct BuiltinProviderSeed {
    pub name: &'static str,
    pub config_json: serde_json::Value,
    pub enabled: bool,
}

fn seed(name: &'static str, config: ProviderConfig) -> BuiltinProviderSeed {
    BuiltinProviderSeed {
        name,
        config_json: serde_json::to_value(config).expect("provider config serializes"),
        enabled: true,
    }
}

pub fn builtin_provider_seeds() -> Vec<BuiltinProviderSeed> {
    vec![
        seed("openai", ProviderConfig::OpenAI(Default::default())),
        seed("claude", ProviderConfig::Claude(Default::default())),
        seed("aistudio", ProviderConfig::AIStudio(Default::default())),
        seed(
            "vertexexpress",
            ProviderConfig::VertexExpress(Default::default()),
        ),
        seed("vertex", ProviderConfig::Vertex(Default::default())),
        seed("geminicli", ProviderConfig::GeminiCli(Default::default())),
        seed(
            "claudecode",
            ProviderConfig::ClaudeCode(Default::default()),
        ),
        seed("codex", ProviderConfig::Codex(Default::default())),
        seed(
            "antigravity",
            ProviderConfig::Antigravity(Default::default()),
        ),
        seed("nvidia", ProviderConfig::Nvidia(Default::default())),
        seed("deepseek", ProviderConfig::DeepSeek(Default::default())),
    ]
}
