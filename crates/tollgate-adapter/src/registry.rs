use crate::adapter::Adapter;
use crate::api_type::ApiType;
use crate::claude::ClaudeAdapter;
use crate::gemini::GeminiAdapter;
use crate::openai::OpenAiAdapter;

static OPENAI: OpenAiAdapter = OpenAiAdapter;
static CLAUDE: ClaudeAdapter = ClaudeAdapter;
static GEMINI: GeminiAdapter = GeminiAdapter;

/// The single static type→adapter mapping. Every dispatch site goes through
/// here instead of branching on the channel type.
pub fn adapter_for(api_type: ApiType) -> &'static dyn Adapter {
    match api_type {
        ApiType::OpenAi => &OPENAI,
        ApiType::Claude => &CLAUDE,
        ApiType::Gemini => &GEMINI,
    }
}
