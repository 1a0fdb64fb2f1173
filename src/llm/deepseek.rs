//! DeepSeek 预设（OpenAI 兼容格式）
//!
//! - Base URL: https://api.deepseek.com
//! - 默认模型: deepseek-chat；其它模型名通过 llm.model 配置

use crate::llm::OpenAiClient;

pub const DEEPSEEK_BASE_URL: &str = "https://api.deepseek.com";
pub const DEEPSEEK_CHAT: &str = "deepseek-chat";

/// 查找 DeepSeek 可用的 API Key：`DEEPSEEK_API_KEY` 优先，其次 `OPENAI_API_KEY`
pub fn deepseek_api_key() -> Option<String> {
    std::env::var("DEEPSEEK_API_KEY")
        .ok()
        .or_else(|| std::env::var("OPENAI_API_KEY").ok())
        .filter(|k| !k.trim().is_empty())
}

/// 创建 DeepSeek 客户端；base_url 为空时使用官方地址，模型默认 deepseek-chat
pub fn create_deepseek_client(
    base_url: Option<&str>,
    model: Option<&str>,
    api_key: &str,
) -> OpenAiClient {
    let model = model
        .filter(|m| !m.is_empty())
        .unwrap_or(DEEPSEEK_CHAT);
    OpenAiClient::new(Some(base_url.unwrap_or(DEEPSEEK_BASE_URL)), model, api_key)
}
