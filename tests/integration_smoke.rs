#![cfg(feature = "integration")]

use dbsmart::{GenerateRequest, LanguageModel, Message, OpenAICompatible, Result};

fn env_nonempty(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

#[tokio::test]
async fn openai_compatible_generate_smoke() -> Result<()> {
    let base_url = env_nonempty("DBSMART_BASE_URL");
    let model = env_nonempty("DBSMART_MODEL");
    let (Some(base_url), Some(model)) = (base_url, model) else {
        return Ok(());
    };

    let api_key = env_nonempty("DBSMART_API_KEY").unwrap_or_default();
    let client = OpenAICompatible::new(api_key)?
        .with_base_url(base_url)
        .with_model(model);

    let mut request: GenerateRequest = vec![
        Message::system("You are a minimal integration test."),
        Message::user("Reply with the single word: ok"),
    ]
    .into();
    request.max_tokens = Some(16);
    request.temperature = Some(0.0);

    let response = client.generate(request).await?;
    assert!(!response.text().trim().is_empty());
    Ok(())
}
