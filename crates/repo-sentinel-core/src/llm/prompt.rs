/// Shared wire-level prompt contract. Both providers and the token
/// accountant must agree on this template byte for byte, otherwise token
/// projections drift from what actually gets sent.
pub const SYSTEM_PROMPT: &str = "You are a senior software engineer and security analyst. \
Analyze code files and provide structured insights about their purpose and security implications.";

/// Fixed estimate for the JSON reply when the provider gives no better
/// number; typical replies land between 100 and 200 tokens.
pub const ESTIMATED_RESPONSE_TOKENS: u64 = 150;

const TRUNCATION_MARKER: &str = "\n... [truncated]";

/// Approximate bytes-per-token ratio used to clip content to a provider's
/// input budget before the exact encoder runs.
const CHARS_PER_TOKEN: usize = 4;

/// Render the analysis prompt for one file.
pub fn analysis_prompt(path: &str, extension: &str, content: &str) -> String {
    format!(
        r#"Analyze this code file and identify its primary purpose. Consider:
- Main functionality and business logic
- Security implications
- Data handling patterns
- External dependencies
- Framework/library usage patterns
- Architectural role in the application

File: {path}
Extension: {extension}
Code Content:
```
{content}
```

Respond with a JSON object containing:
- "purpose": A brief, clear description of the file's main purpose (max 100 words)
- "category": One of [authentication, data-processing, api, frontend, config, test, build, documentation, other]
- "confidence": A confidence score from 0.0 to 1.0
- "security_relevance": One of [high, medium, low] based on security implications
- "reasoning": Brief explanation of the categorization (max 50 words)

Example response:
{{
  "purpose": "User authentication and session management module",
  "category": "authentication",
  "confidence": 0.95,
  "security_relevance": "high",
  "reasoning": "Handles user credentials, session tokens, and access control"
}}

Provide only the JSON response, no additional text."#
    )
}

/// Clip file content to roughly `max_input_tokens`, appending a visible
/// marker when anything was dropped. Cuts on a char boundary.
pub fn clip_for_budget(content: &str, max_input_tokens: u32) -> String {
    let budget_chars = max_input_tokens as usize * CHARS_PER_TOKEN;
    if content.chars().count() <= budget_chars {
        return content.to_string();
    }
    let mut clipped: String = content.chars().take(budget_chars).collect();
    clipped.push_str(TRUNCATION_MARKER);
    clipped
}
