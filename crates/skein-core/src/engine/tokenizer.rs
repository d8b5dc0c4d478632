//! Text/token conversion and chat-template application.

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::engine::backend::Token;
use crate::engine::errors::EngineError;

/// One `(role, content)` pair of a chat conversation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }
}

/// Vocabulary access for the loaded model.
///
/// Piece-wise decoding concatenates to the same string as bulk decoding, so
/// [`Tokenizer::decode`] has a default implementation over
/// [`Tokenizer::decode_one`].
pub trait Tokenizer: Send + Sync {
    /// Encode `text` to the canonical token sequence. When `add_special` is
    /// set the model's BOS policy is applied.
    fn tokenize(&self, text: &str, add_special: bool) -> Result<Vec<Token>, EngineError>;

    /// Decode a single token to its text piece.
    fn decode_one(&self, token: Token) -> String;

    fn decode(&self, tokens: &[Token]) -> String {
        tokens.iter().map(|&t| self.decode_one(t)).collect()
    }

    /// Whether the model expects a BOS token at the start of a sequence.
    fn should_add_bos(&self) -> bool;

    fn bos_token(&self) -> Token;

    fn eog_token(&self) -> Token;

    /// Whether `token` ends generation for this model.
    fn is_eog(&self, token: Token) -> bool {
        token == self.eog_token()
    }

    /// The model-embedded chat template source, when the model carries one.
    fn chat_template(&self) -> Option<String> {
        None
    }
}

/// Generic ChatML template used when the model has no embedded template or
/// the embedded one fails to render.
const CHATML_TEMPLATE: &str = "{% for message in messages %}<|im_start|>{{ message.role }}\n\
{{ message.content }}<|im_end|>\n\
{% endfor %}{% if add_generation_prompt %}<|im_start|>assistant\n{% endif %}";

/// Format an ordered list of chat messages into a single completion prompt.
///
/// Renders the model-embedded template when `use_jinja` is set, falling back
/// to ChatML when the embedded template is absent or fails to render.
pub fn apply_chat_template(
    tokenizer: &dyn Tokenizer,
    messages: &[ChatMessage],
    use_jinja: bool,
) -> Result<String, EngineError> {
    if use_jinja {
        if let Some(source) = tokenizer.chat_template() {
            match render_template(&source, messages) {
                Ok(prompt) => return Ok(prompt),
                Err(e) => {
                    warn!(error = %e, "embedded chat template failed to render, falling back to chatml");
                }
            }
        }
    }
    render_template(CHATML_TEMPLATE, messages).map_err(|source| EngineError::ChatTemplate { source })
}

fn render_template(source: &str, messages: &[ChatMessage]) -> Result<String, minijinja::Error> {
    let mut env = minijinja::Environment::new();
    env.add_template("chat", source)?;
    env.get_template("chat")?.render(minijinja::context! {
        messages => messages,
        add_generation_prompt => true,
        bos_token => "",
        eos_token => "",
    })
}
