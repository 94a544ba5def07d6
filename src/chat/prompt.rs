//! System prompt instructions and the prompt-generation capability.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Languages the speech stack supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LanguageCode {
    #[serde(rename = "en")]
    En,
    #[serde(rename = "fr")]
    Fr,
    #[serde(rename = "en/fr")]
    EnFr,
    #[serde(rename = "fr/en")]
    FrEn,
}

fn language_instructions(language: Option<LanguageCode>) -> &'static str {
    match language {
        None | Some(LanguageCode::En) => {
            "Speak English. You also speak a bit of French, but if asked to \
             do so, mention you might have an accent."
        }
        Some(LanguageCode::Fr) => {
            "Speak French. Don't speak English unless asked to. You also \
             speak a bit of English, but if asked to do so, mention you \
             might have an accent."
        }
        Some(LanguageCode::EnFr) => "You speak English and French.",
        Some(LanguageCode::FrEn) => "You speak French and English.",
    }
}

/// Instruction source declared by a session update or a character file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Instructions {
    /// A literal prompt used verbatim.
    Constant { text: String },
    /// The built-in template, parameterized.
    Template {
        #[serde(default)]
        language: Option<LanguageCode>,
        #[serde(default)]
        extra: Option<String>,
    },
    /// A compiled-in generator resolved by id at character load.
    Generator { id: String },
}

const PROMPT_BASICS: &str = "\
You're in a speech conversation with a human user. Their text is being \
transcribed using speech-to-text, and your responses will be spoken out \
loud. Don't worry about formatting and don't use unpronounceable \
characters like emojis and *. Write as a human would speak, and respond \
in the language the user is speaking.";

const DEFAULT_EXTRA: &str = "\
There should be a lot of back and forth between you and the other person. \
Ask follow-up questions. Don't be servile: be a good conversationalist, \
but don't be afraid to disagree or be a bit snarky if appropriate. As \
your first message, respond with a greeting and some kind of \
conversation starter.";

/// Render the built-in template.
pub fn render_template(language: Option<LanguageCode>, extra: Option<&str>) -> String {
    format!(
        "# BASICS\n{basics}\n\n\
         # STYLE\nBe brief.\n{language}\n\n\
         This is important because it's a specific wish of the user:\n{extra}\n\n\
         # TRANSCRIPTION ERRORS\n\
         There might be mistakes in the transcript of the user's speech. If \
         what they're saying doesn't make sense, it could be a transcription \
         mistake; if you can guess they meant something that sounds similar, \
         prefer to guess rather than asking about it.\n\n\
         # SILENCE\n\
         If the user says \"...\", they haven't spoken for a while. You can \
         ask if they're still there, comment on the silence, or fill it. If \
         it happens several times, vary your reaction, and after the third \
         time say some sort of goodbye.",
        basics = PROMPT_BASICS,
        language = language_instructions(language),
        extra = extra.unwrap_or(DEFAULT_EXTRA),
    )
}

/// Default prompt when no character or instructions are configured.
pub fn default_system_prompt() -> String {
    render_template(None, None)
}

/// Raised by tool dispatchers.
#[derive(Debug, Error)]
pub enum ToolDispatchError {
    /// A tool was dispatched that the character never declared. This is a
    /// programming error in the character, not a recoverable condition.
    #[error("unknown tool: {0}")]
    UnknownTool(String),

    #[error("{kind}: {message}")]
    Failed { kind: String, message: String },
}

/// Optional side-effecting tool handler attached to a character.
pub trait ToolDispatch: Send + Sync {
    fn handle_tool_call(
        &self,
        name: &str,
        arguments: &serde_json::Value,
    ) -> Result<String, ToolDispatchError>;
}

/// Whether a prompt generator can also handle tool calls.
#[derive(Clone)]
pub enum ToolSupport {
    None,
    Capable(Arc<dyn ToolDispatch>),
}

/// The prompt-generation capability.
///
/// `make_system_prompt` is allowed to be non-deterministic; callers invoke
/// it once per character selection and freeze the result into history.
pub trait PromptGenerator: Send + Sync {
    fn make_system_prompt(&self) -> String;

    fn tool_support(&self) -> ToolSupport {
        ToolSupport::None
    }
}

/// Generator for a literal prompt.
pub struct ConstantPrompt {
    pub text: String,
}

impl PromptGenerator for ConstantPrompt {
    fn make_system_prompt(&self) -> String {
        self.text.clone()
    }
}

/// Generator for the built-in template.
pub struct TemplatePrompt {
    pub language: Option<LanguageCode>,
    pub extra: Option<String>,
}

impl PromptGenerator for TemplatePrompt {
    fn make_system_prompt(&self) -> String {
        render_template(self.language, self.extra.as_deref())
    }
}
