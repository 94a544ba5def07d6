//! Characters: named personas (voice + instructions + optional tools)
//! selectable within a session.
//!
//! Characters are plain data documents loaded from a directory. Dynamic
//! behavior comes only from compiled-in capabilities referenced by id, so
//! a character file is never executable code.

pub mod builtin;
pub mod registry;

pub use registry::{CharacterLoadError, CharacterLoadResult, CharacterRegistry};

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::chat::prompt::{
    Instructions, PromptGenerator, ToolDispatch, ToolSupport, render_template,
};
use crate::events::CharacterInfo;
use crate::llm::tools::{ToolDefinition, ToolValidator, build_validators};

/// Where a character's voice audio comes from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum VoiceSource {
    File {
        path_on_server: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        description: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        description_link: Option<String>,
    },
    Url {
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        description: Option<String>,
    },
}

impl VoiceSource {
    /// The identifier handed to the TTS service.
    pub fn reference(&self) -> &str {
        match self {
            VoiceSource::File { path_on_server, .. } => path_on_server,
            VoiceSource::Url { url, .. } => url,
        }
    }
}

/// One character definition document as found on disk.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CharacterSpec {
    pub name: String,
    pub voice: VoiceSource,
    pub instructions: Instructions,
    #[serde(default)]
    pub good: Option<bool>,
    #[serde(default)]
    pub comment: Option<String>,
    #[serde(default)]
    pub tools: Vec<ToolDefinition>,
    /// Compiled-in tool dispatcher id; required when tools are declared.
    #[serde(default)]
    pub dispatcher: Option<String>,
}

#[derive(Debug, Error)]
pub enum CharacterBuildError {
    #[error("character name is blank")]
    BlankName,

    #[error("unknown prompt generator id: {0}")]
    UnknownGenerator(String),

    #[error("unknown tool dispatcher id: {0}")]
    UnknownDispatcher(String),

    #[error("tools declared without a dispatcher")]
    ToolsWithoutDispatcher,
}

/// A loaded character. Immutable until the next registry reload, which
/// replaces the whole roster.
pub struct Character {
    pub name: String,
    pub voice: VoiceSource,
    pub instructions: Instructions,
    pub good: Option<bool>,
    pub comment: Option<String>,
    pub tools: Vec<ToolDefinition>,
    generator: Arc<dyn PromptGenerator>,
    validators: Arc<HashMap<String, ToolValidator>>,
}

impl Character {
    pub fn from_spec(spec: CharacterSpec) -> Result<Self, CharacterBuildError> {
        if spec.name.trim().is_empty() {
            return Err(CharacterBuildError::BlankName);
        }

        let dispatch: Option<Arc<dyn ToolDispatch>> = match &spec.dispatcher {
            Some(id) => Some(
                builtin::dispatcher(id)
                    .ok_or_else(|| CharacterBuildError::UnknownDispatcher(id.clone()))?,
            ),
            None => None,
        };
        if !spec.tools.is_empty() && dispatch.is_none() {
            return Err(CharacterBuildError::ToolsWithoutDispatcher);
        }

        let prompt = match &spec.instructions {
            Instructions::Constant { text } => PromptSource::Constant(text.clone()),
            Instructions::Template { language, extra } => PromptSource::Template {
                language: *language,
                extra: extra.clone(),
            },
            Instructions::Generator { id } => PromptSource::Dynamic(
                builtin::generator(id)
                    .ok_or_else(|| CharacterBuildError::UnknownGenerator(id.clone()))?,
            ),
        };

        // Validators are derived once per load, not per invocation.
        let validators = Arc::new(build_validators(&spec.tools));

        Ok(Character {
            generator: Arc::new(BoundGenerator {
                prompt,
                dispatch,
            }),
            validators,
            name: spec.name,
            voice: spec.voice,
            instructions: spec.instructions,
            good: spec.good,
            comment: spec.comment,
            tools: spec.tools,
        })
    }

    pub fn prompt_generator(&self) -> Arc<dyn PromptGenerator> {
        self.generator.clone()
    }

    pub fn validators(&self) -> Arc<HashMap<String, ToolValidator>> {
        self.validators.clone()
    }

    pub fn info(&self) -> CharacterInfo {
        CharacterInfo {
            name: self.name.clone(),
            good: self.good,
            comment: self.comment.clone(),
        }
    }
}

enum PromptSource {
    Constant(String),
    Template {
        language: Option<crate::chat::prompt::LanguageCode>,
        extra: Option<String>,
    },
    Dynamic(Arc<dyn PromptGenerator>),
}

/// A character's prompt capability with its tool dispatcher bound in. An
/// explicit `dispatcher` wins over whatever a dynamic generator carries.
struct BoundGenerator {
    prompt: PromptSource,
    dispatch: Option<Arc<dyn ToolDispatch>>,
}

impl PromptGenerator for BoundGenerator {
    fn make_system_prompt(&self) -> String {
        match &self.prompt {
            PromptSource::Constant(text) => text.clone(),
            PromptSource::Template { language, extra } => {
                render_template(*language, extra.as_deref())
            }
            PromptSource::Dynamic(inner) => inner.make_system_prompt(),
        }
    }

    fn tool_support(&self) -> ToolSupport {
        if let Some(dispatch) = &self.dispatch {
            return ToolSupport::Capable(dispatch.clone());
        }
        match &self.prompt {
            PromptSource::Dynamic(inner) => inner.tool_support(),
            _ => ToolSupport::None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn basic_spec() -> CharacterSpec {
        CharacterSpec {
            name: "charles".to_string(),
            voice: VoiceSource::File {
                path_on_server: "voices/charles.wav".to_string(),
                description: None,
                description_link: None,
            },
            instructions: Instructions::Constant {
                text: "You are Charles.".to_string(),
            },
            good: Some(true),
            comment: None,
            tools: Vec::new(),
            dispatcher: None,
        }
    }

    #[test]
    fn test_character_from_constant_spec() {
        let character = Character::from_spec(basic_spec()).expect("build");
        assert_eq!(character.name, "charles");
        assert_eq!(
            character.prompt_generator().make_system_prompt(),
            "You are Charles."
        );
        assert!(matches!(
            character.prompt_generator().tool_support(),
            ToolSupport::None
        ));
    }

    #[test]
    fn test_unknown_generator_id_fails() {
        let spec = CharacterSpec {
            instructions: Instructions::Generator {
                id: "does_not_exist".to_string(),
            },
            ..basic_spec()
        };
        assert!(matches!(
            Character::from_spec(spec),
            Err(CharacterBuildError::UnknownGenerator(_))
        ));
    }

    #[test]
    fn test_tools_require_dispatcher() {
        let spec = CharacterSpec {
            tools: vec![ToolDefinition {
                tool_type: "function".to_string(),
                function: crate::llm::FunctionDefinition {
                    name: "log_event".to_string(),
                    description: None,
                    parameters: Some(json!({"type": "object", "properties": {}})),
                },
            }],
            ..basic_spec()
        };
        assert!(matches!(
            Character::from_spec(spec),
            Err(CharacterBuildError::ToolsWithoutDispatcher)
        ));
    }

    #[test]
    fn test_dispatcher_binding() {
        let spec = CharacterSpec {
            dispatcher: Some("journal".to_string()),
            tools: vec![ToolDefinition {
                tool_type: "function".to_string(),
                function: crate::llm::FunctionDefinition {
                    name: "log_event".to_string(),
                    description: None,
                    parameters: None,
                },
            }],
            ..basic_spec()
        };
        let character = Character::from_spec(spec).expect("build");
        assert!(matches!(
            character.prompt_generator().tool_support(),
            ToolSupport::Capable(_)
        ));
        assert!(character.validators().contains_key("log_event"));
    }

    #[test]
    fn test_voice_source_reference() {
        let file = VoiceSource::File {
            path_on_server: "voices/a.wav".to_string(),
            description: None,
            description_link: None,
        };
        assert_eq!(file.reference(), "voices/a.wav");

        let url = VoiceSource::Url {
            url: "https://example.com/b.wav".to_string(),
            description: None,
        };
        assert_eq!(url.reference(), "https://example.com/b.wav");
    }

    #[test]
    fn test_spec_yaml_roundtrip() {
        let yaml = r#"
name: gertrude
voice:
  type: file
  path_on_server: voices/gertrude.wav
instructions:
  type: template
  language: fr
good: true
comment: grumpy but lovable
"#;
        let spec: CharacterSpec = serde_yaml::from_str(yaml).expect("parse");
        assert_eq!(spec.name, "gertrude");
        assert!(matches!(spec.instructions, Instructions::Template { .. }));

        let character = Character::from_spec(spec).expect("build");
        assert!(
            character
                .prompt_generator()
                .make_system_prompt()
                .contains("Speak French")
        );
    }
}
