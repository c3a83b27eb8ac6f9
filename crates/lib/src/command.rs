//! Command classification for inbound chat text.
//!
//! Only the first [`COMMAND_WINDOW`] characters are scanned for a leading command token;
//! the rest of the text is treated as arguments.

/// Leading characters scanned for a command token (fits the longest token, `/createimage`).
pub const COMMAND_WINDOW: usize = 12;

pub const CREATE_IMAGE_TOKEN: &str = "/createimage";
pub const EDIT_TOKEN: &str = "/edit";
pub const TALK_TOKEN: &str = "/talk";

/// A classified chat command with its parsed arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// `/talk <text>`: converse with the given text.
    Talk { text: String },
    /// `/edit <instruction>: <text>`: revise text according to an instruction.
    Edit { instruction: String, text: String },
    /// `/createimage <prompt>`: generate images.
    CreateImage { prompt: String },
    /// No recognised command; the whole message is conversational.
    None,
}

impl Command {
    /// Short tag for logs.
    pub fn tag(&self) -> &'static str {
        match self {
            Command::Talk { .. } => "talk",
            Command::Edit { .. } => "edit",
            Command::CreateImage { .. } => "createimage",
            Command::None => "none",
        }
    }

    /// Usage line for a command whose required argument is empty, or None when it can run.
    pub fn missing_argument_usage(&self) -> Option<&'static str> {
        match self {
            Command::Talk { text } if text.is_empty() => Some("Usage: /talk <text>"),
            Command::Edit { text, .. } if text.is_empty() => {
                Some("Usage: /edit <instruction>: <text>")
            }
            Command::CreateImage { prompt } if prompt.is_empty() => {
                Some("Usage: /createimage <prompt>")
            }
            _ => None,
        }
    }
}

/// Leading command token of `text`, looking only at the first [`COMMAND_WINDOW`] characters.
fn leading_token(text: &str) -> &str {
    let end = text
        .char_indices()
        .nth(COMMAND_WINDOW)
        .map(|(i, _)| i)
        .unwrap_or(text.len());
    let window = &text[..end];
    window.split_whitespace().next().unwrap_or("")
}

/// Classify message text. Total: every input yields a command.
pub fn classify(text: &str) -> Command {
    // A token followed by more non-space characters (e.g. "/editor") is not a command.
    let token = leading_token(text);
    let starts_with_token = |t: &str| {
        token == t
            && text.starts_with(t)
            && text[t.len()..]
                .chars()
                .next()
                .map_or(true, char::is_whitespace)
    };
    if starts_with_token(CREATE_IMAGE_TOKEN) {
        let (prompt, _) = parse_message(CREATE_IMAGE_TOKEN, text);
        Command::CreateImage { prompt }
    } else if starts_with_token(EDIT_TOKEN) {
        let (text, instruction) = parse_message(EDIT_TOKEN, text);
        Command::Edit { instruction, text }
    } else if starts_with_token(TALK_TOKEN) {
        let (text, _) = parse_message(TALK_TOKEN, text);
        Command::Talk { text }
    } else {
        Command::None
    }
}

/// Strip `token` from the start of `text` and return `(text, instruction)`.
///
/// For `/edit` the remainder is split on the first `:`; without a colon the instruction is empty
/// and the whole remainder is the text. Other tokens never produce an instruction.
pub fn parse_message(token: &str, text: &str) -> (String, String) {
    let rest = text.strip_prefix(token).unwrap_or(text).trim();
    if token == EDIT_TOKEN {
        if let Some((instruction, body)) = rest.split_once(':') {
            return (body.trim().to_string(), instruction.trim().to_string());
        }
    }
    (rest.to_string(), String::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_known_tokens() {
        assert_eq!(
            classify("/createimage some more text here"),
            Command::CreateImage {
                prompt: "some more text here".to_string()
            }
        );
        assert_eq!(classify("/edit some more text here").tag(), "edit");
        assert_eq!(
            classify("/talk hello there"),
            Command::Talk {
                text: "hello there".to_string()
            }
        );
        assert_eq!(classify("random text without command"), Command::None);
    }

    #[test]
    fn short_and_empty_input_does_not_panic() {
        assert_eq!(classify(""), Command::None);
        assert_eq!(classify("/"), Command::None);
        assert_eq!(classify("hi"), Command::None);
        assert_eq!(
            classify("/edit"),
            Command::Edit {
                instruction: String::new(),
                text: String::new()
            }
        );
    }

    #[test]
    fn multibyte_text_near_window_boundary() {
        assert_eq!(classify("ééééééééééééééé"), Command::None);
        assert_eq!(
            classify("/edit ñandú: ü"),
            Command::Edit {
                instruction: "ñandú".to_string(),
                text: "ü".to_string(),
            }
        );
    }

    #[test]
    fn matching_is_case_sensitive_and_token_exact() {
        assert_eq!(classify("/Edit rotate: 90"), Command::None);
        assert_eq!(classify("/CREATEIMAGE cat"), Command::None);
        assert_eq!(classify("/editor open"), Command::None);
        assert_eq!(classify("/createimagex cat"), Command::None);
    }

    #[test]
    fn edit_splits_on_first_colon() {
        assert_eq!(
            classify("/edit rotate: 90 degrees"),
            Command::Edit {
                instruction: "rotate".to_string(),
                text: "90 degrees".to_string()
            }
        );
        assert_eq!(
            classify("/edit 90 degrees"),
            Command::Edit {
                instruction: String::new(),
                text: "90 degrees".to_string()
            }
        );
        assert_eq!(
            classify("/edit fix: time 10:30"),
            Command::Edit {
                instruction: "fix".to_string(),
                text: "time 10:30".to_string()
            }
        );
    }

    #[test]
    fn parse_message_for_create_image_has_no_instruction() {
        let (text, instruction) = parse_message(CREATE_IMAGE_TOKEN, "/createimage create a landscape");
        assert_eq!(text, "create a landscape");
        assert_eq!(instruction, "");
    }

    #[test]
    fn newline_after_token_counts_as_delimiter() {
        assert_eq!(
            classify("/createimage\na cat"),
            Command::CreateImage {
                prompt: "a cat".to_string()
            }
        );
    }

    #[test]
    fn commands_without_arguments_need_usage() {
        assert_eq!(
            classify("/createimage").missing_argument_usage(),
            Some("Usage: /createimage <prompt>")
        );
        assert_eq!(
            classify("/talk   ").missing_argument_usage(),
            Some("Usage: /talk <text>")
        );
        assert!(classify("/edit fix:").missing_argument_usage().is_some());
        assert_eq!(classify("/edit 90 degrees").missing_argument_usage(), None);
        assert_eq!(classify("/talk hi").missing_argument_usage(), None);
        assert_eq!(classify("/createimage a cat").missing_argument_usage(), None);
        assert_eq!(classify("hello").missing_argument_usage(), None);
    }
}
