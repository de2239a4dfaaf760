//! Line commands read from stdin.

use std::str::FromStr;

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Create { object: i32, text: String },
    Modify { object: i32, text: String },
    Delete { object: i32 },
    Chat(String),
    History,
    Stats,
    Peers,
    Kick(String),
    Quit,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("empty command")]
    Empty,
    #[error("unknown command: {0}")]
    Unknown(String),
    #[error("usage: {0}")]
    Usage(&'static str),
}

fn object_id(word: Option<&str>, usage: &'static str) -> Result<i32, CommandError> {
    word.and_then(|w| w.parse::<i32>().ok())
        .filter(|id| *id >= 0)
        .ok_or(CommandError::Usage(usage))
}

impl FromStr for Command {
    type Err = CommandError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let line = line.trim();
        let (word, rest) = line.split_once(' ').unwrap_or((line, ""));
        let rest = rest.trim();
        match word {
            "" => Err(CommandError::Empty),
            "create" | "modify" => {
                let usage = if word == "create" {
                    "create <id> <text>"
                } else {
                    "modify <id> <text>"
                };
                let (id, text) = rest.split_once(' ').unwrap_or((rest, ""));
                let object = object_id(Some(id), usage)?;
                let text = text.trim().to_string();
                Ok(if word == "create" {
                    Command::Create { object, text }
                } else {
                    Command::Modify { object, text }
                })
            }
            "delete" => Ok(Command::Delete {
                object: object_id(rest.split_whitespace().next(), "delete <id>")?,
            }),
            "chat" if !rest.is_empty() => Ok(Command::Chat(rest.to_string())),
            "chat" => Err(CommandError::Usage("chat <text>")),
            "history" => Ok(Command::History),
            "stats" => Ok(Command::Stats),
            "peers" => Ok(Command::Peers),
            "kick" if !rest.is_empty() => Ok(Command::Kick(rest.to_string())),
            "kick" => Err(CommandError::Usage("kick <peer>")),
            "quit" | "exit" => Ok(Command::Quit),
            other => Err(CommandError::Unknown(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_edit_commands() {
        assert_eq!(
            "create 4 red circle".parse::<Command>(),
            Ok(Command::Create {
                object: 4,
                text: "red circle".to_string()
            })
        );
        assert_eq!(
            "  modify 4   moved  ".parse::<Command>(),
            Ok(Command::Modify {
                object: 4,
                text: "moved".to_string()
            })
        );
        assert_eq!("delete 4".parse::<Command>(), Ok(Command::Delete { object: 4 }));
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert_eq!("".parse::<Command>(), Err(CommandError::Empty));
        assert_eq!(
            "delete x".parse::<Command>(),
            Err(CommandError::Usage("delete <id>"))
        );
        assert_eq!(
            "create -1 a".parse::<Command>(),
            Err(CommandError::Usage("create <id> <text>"))
        );
        assert_eq!("chat".parse::<Command>(), Err(CommandError::Usage("chat <text>")));
        assert!(matches!(
            "draw 1".parse::<Command>(),
            Err(CommandError::Unknown(_))
        ));
    }

    #[test]
    fn test_parse_chat_keeps_spacing() {
        assert_eq!(
            "chat hello  world".parse::<Command>(),
            Ok(Command::Chat("hello  world".to_string()))
        );
    }
}
