//! Input line parsing
//!
//! Every input line is either a slash command or a chat message.

use std::fmt;

/// One parsed input line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Send a chat message
    Say(String),
    /// Start a new empty conversation
    New,
    /// Reload the first page of the conversation index
    List,
    /// Load the next page of the conversation index
    More,
    /// Select a conversation
    Open(String),
    /// Load older messages of the selected conversation
    Older,
    /// Truncate the conversation at a message index
    DeleteFrom(usize),
    /// Delete a conversation
    DeleteConversation(String),
    /// Change the personality
    Personality(String),
    /// Replace the conversation's context override
    Context(String),
    /// Print the message list
    History,
    /// Cancel the streaming reply
    Cancel,
    /// Log in with the configured credentials
    Login,
    /// Log out
    Logout,
    /// Show the help text
    Help,
    /// Leave
    Quit,
}

/// Input line could not be parsed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// Unknown slash command
    Unknown(String),
    /// Command is missing its argument or the argument is invalid
    Usage(&'static str),
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown(name) => write!(f, "unknown command /{name}, try /help"),
            Self::Usage(usage) => write!(f, "usage: {usage}"),
        }
    }
}

impl std::error::Error for ParseError {}

pub const HELP: &str = "\
commands:
  /new                       start a new conversation
  /list, /more               show conversations (first page, next page)
  /open <id>                 open a conversation
  /older                     load older messages
  /delete-from <index>       delete messages from index on
  /delete-conversation <id>  delete a conversation
  /personality <slug>        change personality
  /context <text>            set the context override
  /history                   print messages
  /cancel                    stop the current reply
  /login, /logout            session
  /quit                      leave
anything else is sent as a message";

/// Parse one input line; `None` for a blank line
pub fn parse(line: &str) -> Option<Result<Command, ParseError>> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }

    let Some(rest) = line.strip_prefix('/') else {
        return Some(Ok(Command::Say(line.to_string())));
    };

    let (name, arg) = match rest.split_once(char::is_whitespace) {
        Some((name, arg)) => (name, arg.trim()),
        None => (rest, ""),
    };

    let required = |usage: &'static str| {
        if arg.is_empty() {
            Err(ParseError::Usage(usage))
        } else {
            Ok(arg.to_string())
        }
    };

    let command = match name {
        "new" => Ok(Command::New),
        "list" => Ok(Command::List),
        "more" => Ok(Command::More),
        "open" => required("/open <id>").map(Command::Open),
        "older" => Ok(Command::Older),
        "delete-from" => arg
            .parse()
            .map(Command::DeleteFrom)
            .map_err(|_| ParseError::Usage("/delete-from <index>")),
        "delete-conversation" => {
            required("/delete-conversation <id>").map(Command::DeleteConversation)
        }
        "personality" => required("/personality <slug>").map(Command::Personality),
        "context" => required("/context <text>").map(Command::Context),
        "history" => Ok(Command::History),
        "cancel" => Ok(Command::Cancel),
        "login" => Ok(Command::Login),
        "logout" => Ok(Command::Logout),
        "help" => Ok(Command::Help),
        "quit" | "exit" => Ok(Command::Quit),
        other => Err(ParseError::Unknown(other.to_string())),
    };
    Some(command)
}
