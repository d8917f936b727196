use std::path::PathBuf;

/// Commands listed by `/help` (usage, description).
pub const COMMANDS: &[(&str, &str)] = &[
    ("/dirs", "List working directories"),
    ("/cd N", "Start a session in directory N"),
    ("/model NAME", "Switch model (restarts a running session)"),
    ("/reset", "Start over in the same directory"),
    ("/attach PATH", "Attach a file to following prompts"),
    ("/detach", "Clear attachments"),
    ("/show ID", "Show full output of a tool message"),
    ("/status", "Show session state"),
    ("/help", "Show commands"),
    ("/exit", "Quit"),
];

/// Slash commands recognized by the console.
#[derive(Debug, PartialEq, Eq)]
pub enum Command {
    /// List selectable working directories
    Dirs,
    /// Start a session in the N-th listed directory (1-based)
    Cd(usize),
    /// Switch model
    Model(String),
    /// Restart the session in place
    Reset,
    /// Attach a file
    Attach(PathBuf),
    /// Clear attachments
    Detach,
    /// Reveal stored tool output by message id
    Show(String),
    Status,
    Help,
    Exit,
    /// Known command with a missing or malformed argument
    Usage(&'static str),
    /// Unrecognized `/name`
    Unknown(String),
}

/// Parse a slash command. Returns `None` if the input is a prompt.
pub fn parse(input: &str) -> Option<Command> {
    let trimmed = input.trim();
    let rest = trimmed.strip_prefix('/')?;
    let (cmd, arg) = match rest.split_once(char::is_whitespace) {
        Some((c, a)) => (c, Some(a.trim()).filter(|a| !a.is_empty())),
        None => (rest, None),
    };
    let command = match cmd {
        "dirs" | "ls" => Command::Dirs,
        "cd" | "dir" => match arg.map(str::parse::<usize>) {
            Some(Ok(n)) => Command::Cd(n),
            _ => Command::Usage("/cd N"),
        },
        "model" => match arg {
            Some(name) => Command::Model(name.to_string()),
            None => Command::Usage("/model NAME"),
        },
        "reset" | "new" => Command::Reset,
        "attach" => match arg {
            Some(path) => Command::Attach(PathBuf::from(path)),
            None => Command::Usage("/attach PATH"),
        },
        "detach" => Command::Detach,
        "show" => match arg {
            Some(id) => Command::Show(id.to_string()),
            None => Command::Usage("/show ID"),
        },
        "status" => Command::Status,
        "help" | "?" => Command::Help,
        "exit" | "quit" => Command::Exit,
        other => Command::Unknown(other.to_string()),
    };
    Some(command)
}

pub fn help_text() -> String {
    let width = COMMANDS.iter().map(|(usage, _)| usage.len()).max().unwrap_or(0);
    let mut text = String::from("Commands:");
    for (usage, description) in COMMANDS {
        text.push_str(&format!("\n  {usage:<width$}  {description}"));
    }
    text.push_str("\nAnything else is sent to the assistant.");
    text
}
