//! Line commands accepted on stdin while `auto-merge` runs.

pub const CONSOLE_HELP: &str = "commands: diff <id> | track <id> | cancel <id> | refresh | quit";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsoleCommand {
    /// Print the diff and remember it as reviewed.
    Diff(u64),
    /// Authorize automation bound to the diff last shown for the id.
    Track(u64),
    Cancel(u64),
    Refresh,
    Quit,
    Help,
}

pub fn parse_console_command(line: &str) -> Result<Option<ConsoleCommand>, String> {
    let mut words = line.split_whitespace();
    let Some(verb) = words.next() else {
        return Ok(None);
    };
    let mut id = |verb: &str| -> Result<u64, String> {
        let raw = words
            .next()
            .ok_or_else(|| format!("usage: {verb} <id>"))?;
        raw.parse::<u64>()
            .map_err(|_| format!("invalid merge request id '{raw}'"))
    };
    let command = match verb.to_ascii_lowercase().as_str() {
        "diff" | "d" => ConsoleCommand::Diff(id("diff")?),
        "track" | "t" => ConsoleCommand::Track(id("track")?),
        "cancel" | "c" => ConsoleCommand::Cancel(id("cancel")?),
        "refresh" | "r" => ConsoleCommand::Refresh,
        "quit" | "q" | "exit" => ConsoleCommand::Quit,
        "help" | "h" | "?" => ConsoleCommand::Help,
        other => return Err(format!("unknown command '{other}'; {CONSOLE_HELP}")),
    };
    Ok(Some(command))
}
