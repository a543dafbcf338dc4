//! Line based operator console.
//!
//! Reads commands from stdin and applies them through the [`Reconciler`].

use std::path::PathBuf;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::logging::LoggingConfig;
use crate::reconciler::Reconciler;
use crate::streamer::StreamerRegistry;
use crate::{Error, Result};

pub const HELP: &str = "\
Commands:
  add <channel>        track a channel
  remove <channel>     stop tracking a channel
  enable <channel>     record the channel when it goes live
  disable <channel>    do not record the channel
  skip <channel>       skip the current stream and stop its recording
  start <channel>      record now, regardless of status
  location <path>      set the download directory for new recordings
  list                 show tracked channels, live ones first
  log [filter]         show or change the log filter
  help                 show this message";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    Add(String),
    Remove(String),
    Enable(String),
    Disable(String),
    Skip(String),
    Start(String),
    Location(PathBuf),
    List,
    Log(Option<String>),
    Help,
}

/// Parse one input line; blank lines yield `None`.
pub fn parse_command(line: &str) -> Result<Option<ConsoleCommand>> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let (verb, rest) = match line.split_once(char::is_whitespace) {
        Some((verb, rest)) => (verb, rest.trim()),
        None => (line, ""),
    };

    let channel = |verb: &str| -> Result<String> {
        match rest.split_whitespace().collect::<Vec<_>>().as_slice() {
            [channel] => Ok(channel.to_string()),
            [] => Err(Error::validation(format!("usage: {verb} <channel>"))),
            _ => Err(Error::validation(format!("{verb} takes a single channel"))),
        }
    };

    let command = match verb.to_ascii_lowercase().as_str() {
        "add" => ConsoleCommand::Add(channel("add")?),
        "remove" | "rm" => ConsoleCommand::Remove(channel("remove")?),
        "enable" => ConsoleCommand::Enable(channel("enable")?),
        "disable" => ConsoleCommand::Disable(channel("disable")?),
        "skip" => ConsoleCommand::Skip(channel("skip")?),
        "start" => ConsoleCommand::Start(channel("start")?),
        "location" => {
            if rest.is_empty() {
                return Err(Error::validation("usage: location <path>"));
            }
            ConsoleCommand::Location(PathBuf::from(rest))
        }
        "list" | "ls" => ConsoleCommand::List,
        "log" => ConsoleCommand::Log((!rest.is_empty()).then(|| rest.to_string())),
        "help" | "?" => ConsoleCommand::Help,
        other => {
            return Err(Error::validation(format!(
                "unknown command '{other}', type 'help'"
            )));
        }
    };
    Ok(Some(command))
}

/// Render tracked channels, live ones first.
pub fn format_list(registry: &StreamerRegistry) -> String {
    let names = registry.list_ordered();
    if names.is_empty() {
        return "No streamers tracked".to_string();
    }

    let mut out = format!("Download location: {}\n", registry.location().display());
    for name in names {
        let Some(state) = registry.get(&name) else {
            continue;
        };
        let mut flags = Vec::new();
        if !state.enabled {
            flags.push("disabled");
        }
        if state.skip_current {
            flags.push("skipped");
        }
        if state.is_downloading {
            flags.push("recording");
        }
        out.push_str(&format!(
            "{:<25} {:<14} {:<20} {}\n",
            name,
            state.status.as_str(),
            flags.join(","),
            state.title
        ));
    }
    out.truncate(out.trim_end().len());
    out
}

/// Apply a command and describe the outcome for the operator.
pub async fn execute(
    command: ConsoleCommand,
    reconciler: &Arc<Reconciler>,
    logging: Option<&LoggingConfig>,
) -> Result<String> {
    let message = match command {
        ConsoleCommand::Add(channel) => {
            let channel = reconciler.add_streamer(&channel)?;
            format!("Added {channel}")
        }
        ConsoleCommand::Remove(channel) => {
            if reconciler.remove_streamer(&channel).await? {
                format!("Removed {channel}")
            } else {
                format!("{channel} is not tracked")
            }
        }
        ConsoleCommand::Enable(channel) => {
            reconciler.set_enabled(&channel, true)?;
            format!("Enabled {channel}")
        }
        ConsoleCommand::Disable(channel) => {
            reconciler.set_enabled(&channel, false)?;
            format!("Disabled {channel}")
        }
        ConsoleCommand::Skip(channel) => {
            reconciler.skip_current(&channel).await?;
            format!("Skipping the current stream of {channel}")
        }
        ConsoleCommand::Start(channel) => match reconciler.start_now(&channel).await? {
            Some(capture) => format!(
                "Recording {} to {}",
                capture.channel,
                capture.output_path.display()
            ),
            None => format!("{channel} is not tracked"),
        },
        ConsoleCommand::Location(path) => {
            if reconciler.change_location(&path) {
                format!("Download location set to {}", path.display())
            } else {
                format!("Download location is already {}", path.display())
            }
        }
        ConsoleCommand::List => format_list(reconciler.registry()),
        ConsoleCommand::Log(directive) => match (logging, directive) {
            (None, _) => "Logging is not configurable".to_string(),
            (Some(logging), None) => format!("Log filter: {}", logging.get_filter()),
            (Some(logging), Some(directive)) => {
                logging.set_filter(&directive)?;
                format!("Log filter set to {directive}")
            }
        },
        ConsoleCommand::Help => HELP.to_string(),
    };
    Ok(message)
}

/// Read commands from stdin until EOF or cancellation.
pub async fn run_console(
    reconciler: Arc<Reconciler>,
    logging: Option<Arc<LoggingConfig>>,
    token: CancellationToken,
) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    println!("Type 'help' for a list of commands");

    loop {
        let line = tokio::select! {
            _ = token.cancelled() => break,
            line = lines.next_line() => line,
        };
        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => {
                debug!("Console input closed");
                break;
            }
            Err(e) => {
                warn!("Failed to read console input: {}", e);
                break;
            }
        };

        let command = match parse_command(&line) {
            Ok(Some(command)) => command,
            Ok(None) => continue,
            Err(e) => {
                println!("{e}");
                continue;
            }
        };
        match execute(command, &reconciler, logging.as_deref()).await {
            Ok(message) => println!("{message}"),
            Err(e) => println!("Error: {e}"),
        }
    }
}
