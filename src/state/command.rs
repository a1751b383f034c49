use std::fmt;

/// Where a session's decoded text goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sink {
    /// Appended to a growing model message in the transcript.
    Transcript,
    /// Appended to the simulation log; progress markers drive the indicator.
    Simulation,
}

/// The closed set of named operations the viewer can issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NamedCommand {
    CfdSimulation,
    FloodRouting,
    SedimentTransport,
    Diagram,
}

impl NamedCommand {
    pub const ALL: [NamedCommand; 4] = [
        NamedCommand::CfdSimulation,
        NamedCommand::FloodRouting,
        NamedCommand::SedimentTransport,
        NamedCommand::Diagram,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            NamedCommand::CfdSimulation => "run_cfd_simulation",
            NamedCommand::FloodRouting => "run_flood_routing",
            NamedCommand::SedimentTransport => "run_sediment_transport",
            NamedCommand::Diagram => "generate_diagram",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        let name = name.trim();
        Self::ALL
            .into_iter()
            .find(|command| command.as_str().eq_ignore_ascii_case(name))
    }

    /// Long-running analyses stream into the simulation log.
    pub fn is_long_running(self) -> bool {
        !matches!(self, NamedCommand::Diagram)
    }
}

/// A command as sent by the user, resolved once when its session starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    FreeText(String),
    Named(NamedCommand),
}

impl Command {
    pub fn parse(input: &str) -> Self {
        match NamedCommand::from_name(input) {
            Some(named) => Command::Named(named),
            None => Command::FreeText(input.to_string()),
        }
    }

    pub fn sink(&self) -> Sink {
        match self {
            Command::Named(named) if named.is_long_running() => Sink::Simulation,
            Command::Named(_) | Command::FreeText(_) => Sink::Transcript,
        }
    }

    /// Text forwarded to the proxy.
    pub fn message(&self) -> &str {
        match self {
            Command::FreeText(text) => text,
            Command::Named(named) => named.as_str(),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}
