use clap::Parser;

#[derive(Debug, Parser, Clone)]
#[clap(
    version,
    about = "Distributed load-generation agent: connects to a console, receives test definitions, and supervises a fleet of worker processes."
)]
pub struct AgentArgs {
    /// Agent home directory (worker logs and the file store live here)
    #[arg(long, default_value = ".foreman")]
    pub home: String,

    /// Agent properties file (key=value lines)
    #[arg(long)]
    pub properties: Option<String>,

    /// Console host (overrides grinder.consoleHost)
    #[arg(long = "console-host")]
    pub console_host: Option<String>,

    /// Console port (overrides grinder.consolePort)
    #[arg(long = "console-port")]
    pub console_port: Option<u16>,

    /// Run the test from local properties when the console is unreachable
    #[arg(long = "proceed-without-console")]
    pub proceed_without_console: bool,

    /// Verbose logging
    #[arg(long, short)]
    pub verbose: bool,
}
