use clap::{Parser, ValueEnum};
use std::fmt;
use tracing::Level;

/// AProxy: a MySQL-to-PostgreSQL translating proxy.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    #[arg(default_value_t = String::from("aproxy.toml"), env)]
    pub config_file: String,

    #[arg(short, long, env)]
    pub log_level: Option<Level>,

    #[clap(short = 'F', long, value_enum, env)]
    pub log_format: Option<LogFormat>,

    #[arg(
        short,
        long,
        default_value_t = false,
        env,
        help = "disable colors in the log output"
    )]
    pub no_color: bool,

    #[arg(
        short = 't',
        long = "test-config",
        default_value_t = false,
        help = "test configuration file and exit"
    )]
    pub test_config: bool,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Structured,
    Debug,
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogFormat::Text => write!(f, "text"),
            LogFormat::Structured => write!(f, "structured"),
            LogFormat::Debug => write!(f, "debug"),
        }
    }
}

pub fn parse() -> Args {
    Args::parse()
}
