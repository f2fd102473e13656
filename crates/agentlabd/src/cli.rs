use std::{ffi::OsString, path::PathBuf};

use clap::Parser;

use crate::config::DEFAULT_CONFIG_PATH;

const LONG_FLAGS: [&str; 2] = ["config", "version"];

#[derive(Debug, Parser)]
#[command(
    name = "agentlabd",
    about = "AgentLab controller daemon",
    disable_version_flag = true
)]
pub struct Cli {
    /// Path to the YAML config file.
    #[arg(long, value_name = "PATH", default_value = DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,

    /// Print version information and exit.
    #[arg(long)]
    pub version: bool,
}

impl Cli {
    /// Parses `args`, accepting `-config` and `-version` as well as the
    /// double-dash spellings.
    pub fn parse_args<I, T>(args: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString>,
    {
        Self::parse_from(normalize_args(args))
    }

    pub fn try_parse_args<I, T>(args: I) -> Result<Self, clap::Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString>,
    {
        Self::try_parse_from(normalize_args(args))
    }
}

pub fn normalize_args<I, T>(args: I) -> Vec<OsString>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString>,
{
    args.into_iter()
        .map(Into::into)
        .map(|arg| {
            let Some(text) = arg.to_str() else {
                return arg;
            };
            let Some(flag) = text.strip_prefix('-') else {
                return arg;
            };
            if flag.starts_with('-') {
                return arg;
            }
            let name = flag.split_once('=').map_or(flag, |(name, _)| name);
            if LONG_FLAGS.contains(&name) {
                OsString::from(format!("-{text}"))
            } else {
                arg
            }
        })
        .collect()
}

pub fn version_string() -> String {
    format!(
        "agentlabd version={} commit={} date={}",
        env!("CARGO_PKG_VERSION"),
        option_env!("AGENTLAB_BUILD_COMMIT").unwrap_or("unknown"),
        option_env!("AGENTLAB_BUILD_DATE").unwrap_or("unknown"),
    )
}
