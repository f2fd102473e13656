use std::process::ExitCode;

use agentlabd::{cli, server, telemetry, Cli, Config};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse_args(std::env::args_os());
    if cli.version {
        println!("{}", cli::version_string());
        return ExitCode::SUCCESS;
    }

    let config = match Config::load(&cli.config) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("agentlabd: {err}");
            return ExitCode::from(1);
        }
    };

    let _telemetry = match telemetry::init("agentlabd") {
        Ok(guard) => guard,
        Err(err) => {
            eprintln!("agentlabd: failed to initialize logging: {err:#}");
            return ExitCode::from(1);
        }
    };

    match server::run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(error = %format!("{err:#}"), "agentlabd exited");
            ExitCode::from(1)
        }
    }
}
