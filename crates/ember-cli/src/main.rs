use std::{process::ExitCode, sync::Arc};

use clap::Parser;
use ember_cli::{Cli, build_runtime, init_tracing};
use tracing::{error, info};

struct StaticSite;

impl ember::Handler for StaticSite {
    // The bare binary serves the public folder (and 404s everything else);
    // applications embed the `ember` crate and bring their own handlers.
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            // Exit code 1 for argument errors; --help/--version exit clean.
            let is_error = err.use_stderr();
            let _ = err.print();
            return if is_error { ExitCode::from(1) } else { ExitCode::SUCCESS };
        }
    };

    init_tracing(cli.verbose);
    if cli.preload {
        info!("preload requested: warming up before fork");
    }

    let runtime = match build_runtime(cli, Arc::new(StaticSite)) {
        Ok(runtime) => runtime,
        Err(err) => {
            error!(%err, "invalid configuration");
            return ExitCode::from(err.exit_code() as u8);
        }
    };

    match ember::start(runtime) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(%err, "fatal");
            ExitCode::from(err.exit_code() as u8)
        }
    }
}
