//! vidcap agent
//!
//! Watches a USB capture channel and records one video file per stable,
//! capturable signal interval.

mod app;
mod audio;
mod capture;
mod config;
mod controller;
mod crash;
mod logging;
mod notifications;
mod recorder;
mod session;
mod shutdown;
mod worker;

use clap::Parser;
use std::path::PathBuf;
use tracing::{error, info};

use app::{Options, EXIT_CONFIG_RELOAD, EXIT_OK, EXIT_USAGE};

#[derive(Parser, Debug)]
#[command(name = "vidcap-agent", about, disable_version_flag = true)]
struct Cli {
    /// Agent home directory (config, crash log, default output)
    #[arg(short = 'd', long)]
    home: Option<PathBuf>,

    /// Output directory template, `{year}` and `{month}` are expanded
    #[arg(short, long)]
    output: Option<String>,

    /// TOML config file [default: <home>/config.toml]. YAML configs
    /// (`config.yaml`) are not read and must be converted to TOML.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Also write the log to this file
    #[arg(short, long)]
    file_log: Option<PathBuf>,

    /// Echo recorder output to the main log
    #[arg(short, long)]
    top_log: bool,

    #[arg(short, long)]
    verbose: bool,

    /// Print the version
    #[arg(short = 'V', long)]
    version: bool,

    /// Print version and build details
    #[arg(long)]
    version_full: bool,

    /// List capture devices and exit
    #[arg(
        short,
        long,
        num_args = 0..=1,
        default_missing_value = "all",
        value_parser = ["all", "audio", "video"]
    )]
    list_devices: Option<String>,

    /// Check the external process commands and exit
    #[arg(
        short,
        long,
        num_args = 0..=1,
        default_missing_value = "all",
        value_parser = ["all", "status", "exec"]
    )]
    ext_proc: Option<String>,
}

fn version_full() -> String {
    format!(
        "{} {} ({} build, {}-{})",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION"),
        if cfg!(debug_assertions) { "debug" } else { "release" },
        std::env::consts::ARCH,
        std::env::consts::OS,
    )
}

fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let code = if e.use_stderr() { EXIT_USAGE } else { EXIT_OK };
            let _ = e.print();
            std::process::exit(code);
        }
    };

    if cli.version {
        println!("{}", env!("CARGO_PKG_VERSION"));
        return;
    }
    if cli.version_full {
        println!("{}", version_full());
        return;
    }

    let guard = match logging::init_logging(cli.verbose, cli.file_log.as_deref()) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {:#}", e);
            std::process::exit(app::EXIT_CANTCREAT);
        }
    };

    let code = dispatch(&cli);

    // Flush the file log before exec or exit skip destructors.
    drop(guard);
    if code == EXIT_CONFIG_RELOAD {
        restart();
    }
    std::process::exit(code);
}

fn dispatch(cli: &Cli) -> i32 {
    let config_path = cli
        .config
        .clone()
        .or_else(|| cli.home.as_ref().map(|h| h.join(config::CONFIG_FILE_NAME)));

    if let Some(mode) = &cli.list_devices {
        let config = config_path
            .as_deref()
            .and_then(|path| config::Config::load(path).ok());
        return match app::list_devices(mode, config.as_ref()) {
            Ok(()) => EXIT_OK,
            Err(e) => {
                error!("{:#}", e);
                EXIT_USAGE
            }
        };
    }

    if let Some(mode) = &cli.ext_proc {
        let Some(path) = config_path else {
            error!("--ext-proc needs --config or --home");
            return EXIT_USAGE;
        };
        return app::check_ext_proc(&path, mode);
    }

    let Some(home) = cli.home.clone() else {
        error!("--home is required");
        return EXIT_USAGE;
    };
    let crash_log = crash::init_crash_handler(&home);
    info!("{} starting, crash log at {}", version_full(), crash_log.display());

    app::run(&Options {
        home,
        output: cli.output.clone(),
        config: cli.config.clone(),
        top_log: cli.top_log,
    })
}

/// Replace this process with a fresh copy of itself, same arguments.
fn restart() -> ! {
    let args: Vec<_> = std::env::args_os().skip(1).collect();
    let exe = match std::env::current_exe() {
        Ok(exe) => exe,
        Err(e) => {
            eprintln!("Cannot restart, executable path unknown: {}", e);
            std::process::exit(EXIT_CONFIG_RELOAD);
        }
    };

    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        let err = std::process::Command::new(&exe).args(&args).exec();
        // exec() only returns on error
        eprintln!("exec failed: {}", err);
    }

    match std::process::Command::new(&exe).args(&args).spawn() {
        Ok(_) => std::process::exit(EXIT_OK),
        Err(e) => {
            eprintln!("Restart failed: {}", e);
            std::process::exit(EXIT_CONFIG_RELOAD);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_flags() {
        let cli = Cli::try_parse_from(["vidcap-agent", "-d", "/home/rig", "-t", "-v", "-l"]).unwrap();
        assert_eq!(cli.home, Some(PathBuf::from("/home/rig")));
        assert!(cli.top_log);
        assert!(cli.verbose);
        assert_eq!(cli.list_devices.as_deref(), Some("all"));
        assert!(cli.ext_proc.is_none());

        let cli = Cli::try_parse_from(["vidcap-agent", "--ext-proc", "status", "-c", "x.toml"]).unwrap();
        assert_eq!(cli.ext_proc.as_deref(), Some("status"));
        assert_eq!(cli.config, Some(PathBuf::from("x.toml")));
    }

    #[test]
    fn test_config_help_names_format() {
        use clap::CommandFactory;
        let cmd = Cli::command();
        let arg = cmd.get_arguments().find(|a| a.get_id() == "config").unwrap();
        let help = arg.get_long_help().or(arg.get_help()).unwrap().to_string();
        assert!(help.contains("TOML"));
        assert!(help.contains("config.yaml"));
    }

    #[test]
    fn test_cli_rejects_unknown_mode() {
        assert!(Cli::try_parse_from(["vidcap-agent", "-l", "midi"]).is_err());
    }

    #[test]
    fn test_version_full() {
        assert!(version_full().starts_with(&format!("vidcap-agent {}", env!("CARGO_PKG_VERSION"))));
    }
}
