use anyhow::Result;
use clap::{Args, CommandFactory, Parser, Subcommand};
use clap_complete::{generate, Shell};
use nbridge_config::{Overrides, ThreadSafety};
use std::io;
use std::path::PathBuf;

mod commands;
mod logging;

/// Load native libraries and call their text functions.
///
/// nbridge loads a shared library by logical name, resolves exported
/// functions that take and return UTF-8 text, and calls them.
///
/// EXAMPLES:
///     nbridge run                              Run the configured startup call
///     nbridge call hello World -l greeter      Call hello("World") in libgreeter
///     nbridge check -l greeter -s hello        Check that an export resolves
///
/// ENVIRONMENT VARIABLES:
///     NBRIDGE_LIBRARY        Library name
///     NBRIDGE_LIBRARY_PATH   Extra search directories (path-list syntax)
///     NBRIDGE_FUNCTION       Startup function
///     NBRIDGE_ARGUMENT       Startup argument (default: World)
///     NBRIDGE_THREAD_SAFETY  serialized or reentrant
///     NBRIDGE_LOG            Log filter (default: info)
#[derive(Parser)]
#[command(name = "nbridge")]
#[command(version)]
#[command(propagate_version = true)]
struct Cli {
    /// Project configuration file (default: nearest nbridge.toml)
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log filter, e.g. "debug" or "nbridge_runtime=trace"
    #[arg(long, global = true, env = "NBRIDGE_LOG", value_name = "FILTER")]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

/// Options selecting and configuring the library
#[derive(Args, Debug, Default)]
struct LibraryArgs {
    /// Library name, e.g. "greeter" for libgreeter.so
    #[arg(long, short = 'l', value_name = "NAME")]
    library: Option<String>,

    /// Directory searched before all others (repeatable)
    #[arg(long = "search-path", short = 'L', value_name = "PATH")]
    search_paths: Vec<PathBuf>,

    /// Whether the library tolerates concurrent calls
    #[arg(long, value_name = "MODE")]
    thread_safety: Option<ThreadSafety>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the startup call
    ///
    /// Loads the configured library and calls the startup function with the
    /// startup argument. The result is logged and printed.
    ///
    /// EXAMPLES:
    ///     nbridge run
    ///     nbridge run -l greeter --function hello --argument Planet
    #[command(visible_alias = "r")]
    Run {
        #[command(flatten)]
        library: LibraryArgs,
        /// Startup function
        #[arg(long, short = 'f')]
        function: Option<String>,
        /// Startup argument
        #[arg(long, short = 'a')]
        argument: Option<String>,
    },

    /// Call one text function
    ///
    /// EXAMPLES:
    ///     nbridge call hello World -l greeter
    ///     nbridge call hello World -l greeter --json
    #[command(visible_alias = "c")]
    Call {
        /// Exported function name
        function: String,
        /// Text argument (default: the startup argument)
        argument: Option<String>,
        #[command(flatten)]
        library: LibraryArgs,
        /// Output the result as JSON
        #[arg(long)]
        json: bool,
    },

    /// Load a library and resolve symbols without calling them
    ///
    /// EXAMPLES:
    ///     nbridge check -l greeter
    ///     nbridge check -l greeter -s hello -s goodbye
    Check {
        #[command(flatten)]
        library: LibraryArgs,
        /// Symbol to resolve (repeatable)
        #[arg(long = "symbol", short = 's', value_name = "NAME")]
        symbols: Vec<String>,
    },

    /// Generate shell completions
    ///
    /// EXAMPLES:
    ///     nbridge completions bash > ~/.bash_completions/nbridge.bash
    ///     nbridge completions zsh > ~/.zfunc/_nbridge
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

impl LibraryArgs {
    fn overrides(&self, log_level: Option<&String>) -> Overrides {
        Overrides {
            library: self.library.clone(),
            search_paths: self.search_paths.clone(),
            thread_safety: self.thread_safety,
            log_level: log_level.cloned(),
            ..Default::default()
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let log_level = cli.log_level.as_ref();

    let (library, overrides) = match &cli.command {
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            let name = cmd.get_name().to_string();
            generate(*shell, &mut cmd, name, &mut io::stdout());
            return Ok(());
        }
        Commands::Run {
            library,
            function,
            argument,
        } => {
            let mut overrides = library.overrides(log_level);
            overrides.function = function.clone();
            overrides.argument = argument.clone();
            (library, overrides)
        }
        Commands::Call { library, .. } | Commands::Check { library, .. } => {
            (library, library.overrides(log_level))
        }
    };

    let config = commands::load_config(cli.config.as_deref(), &overrides)?;
    logging::init(config.log_level())?;
    tracing::debug!(
        project_root = ?config.project_root(),
        library = ?library.library,
        "configuration loaded"
    );

    match &cli.command {
        Commands::Run { .. } => commands::run::run(&config),
        Commands::Call {
            function,
            argument,
            json,
            ..
        } => commands::call::run(&config, function, argument.as_deref(), *json),
        Commands::Check { symbols, .. } => commands::check::run(&config, symbols),
        Commands::Completions { .. } => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_cli() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_call_args() {
        let cli = Cli::parse_from([
            "nbridge", "call", "hello", "World", "-l", "greeter", "-L", "/a", "-L", "/b", "--json",
        ]);
        match cli.command {
            Commands::Call {
                function,
                argument,
                library,
                json,
            } => {
                assert_eq!(function, "hello");
                assert_eq!(argument.as_deref(), Some("World"));
                assert_eq!(library.library.as_deref(), Some("greeter"));
                assert_eq!(
                    library.search_paths,
                    vec![PathBuf::from("/a"), PathBuf::from("/b")]
                );
                assert!(json);
            }
            _ => panic!("Expected Call command"),
        }
    }

    #[test]
    fn test_thread_safety_flag() {
        let cli = Cli::parse_from(["nbridge", "call", "hello", "--thread-safety", "reentrant"]);
        match cli.command {
            Commands::Call { library, .. } => {
                assert_eq!(library.thread_safety, Some(ThreadSafety::Reentrant))
            }
            _ => panic!("Expected Call command"),
        }
    }

    #[test]
    fn test_invalid_thread_safety_flag() {
        let result = Cli::try_parse_from(["nbridge", "call", "hello", "--thread-safety", "often"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::parse_from([
            "nbridge",
            "run",
            "--config",
            "custom.toml",
            "--log-level",
            "debug",
        ]);
        assert_eq!(cli.config, Some(PathBuf::from("custom.toml")));
        assert_eq!(cli.log_level.as_deref(), Some("debug"));
    }

    #[test]
    fn test_run_overrides() {
        let cli = Cli::parse_from(["nbridge", "r", "-l", "greeter", "-f", "hello", "-a", ""]);
        match cli.command {
            Commands::Run {
                library,
                function,
                argument,
            } => {
                let overrides = library.overrides(None);
                assert_eq!(overrides.library.as_deref(), Some("greeter"));
                assert_eq!(function.as_deref(), Some("hello"));
                assert_eq!(argument.as_deref(), Some(""));
            }
            _ => panic!("Expected Run command"),
        }
    }

    #[test]
    fn test_check_symbols() {
        let cli = Cli::parse_from(["nbridge", "check", "-s", "hello", "-s", "echo"]);
        match cli.command {
            Commands::Check { symbols, .. } => assert_eq!(symbols, vec!["hello", "echo"]),
            _ => panic!("Expected Check command"),
        }
    }

    #[test]
    fn test_completions_bash() {
        let cli = Cli::parse_from(["nbridge", "completions", "bash"]);
        match cli.command {
            Commands::Completions { shell } => assert_eq!(shell, Shell::Bash),
            _ => panic!("Expected Completions command"),
        }
    }
}
