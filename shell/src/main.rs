use argh::FromArgs;
use msh::Interpreter;
use std::io::Write;
use tracing_subscriber::EnvFilter;

/// Log filter taken from the environment before `--log` is consulted.
const LOG_ENV: &str = "MSH_LOG";

#[derive(FromArgs)]
/// A minimal interactive shell with pipelines, redirection and a few built-ins.
struct Options {
    /// run this line and exit with its status instead of reading input
    #[argh(option, short = 'c')]
    command: Option<String>,

    /// default log filter, e.g. `debug` or `msh=trace` (MSH_LOG takes precedence)
    #[argh(option, default = "String::from(\"warn\")")]
    log: String,
}

fn init_logging(default_filter: &str) {
    let filter = EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_new(default_filter))
        .unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() {
    let options: Options = argh::from_env();
    init_logging(&options.log);

    let mut sh = Interpreter::new();
    let code = match options.command {
        Some(line) => sh.run_line(&line).unwrap_or_else(|e| {
            eprintln!("msh: {e}");
            e.exit_code()
        }),
        None => sh.repl().unwrap_or_else(|e| {
            eprintln!("msh: {e:#}");
            1
        }),
    };
    let _ = std::io::stdout().flush();
    std::process::exit(code);
}
