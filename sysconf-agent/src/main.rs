mod application;
mod engine;
mod handlers;
mod interrupt;
mod logging;
mod options;
mod session;
mod supervisor;

use anyhow::Result;
use application::handle_result;
use clap::{CommandFactory as _, Parser, Subcommand};
use options::Options;

fn main() {
    let args = Args::parse();
    handle_result(run_args(args));
}

fn run_args(args: Args) -> Result<()> {
    match &args.command {
        None => run_agent(&args.options),
        Some(Commands::GenerateMan) => (|| {
            let cmd = Args::command();
            let man = clap_mangen::Man::new(cmd);
            let mut buffer: Vec<u8> = Default::default();
            man.render(&mut buffer)?;
            println!("{}", String::from_utf8(buffer)?);
            Ok(())
        })(),
        Some(Commands::GenerateMarkdown) => {
            let opts = clap_markdown::MarkdownOptions::new().show_footer(false);
            let markdown: String = clap_markdown::help_markdown_custom::<Args>(&opts);
            println!("{}", markdown);
            Ok(())
        }
    }
}

fn run_agent(options: &Options) -> Result<()> {
    logging::set_up(&logging::Options {
        verbose: options.verbose,
        color: options.use_color(),
    })?;
    let interrupt_state = interrupt::set_up_process_interrupt_handler()?;
    application::block_on(application::run(options, interrupt_state))
}

/// Apply `ietf-system` configuration from a configuration store to this host
///
/// The store session runs over stdin and stdout, one JSON message per line.
/// Logs are written to stderr.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Option<Commands>,

    #[command(flatten)]
    options: Options,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Generate markdown documentation for sysconf-agent
    #[command(hide = true)]
    GenerateMarkdown,

    /// Generate a manpage for sysconf-agent
    #[command(hide = true)]
    GenerateMan,
}
