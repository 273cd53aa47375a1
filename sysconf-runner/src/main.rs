/// The sysconf-runner executable
///
/// Plays the configuration store for one agent process, so an agent can be
/// exercised without a store.
use anyhow::{bail, Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use sysconf_core::model::{Change, ChangeSet, Leaf, SystemConfig, Verdict};
use sysconf_runner::{spawn_agent, AgentConfig};

fn main() -> Result<()> {
    let args = Args::parse();

    let action = match &args.command {
        Commands::GenerateMan => {
            let cmd = Args::command();
            let man = clap_mangen::Man::new(cmd);
            let mut buffer: Vec<u8> = Default::default();
            man.render(&mut buffer)?;
            println!("{}", String::from_utf8(buffer)?);
            return Ok(());
        }
        Commands::GenerateMarkdown => {
            let opts = clap_markdown::MarkdownOptions::new().show_footer(false);
            let markdown: String = clap_markdown::help_markdown_custom::<Args>(&opts);
            println!("{}", markdown);
            return Ok(());
        }
        Commands::Apply { set, delete } => Action::Apply(parse_changes(set, delete)?),
        Commands::Get { leaf } => Action::Get(*leaf),
        Commands::Platform => Action::Platform,
    };

    set_up_logging(args.verbose);
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("initializing tokio runtime")?;
    runtime.block_on(run(&args, action))
}

/// What to do once the agent is ready.
enum Action {
    Apply(ChangeSet),
    Get(Option<Leaf>),
    Platform,
}

fn set_up_logging(verbose: bool) {
    let level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::WARN
    };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_max_level(level)
        .init();
}

async fn run(args: &Args, action: Action) -> Result<()> {
    let initial = match &args.initial_config_json {
        Some(json) => serde_json::from_str::<SystemConfig>(json)
            .context("failed to parse value of --initial-config-json")?,
        None => SystemConfig::default(),
    };
    let config = AgentConfig {
        agent_executable: args.agent_exe.clone(),
        agent_args: args.agent_args.clone(),
    };
    let (mut child, mut client) = spawn_agent(&config, initial).await?;
    if let Some(seed) = client.seeded() {
        eprintln!(
            "agent seeded the configuration: {}",
            serde_json::to_string(seed)?
        );
    }

    let result = match action {
        Action::Apply(changes) => {
            let verdict = client.apply(changes).await?;
            println!("{}", serde_json::to_string_pretty(&verdict)?);
            match verdict {
                Verdict::Accept => Ok(()),
                Verdict::Abort { reason, .. } => {
                    Err(anyhow::anyhow!("transaction aborted: {}", reason))
                }
            }
        }
        Action::Get(Some(leaf)) => {
            let value = client.leaf(leaf).await?;
            println!("{}", serde_json::to_string(&value)?);
            Ok(())
        }
        Action::Get(None) => {
            let state = client.config_state().await?;
            println!("{}", serde_json::to_string_pretty(&state)?);
            Ok(())
        }
        Action::Platform => {
            let (platform, clock) = client.system_state().await?;
            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({
                    "platform": platform,
                    "clock": clock,
                }))?
            );
            Ok(())
        }
    };

    client.close().await?;
    let status = child.wait().await.context("waiting for the agent")?;
    if !status.success() {
        bail!("agent exited with {}", status);
    }
    result
}

fn parse_changes(set: &[String], delete: &[Leaf]) -> Result<ChangeSet> {
    let mut changes = Vec::new();
    for assignment in set {
        let (leaf, value) = assignment
            .split_once('=')
            .with_context(|| format!("expected LEAF=VALUE, got {:?}", assignment))?;
        let leaf: Leaf = leaf.parse()?;
        changes.push(Change::modified(leaf, leaf.parse_value(value)?));
    }
    changes.extend(delete.iter().map(|leaf| Change::deleted(*leaf)));
    ChangeSet::new(changes)
}

/// Run a sysconf agent against a stand-in configuration store
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,

    /// The agent executable
    #[arg(long, global = true, default_value = "sysconf-agent")]
    agent_exe: String,

    /// An argument to pass to the agent; repeat for more
    #[arg(long = "agent-arg", global = true, value_name = "ARG", allow_hyphen_values = true)]
    agent_args: Vec<String>,

    /// The configuration held by the stand-in store when the agent starts,
    /// as a JSON object such as `{"hostname": "h", "ntp-enabled": true}`.
    /// Without it the store is empty, and the agent seeds it.
    #[arg(long, global = true)]
    initial_config_json: Option<String>,

    #[arg(short, long, global = true, default_value = "false")]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Submit one transaction and print the verdict
    Apply {
        /// Set a leaf, e.g. `contact=ops@example.org` or `ntp-enabled=true`
        #[arg(long, value_name = "LEAF=VALUE")]
        set: Vec<String>,

        /// Delete a leaf from the configuration
        #[arg(long, value_name = "LEAF")]
        delete: Vec<Leaf>,
    },

    /// Print the operational state, or the value of a single leaf
    Get {
        leaf: Option<Leaf>,
    },

    /// Print the platform and clock state
    Platform,

    /// Generate markdown documentation for sysconf-runner
    #[command(hide = true)]
    GenerateMarkdown,

    /// Generate a manpage for sysconf-runner
    #[command(hide = true)]
    GenerateMan,
}

#[cfg(test)]
mod tests {
    use super::*;
    use sysconf_core::model::{LeafValue, Operation};

    #[test]
    fn test_parse_changes() {
        let changes = parse_changes(
            &["contact=a=b".to_string(), "ntp-enabled=true".to_string()],
            &[Leaf::Location],
        )
        .unwrap();
        assert_eq!(changes.len(), 3);
        assert_eq!(
            changes.get(Leaf::Contact).unwrap().value,
            Some(LeafValue::Text("a=b".to_string()))
        );
        assert_eq!(
            changes.get(Leaf::NtpEnabled).unwrap().value,
            Some(LeafValue::Bool(true))
        );
        assert_eq!(
            changes.get(Leaf::Location).unwrap().operation,
            Operation::Deleted
        );
    }

    #[test]
    fn test_parse_changes_errors() {
        assert!(parse_changes(&["hostname".to_string()], &[]).is_err());
        assert!(parse_changes(&["ntp-enabled=on".to_string()], &[]).is_err());
        assert!(parse_changes(&["hostname=a".to_string()], &[Leaf::Hostname]).is_err());
        assert!(parse_changes(&["timezone=UTC".to_string()], &[]).is_err());
    }

    #[test]
    fn test_args() {
        Args::command().debug_assert();
        let args = Args::try_parse_from([
            "sysconf-runner",
            "apply",
            "--set",
            "hostname=h",
            "--delete",
            "/ietf-system:system/location",
            "--agent-arg",
            "--data-dir=/tmp/x",
        ])
        .unwrap();
        match args.command {
            Commands::Apply { set, delete } => {
                assert_eq!(set, vec!["hostname=h".to_string()]);
                assert_eq!(delete, vec![Leaf::Location]);
            }
            other => panic!("unexpected command {:?}", other),
        }
        assert_eq!(args.agent_args, vec!["--data-dir=/tmp/x".to_string()]);
    }
}
