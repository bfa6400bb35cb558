//! CLI command definitions.
//!
//! Provides subcommands for:
//! - Running the orchestrator API (`serve`, the default)
//! - Switching to a customer once and printing the report (`switch`)
//! - Listing catalog customers (`customers`)
//! - Removing leftover integration containers (`cleanup-orphans`)

use std::path::PathBuf;

use clap::{ColorChoice, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "toolfleet")]
#[command(about = "Starts, health-checks and evicts per-customer integration workers")]
#[command(
    long_about = "toolfleet keeps the integration workers of a bounded number of customers warm.\nExamples:\n  toolfleet serve  # Run the HTTP API\n  toolfleet switch acme  # Bring up acme's integrations and print the report"
)]
#[command(version)]
#[command(color = ColorChoice::Auto)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Customer catalog path
    #[arg(long, global = true, env = "TOOLFLEET_CATALOG")]
    pub catalog: Option<PathBuf>,

    /// Emit JSON logs and JSON command output
    #[arg(long, global = true)]
    pub json: bool,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Run the HTTP API (default if no subcommand given)
    #[command(
        about = "Run the HTTP API",
        long_about = "Serves the switch/cleanup/status API until Ctrl-C, then stops every worker.\nExample: toolfleet serve"
    )]
    Serve,

    /// Switch to a customer and print the per-integration report
    #[command(
        about = "Switch to a customer",
        long_about = "Starts every integration the customer requires and prints the report.\nWorkers are stopped on exit unless --keep is given.\nExample: toolfleet switch acme --keep"
    )]
    Switch {
        /// Customer name from the catalog
        customer: String,

        /// Leave the workers running after the command exits
        #[arg(long)]
        keep: bool,
    },

    /// List catalog customers
    Customers,

    /// Remove managed containers no longer tracked by any record
    CleanupOrphans,
}

impl Cli {
    pub fn command_or_default(&self) -> Command {
        self.command.clone().unwrap_or(Command::Serve)
    }
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn test_cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_default_command_is_serve() {
        let cli = Cli::parse_from(["toolfleet"]);
        assert_eq!(cli.command_or_default(), Command::Serve);
    }

    #[test]
    fn test_catalog_flag_after_subcommand() {
        let cli = Cli::parse_from(["toolfleet", "customers", "--catalog", "/tmp/fleet.json"]);
        assert_eq!(cli.catalog, Some(PathBuf::from("/tmp/fleet.json")));
        assert_eq!(cli.command_or_default(), Command::Customers);
    }

    #[test]
    fn test_switch_with_global_flags() {
        let cli = Cli::parse_from(["toolfleet", "switch", "acme", "--keep", "--json"]);
        assert!(cli.json);
        assert_eq!(
            cli.command_or_default(),
            Command::Switch {
                customer: "acme".to_string(),
                keep: true
            }
        );
    }
}
