// ABOUTME: Command-line interface definition using clap derive macros.
// ABOUTME: Defines all subcommands and their arguments.

use clap::{Args, Parser, Subcommand};
use shipwright::config::Overrides;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "shipwright")]
#[command(about = "Provision a host, deploy a workload to it, and verify the result")]
#[command(version)]
pub struct Cli {
    /// Show debug logs
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Only print the final result
    #[arg(short, long, global = true, conflicts_with = "json")]
    pub quiet: bool,

    /// Print JSON lines instead of text
    #[arg(long, global = true)]
    pub json: bool,

    /// Project directory containing shipwright.yml
    #[arg(short = 'C', long = "dir", global = true)]
    pub dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Values that replace the configuration file's.
#[derive(Args, Debug, Default)]
pub struct OverrideArgs {
    /// Project identifier
    #[arg(long)]
    pub project: Option<String>,

    /// Cloud region
    #[arg(long)]
    pub region: Option<String>,

    /// Cloud zone
    #[arg(long)]
    pub zone: Option<String>,

    /// Public domain to issue a certificate for
    #[arg(long)]
    pub domain: Option<String>,

    /// Contact address for the certificate authority
    #[arg(long)]
    pub email: Option<String>,

    /// Version tag of the workload
    #[arg(long = "version-tag")]
    pub version_tag: Option<String>,
}

impl From<OverrideArgs> for Overrides {
    fn from(args: OverrideArgs) -> Self {
        Overrides {
            project: args.project,
            region: args.region,
            zone: args.zone,
            domain: args.domain,
            admin_email: args.email,
            version: args.version_tag,
        }
    }
}

#[derive(Subcommand)]
pub enum Commands {
    /// Initialize a new shipwright.yml configuration file
    Init {
        /// Project identifier (defaults to my-app)
        #[arg(long)]
        project: Option<String>,

        /// Overwrite an existing configuration file
        #[arg(short, long)]
        force: bool,
    },

    /// Run the deployment, or resume an interrupted one
    Deploy {
        #[command(flatten)]
        overrides: OverrideArgs,

        /// Resume the most recent run
        #[arg(long, conflicts_with = "run_id")]
        resume: bool,

        /// Resume a specific run
        #[arg(long)]
        run_id: Option<String>,

        /// Re-run a stage that already succeeded (repeatable)
        #[arg(long = "force-stage", value_name = "STAGE")]
        force_stage: Vec<String>,

        /// Break an existing run lock
        #[arg(long)]
        force_unlock: bool,

        /// Maximum stages in flight at once
        #[arg(long)]
        workers: Option<usize>,
    },

    /// Show the persisted state of a run
    Status {
        /// Run to show (defaults to the most recent)
        #[arg(long)]
        run_id: Option<String>,
    },

    /// Delete the persisted state of a run
    Purge {
        /// Run to delete
        #[arg(long)]
        run_id: String,
    },

    /// Tear down the provisioned infrastructure
    Destroy {
        #[command(flatten)]
        overrides: OverrideArgs,

        /// Confirm the teardown
        #[arg(long)]
        yes: bool,
    },
}
