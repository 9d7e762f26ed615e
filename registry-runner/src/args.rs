use clap::{ArgAction, Args, Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "registry-runner")]
#[command(author, version, about = "Provisions a container registry VM on OpenStack", long_about = None)]
pub struct Cli {
    /// Verbose logging
    #[arg(long, short, action = ArgAction::SetTrue)]
    pub verbose: bool,

    /// Configuration file
    #[arg(long, short, default_value = "config.toml")]
    pub file: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Provision the registry and wait until it is ready
    Up,
    /// Show the provisioning steps in execution order
    Plan,
    /// Print the outputs of the last completed run
    Outputs(OutputsArgs),
    /// Delete every provisioned cloud resource
    Destroy,
}

#[derive(Debug, Args)]
pub struct OutputsArgs {
    /// Print as JSON
    #[arg(long, action = ArgAction::SetTrue)]
    pub json: bool,
}
