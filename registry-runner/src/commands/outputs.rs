use anyhow::Result;
use common::{config::parse_config, exit};

use crate::{
    args::{Cli, OutputsArgs},
    commands::up::STATE_FILE,
    outputs::Exports,
    state::State,
};

pub async fn outputs(cli: &Cli, args: &OutputsArgs) -> Result<()> {
    let config = parse_config(&cli.file)?;
    let state = State::load(&config.realm()?.join(STATE_FILE))?;
    if !state.is_complete() {
        exit!(
            "provisioning incomplete",
            "{} has not been fully provisioned, run `registry-runner up` first",
            config.registry_fqdn()
        );
    }

    let exports = Exports::from_outputs(state.resources())?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&exports)?);
    } else {
        exports.print();
    }
    Ok(())
}
