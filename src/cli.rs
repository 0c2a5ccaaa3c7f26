use crate::bootchain::read_boot_chains;
use crate::dirs;
use crate::secboot::sealed_keys_method;
use crate::state::{self, ParamsKey, Role, ALL_CONTAINERS};
use clap::{Parser, Subcommand};
use eyre::Result;
use std::env;
use std::path::PathBuf;

const TPM_ENV_VAR: &str = "TCTI";

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Root directory the FDE state lives under
    #[arg(short, long, value_name = "dir", default_value = "/", env = "FDE_ROOT")]
    root: PathBuf,

    /// TPM device specified in TCTI format
    #[arg(short = 'T', long, default_value = "device:/dev/tpmrm0", env = TPM_ENV_VAR)]
    tcti: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show sealing method, keyslot roles and pending operations
    Status,
    /// Print the recorded predictable boot chains
    BootChains {
        /// Print the recovery chains instead of the run mode chains
        #[arg(long)]
        recovery: bool,
    },
    /// Print the committed sealing parameters of one keyslot role
    Params {
        /// Keyslot role, one of run, run+recover, recover
        #[arg(value_name = "role")]
        role: Role,

        /// Container role the parameters were committed for
        #[arg(long, value_name = "name", default_value = ALL_CONTAINERS)]
        container_role: String,
    },
}

impl Cli {
    pub fn new() -> Self {
        let cli = Cli::parse();
        env::set_var(TPM_ENV_VAR, &cli.tcti);
        cli
    }

    pub fn run(&self) -> Result<&Self> {
        match &self.command {
            Commands::Status => self.show_status()?,
            Commands::BootChains { recovery } => self.show_boot_chains(*recovery)?,
            Commands::Params {
                role,
                container_role,
            } => self.show_params(*role, container_role)?,
        };
        Ok(self)
    }

    fn show_status(&self) -> Result<()> {
        match sealed_keys_method(&self.root)? {
            Some(method) => println!("sealing method: {method}"),
            None => {
                println!("sealing method: none (device is not sealed)");
                return Ok(());
            }
        }
        let state = state::load(&self.root)?;
        let mut roles: Vec<_> = state.roles.iter().collect();
        roles.sort_by_key(|(role, _)| **role);
        for (role, info) in roles {
            println!(
                "role {role}: primary key {}, revocation counter {}, {} catalog entries",
                info.primary_key_id,
                info.pcr_policy_revocation_counter,
                info.parameters.len()
            );
        }
        for op in &state.pending_external_operations {
            println!(
                "pending operation {} ({}): {}",
                op.change_id, op.kind, op.status
            );
        }
        Ok(())
    }

    fn show_boot_chains(&self, recovery: bool) -> Result<()> {
        let path = if recovery {
            dirs::recovery_boot_chains_file_under(&self.root)
        } else {
            dirs::boot_chains_file_under(&self.root)
        };
        let (chains, reseal_count) = read_boot_chains(&path)?;
        println!("reseal count: {reseal_count}");
        println!("{}", serde_json::to_string_pretty(&*chains)?);
        Ok(())
    }

    fn show_params(&self, role: Role, container_role: &str) -> Result<()> {
        let state = state::load(&self.root)?;
        let key = ParamsKey {
            role,
            container_role: container_role.to_string(),
        };
        match state.parameters(&key) {
            Some(params) => {
                println!("boot modes: {}", params.boot_modes.join(","));
                for model in &params.models {
                    println!("model: {}", model.unique_id());
                }
                match &params.tpm_pcr_profile {
                    Some(profile) => println!("pcr profile: {}", hex::encode(profile)),
                    None => println!("pcr profile: none"),
                }
            }
            None => println!("no parameters for role {role} and container {container_role}"),
        }
        Ok(())
    }
}
