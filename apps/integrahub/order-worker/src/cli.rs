use clap::Parser;
use domain_orders::ConsumerRole;
use std::path::PathBuf;

#[derive(Parser, Debug, Clone)]
#[command(name = "order-worker")]
#[command(about = "Run the order pipeline consumers")]
pub struct Cli {
    /// Consumer roles to run (inventory, notifications, analytics). Defaults to all.
    #[arg(short, long, value_delimiter = ',')]
    pub roles: Option<Vec<ConsumerRole>>,

    /// Port of the health and admin server. Overrides HEALTH_PORT.
    #[arg(long)]
    pub health_port: Option<u16>,

    /// JSON file with an array of orders to submit through the gateway at startup
    #[arg(long)]
    pub seed: Option<PathBuf>,
}

impl Cli {
    pub fn roles(&self) -> Vec<ConsumerRole> {
        match &self.roles {
            Some(roles) if !roles.is_empty() => {
                let mut unique = Vec::with_capacity(roles.len());
                for role in roles {
                    if !unique.contains(role) {
                        unique.push(*role);
                    }
                }
                unique
            }
            _ => ConsumerRole::all(),
        }
    }
}
