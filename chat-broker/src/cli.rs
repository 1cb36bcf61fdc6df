use clap::Parser;

use crate::{
    config::{BrokerConfig, DEFAULT_INGRESS_CAPACITY},
    message::UserId,
};

/// Runs a broker in-process. Reads JSON message lines from stdin and prints
/// every delivery as a JSON line on stdout.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Users to register, comma separated. Each gets its own mailbox.
    #[arg(long, value_delimiter = ',', required = true, value_parser = parse_user)]
    pub users: Vec<UserId>,

    /// Messages that can wait for dispatch before senders block.
    #[arg(long, default_value_t = DEFAULT_INGRESS_CAPACITY)]
    pub ingress_capacity: usize,

    /// Per-user mailbox capacity. Use 0 for unbounded mailboxes.
    #[arg(long, default_value_t = 16)]
    pub mailbox_capacity: usize,
}

impl Cli {
    pub fn broker_config(&self) -> BrokerConfig {
        BrokerConfig::with_ingress_capacity(self.ingress_capacity)
    }

    /// Users in command-line order with repeats removed.
    pub fn unique_users(&self) -> Vec<UserId> {
        let mut users: Vec<UserId> = Vec::with_capacity(self.users.len());
        for user in &self.users {
            if !users.contains(user) {
                users.push(user.clone());
            }
        }
        users
    }
}

fn parse_user(raw: &str) -> Result<UserId, String> {
    let user = raw.trim();
    if user.is_empty() {
        return Err("user id cannot be empty".to_string());
    }
    Ok(user.to_string())
}
