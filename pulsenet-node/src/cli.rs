use clap::Parser;

#[derive(Debug, Parser)]
#[command(name = "pulsenet-node")]
#[command(about = "Pulse-synchronized membership node")]
pub struct Args {
    /// Node configuration file
    #[arg(long = "config", default_value = "config.json")]
    pub config_path: String,

    /// UDP address to listen on, overrides the config
    #[arg(long = "listen")]
    pub listen_addr: Option<String>,

    /// Hex-encoded ed25519 seed, generated when missing
    #[arg(long = "keypair", default_value = "keys/node.key")]
    pub keypair_path: String,

    /// Run ephemeral pulses instead of waiting for a pulsar
    #[arg(long)]
    pub ephemeral: bool,

    /// Write a single-node config and exit
    #[arg(long)]
    pub init: bool,

    /// Issue a profile extension into this joiner config and exit
    #[arg(long = "issue-for", requires = "joiner_key")]
    pub issue_for: Option<String>,

    /// Hex-encoded public key of the joiner the extension is issued for
    #[arg(long = "joiner-key")]
    pub joiner_key: Option<String>,

    /// Startup power granted by the issued extension
    #[arg(long, default_value_t = 1)]
    pub power: u8,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let args = Args::parse_from(["pulsenet-node"]);
        assert_eq!(args.config_path, "config.json");
        assert_eq!(args.keypair_path, "keys/node.key");
        assert!(args.listen_addr.is_none());
        assert!(!args.ephemeral && !args.init);
        assert!(args.issue_for.is_none());
        assert_eq!(args.power, 1);
    }

    #[test]
    fn test_issue_requires_joiner_key() {
        assert!(Args::try_parse_from(["pulsenet-node", "--issue-for", "joiner/config.json"]).is_err());
        let args = Args::try_parse_from([
            "pulsenet-node",
            "--issue-for",
            "joiner/config.json",
            "--joiner-key",
            "abcd",
            "--power",
            "4",
        ])
        .unwrap();
        assert_eq!(args.issue_for.as_deref(), Some("joiner/config.json"));
        assert_eq!(args.joiner_key.as_deref(), Some("abcd"));
        assert_eq!(args.power, 4);
    }

    #[test]
    fn test_overrides() {
        let args = Args::parse_from([
            "pulsenet-node",
            "--config",
            "node1/config.json",
            "--listen",
            "0.0.0.0:7000",
            "--ephemeral",
        ]);
        assert_eq!(args.config_path, "node1/config.json");
        assert_eq!(args.listen_addr.as_deref(), Some("0.0.0.0:7000"));
        assert!(args.ephemeral);
    }
}
