use anyhow::{bail, Context};
use std::net::SocketAddr;
use std::time::Duration;

use crate::cli::ServeArgs;
use crate::hub::HubConfig;
use crate::pairing::DEFAULT_CODE_EXPIRY;
use crate::registry::PairingMode;

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: SocketAddr,
    pub mode: PairingMode,
    pub pairing_code_ttl: Duration,
    pub sweep_interval: Duration,
    pub nack_unroutable: bool,
    pub shutdown_grace: Duration,
}

impl Config {
    pub fn hub_config(&self) -> HubConfig {
        HubConfig {
            mode: self.mode,
            code_expiry: self.pairing_code_ttl,
            sweep_interval: self.sweep_interval,
            nack_unroutable: self.nack_unroutable,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8090)),
            mode: PairingMode::CodePairing,
            pairing_code_ttl: DEFAULT_CODE_EXPIRY,
            sweep_interval: DEFAULT_CODE_EXPIRY,
            nack_unroutable: false,
            shutdown_grace: Duration::from_secs(2),
        }
    }
}

impl TryFrom<ServeArgs> for Config {
    type Error = anyhow::Error;

    fn try_from(args: ServeArgs) -> Result<Self, Self::Error> {
        let listen_addr: SocketAddr = args
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address: {}", args.listen_addr))?;
        Ok(Config {
            listen_addr,
            mode: args.mode,
            pairing_code_ttl: non_zero_secs("pairing-code-ttl-secs", args.pairing_code_ttl_secs)?,
            sweep_interval: non_zero_secs("sweep-interval-secs", args.sweep_interval_secs)?,
            nack_unroutable: args.nack_unroutable,
            shutdown_grace: Duration::from_secs(args.shutdown_grace_secs),
        })
    }
}

fn non_zero_secs(name: &str, secs: u64) -> anyhow::Result<Duration> {
    if secs == 0 {
        bail!("{name} must be greater than zero");
    }
    Ok(Duration::from_secs(secs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::Cli;
    use clap::Parser;

    fn parse(args: &[&str]) -> anyhow::Result<Config> {
        let mut argv = vec!["beach-pier"];
        argv.extend_from_slice(args);
        Config::try_from(Cli::try_parse_from(argv)?.serve)
    }

    #[test_timeout::timeout]
    fn defaults_match_cli_defaults() {
        let parsed = parse(&[]).unwrap();
        let defaults = Config::default();
        assert_eq!(parsed.listen_addr, defaults.listen_addr);
        assert_eq!(parsed.mode, defaults.mode);
        assert_eq!(parsed.pairing_code_ttl, defaults.pairing_code_ttl);
        assert_eq!(parsed.sweep_interval, defaults.sweep_interval);
        assert_eq!(parsed.shutdown_grace, defaults.shutdown_grace);
    }

    #[test_timeout::timeout]
    fn flags_flow_into_hub_config() {
        let config = parse(&[
            "--mode",
            "auto",
            "--pairing-code-ttl-secs",
            "60",
            "--nack-unroutable",
        ])
        .unwrap();
        let hub = config.hub_config();
        assert_eq!(hub.mode, PairingMode::AutoDiscovery);
        assert_eq!(hub.code_expiry, Duration::from_secs(60));
        assert!(hub.nack_unroutable);
    }

    #[test_timeout::timeout]
    fn rejects_bad_values() {
        let err = parse(&["--listen-addr", "nowhere"]).unwrap_err();
        assert!(err.to_string().contains("invalid listen address"));
        assert!(parse(&["--sweep-interval-secs", "0"]).is_err());
        assert!(parse(&["--pairing-code-ttl-secs", "0"]).is_err());
    }
}
