use clap::Parser;

use std::path::PathBuf;

use netconnd_lib::{config, logging};

use crate::device_info;

pub const ENV_VAR_RESOLV_CONF: &str = "NETCONND_RESOLV_CONF";

/// netconnd - per-interface routing, policy rule and DNS daemon
#[derive(Clone, Debug, Parser)]
#[command(version)]
pub struct Cli {
    /// Interface configuration file
    #[arg(
        short,
        long,
        env = config::ENV_VAR,
        default_value = config::DEFAULT_PATH,
        )]
    pub config_path: PathBuf,

    /// Write logs to this file instead of stdout (reopened on SIGHUP)
    #[arg(long, env = logging::ENV_VAR_LOG_FILE, default_value = None)]
    pub log_file: Option<PathBuf>,

    /// Resolver file to write, overrides `resolv_conf` of the configuration file
    #[arg(long, env = ENV_VAR_RESOLV_CONF, default_value = None)]
    pub resolv_conf: Option<PathBuf>,

    /// Mount point of procfs, used for reverse path filter settings
    #[arg(long, default_value = device_info::DEFAULT_PROC_ROOT, hide = true)]
    pub proc_root: PathBuf,
}

pub fn parse() -> Cli {
    Cli::parse()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_cli_with_explicit_paths() -> anyhow::Result<()> {
        let args = Cli::try_parse_from([
            "netconnd",
            "--config-path",
            "/tmp/netconnd.toml",
            "--log-file",
            "/tmp/netconnd.log",
            "--resolv-conf",
            "/tmp/resolv.conf",
        ])?;
        assert_eq!(args.config_path, PathBuf::from("/tmp/netconnd.toml"));
        assert_eq!(args.log_file, Some(PathBuf::from("/tmp/netconnd.log")));
        assert_eq!(args.resolv_conf, Some(PathBuf::from("/tmp/resolv.conf")));
        assert_eq!(args.proc_root, PathBuf::from(device_info::DEFAULT_PROC_ROOT));
        Ok(())
    }

    #[test]
    fn short_config_flag() -> anyhow::Result<()> {
        let args = Cli::try_parse_from(["netconnd", "-c", "/tmp/other.toml"])?;
        assert_eq!(args.config_path, PathBuf::from("/tmp/other.toml"));
        Ok(())
    }

    #[test]
    fn rejects_unknown_arguments() {
        assert!(Cli::try_parse_from(["netconnd", "--socket-path", "/tmp/x"]).is_err());
    }
}
