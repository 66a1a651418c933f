use clap::{Args, Parser, Subcommand};
use std::num::ParseIntError;
use std::path::PathBuf;
use std::time::Duration;

fn parse_duration(s: &str) -> Result<Duration, ParseIntError> {
    let millis: u64 = s.parse()?;
    Ok(Duration::from_millis(millis))
}

fn parse_json(s: &str) -> Result<serde_json::Value, serde_json::Error> {
    serde_json::from_str(s)
}

#[derive(Clone, Debug, Parser)]
#[command(version, about, long_about = None)] // read from Cargo.toml
pub struct Cli {
    /// Directory holding the stored registration
    #[arg(env = "TETHER_CONFIG_DIR", long = "config-dir", value_name = "path", global = true)]
    pub config_dir: Option<PathBuf>,

    /// Path to a PEM encoded CA certificate to trust
    #[arg(env = "TETHER_CA_FILE", long = "ca-file", value_name = "path", global = true)]
    pub ca_file: Option<PathBuf>,

    /// Response timeout in milliseconds
    #[arg(
        env = "TETHER_RESPONSE_TIMEOUT_MS",
        long = "response-timeout-ms",
        value_name = "ms",
        value_parser = parse_duration,
        global = true
    )]
    pub response_timeout: Option<Duration>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Clone, Debug, Subcommand)]
pub enum Command {
    /// Register this device with the provisioning service
    Register(RegisterArgs),

    /// Send one telemetry message to the hub
    Send(SendArgs),
}

#[derive(Clone, Debug, Args)]
pub struct Credentials {
    /// Shared access signature to authenticate with
    #[arg(
        env = "TETHER_SAS_TOKEN",
        long = "sas-token",
        value_name = "token",
        hide_env_values = true,
        required_unless_present = "cert_file",
        conflicts_with = "cert_file"
    )]
    pub sas_token: Option<String>,

    /// Path to a PEM encoded client certificate
    #[arg(
        env = "TETHER_CERT_FILE",
        long = "cert-file",
        value_name = "path",
        requires = "key_file"
    )]
    pub cert_file: Option<PathBuf>,

    /// Path to the PEM encoded private key of the client certificate
    #[arg(
        env = "TETHER_KEY_FILE",
        long = "key-file",
        value_name = "path",
        requires = "cert_file"
    )]
    pub key_file: Option<PathBuf>,
}

#[derive(Clone, Debug, Args)]
pub struct RegisterArgs {
    /// Provisioning service endpoint, eg. "global.azure-devices-provisioning.net"
    #[arg(
        env = "TETHER_PROVISIONING_HOST",
        long = "provisioning-host",
        value_name = "host"
    )]
    pub provisioning_host: String,

    /// Scope of the enrollment this device belongs to
    #[arg(env = "TETHER_ID_SCOPE", long = "id-scope", value_name = "scope")]
    pub id_scope: String,

    /// Registration id of this device
    #[arg(
        env = "TETHER_REGISTRATION_ID",
        long = "registration-id",
        value_name = "id"
    )]
    pub registration_id: String,

    #[command(flatten)]
    pub credentials: Credentials,

    /// JSON payload handed to the allocation policy
    #[arg(
        env = "TETHER_REGISTRATION_PAYLOAD",
        long = "payload",
        value_name = "json",
        value_parser = parse_json
    )]
    pub payload: Option<serde_json::Value>,

    /// Poll interval in milliseconds when the service does not ask for one
    #[arg(
        env = "TETHER_POLL_INTERVAL_MS",
        long = "poll-interval-ms",
        value_name = "ms",
        value_parser = parse_duration
    )]
    pub poll_interval: Option<Duration>,

    /// Shortest interval between two requests in milliseconds
    #[arg(
        env = "TETHER_POLL_MIN_INTERVAL_MS",
        long = "poll-min-interval-ms",
        value_name = "ms",
        value_parser = parse_duration
    )]
    pub poll_min_interval: Option<Duration>,

    /// Register again even if a registration is stored
    #[arg(long = "force")]
    pub force: bool,
}

#[derive(Clone, Debug, Args)]
pub struct SendArgs {
    /// Hub hostname, eg. "my-hub.azure-devices.net"
    #[arg(env = "TETHER_HOSTNAME", long = "hostname", value_name = "host")]
    pub hostname: Option<String>,

    /// Device id, defaults to the stored registration
    #[arg(env = "TETHER_DEVICE_ID", long = "device-id", value_name = "id")]
    pub device_id: Option<String>,

    /// Module id when sending as a module
    #[arg(env = "TETHER_MODULE_ID", long = "module-id", value_name = "id")]
    pub module_id: Option<String>,

    /// Edge gateway to connect through
    #[arg(
        env = "TETHER_GATEWAY_HOSTNAME",
        long = "gateway-hostname",
        value_name = "host"
    )]
    pub gateway_hostname: Option<String>,

    #[command(flatten)]
    pub credentials: Credentials,

    /// Message content type, eg. "application/json"
    #[arg(long = "content-type", value_name = "mime")]
    pub content_type: Option<String>,

    /// Message body
    pub message: String,
}

pub fn parse() -> Cli {
    Parser::parse()
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_register_arguments() {
        let cli = Cli::try_parse_from([
            "tether",
            "register",
            "--provisioning-host",
            "global.azure-devices-provisioning.net",
            "--id-scope",
            "0ne000A0D5F",
            "--registration-id",
            "dev-1",
            "--sas-token",
            "sig",
            "--payload",
            r#"{"model":"v2"}"#,
            "--poll-interval-ms",
            "1500",
        ])
        .unwrap();

        let Command::Register(args) = cli.command else {
            panic!("expected register command");
        };
        assert_eq!(args.registration_id, "dev-1");
        assert_eq!(args.credentials.sas_token.as_deref(), Some("sig"));
        assert_eq!(args.payload, Some(serde_json::json!({"model": "v2"})));
        assert_eq!(args.poll_interval, Some(Duration::from_millis(1500)));
        assert!(!args.force);
    }

    #[test]
    fn test_certificate_requires_key() {
        let res = Cli::try_parse_from([
            "tether",
            "register",
            "--provisioning-host",
            "h",
            "--id-scope",
            "s",
            "--registration-id",
            "r",
            "--cert-file",
            "device.pem",
        ]);
        assert!(res.is_err());
    }

    #[test]
    fn test_credential_is_required() {
        let res = Cli::try_parse_from(["tether", "send", "--hostname", "hub", "hello"]);
        assert!(res.is_err());
    }
}
