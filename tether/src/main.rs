use anyhow::{Context, Result, anyhow, bail};
use tracing::{debug, info, instrument, warn};
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

mod cli;

use tether_hub::{HubClient, HubConfig};
use tether_pipeline::{AuthProvider, Certificate, Credential, Message, SecurityClient};
use tether_provisioning::{
    ProvisioningClient, ProvisioningConfig, RegistrationRecord, RegistrationResult,
};
use tether_util::config;
use tether_util::dirs::config_dir;
use tether_util::store::Store;

use crate::cli::{Cli, Command, Credentials, RegisterArgs, SendArgs};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing subscriber for human-readable logs
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env().unwrap_or(
                EnvFilter::default()
                    .add_directive("debug".parse()?)
                    .add_directive("rumqttc=warn".parse()?)
                    .add_directive("hyper=error".parse()?)
                    .add_directive("reqwest=info".parse()?),
            ),
        )
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_span_events(FmtSpan::CLOSE)
                .event_format(fmt::format().compact().with_target(false).without_time()),
        )
        .init();

    let cli = cli::parse();
    let config_store = Store::new(cli.config_dir.clone().unwrap_or_else(config_dir));
    let ca_cert = match &cli.ca_file {
        Some(path) => Some(
            tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("failed to read {}", path.display()))?,
        ),
        None => None,
    };

    match &cli.command {
        Command::Register(args) => {
            let record = maybe_register(&cli, args, ca_cert, &config_store).await?;
            println!("{}", serde_json::to_string_pretty(&record.result)?);
        }
        Command::Send(args) => send(&cli, args, ca_cert, &config_store).await?,
    }

    Ok(())
}

async fn read_credential(credentials: &Credentials) -> Result<Credential> {
    match (&credentials.sas_token, &credentials.cert_file, &credentials.key_file) {
        (Some(sas_token), _, _) => Ok(Credential::SasToken(sas_token.clone())),
        (None, Some(cert_file), Some(key_file)) => Ok(Credential::X509(Certificate {
            certificate: tokio::fs::read_to_string(cert_file)
                .await
                .with_context(|| format!("failed to read {}", cert_file.display()))?,
            private_key: tokio::fs::read_to_string(key_file)
                .await
                .with_context(|| format!("failed to read {}", key_file.display()))?,
        })),
        _ => bail!("either a SAS token or a certificate and key are required"),
    }
}

fn is_same_identity(record: &RegistrationRecord, args: &RegisterArgs) -> bool {
    record.provisioning_host == args.provisioning_host
        && record.id_scope == args.id_scope
        && record.registration_id == args.registration_id
}

/// Stored registration for this identity, if it can be reused. A record
/// that cannot be reused is removed from the store
async fn stored_registration(
    args: &RegisterArgs,
    config_store: &Store,
) -> Result<Option<RegistrationRecord>> {
    let stored: Option<RegistrationRecord> = config::load(config_store).await?;

    match stored {
        Some(record) if !args.force && is_same_identity(&record, args) => Ok(Some(record)),
        Some(record) => {
            warn!(
                "removing existing registration {0} at {1}",
                record.registration_id, record.provisioning_host
            );
            config::remove::<RegistrationRecord>(config_store).await?;
            Ok(None)
        }
        None => Ok(None),
    }
}

/// Reuse the stored registration for this identity, or register and store
/// the outcome
#[instrument(skip_all, err)]
async fn maybe_register(
    cli: &Cli,
    args: &RegisterArgs,
    ca_cert: Option<String>,
    config_store: &Store,
) -> Result<RegistrationRecord> {
    if let Some(record) = stored_registration(args, config_store).await? {
        info!(registration_id = %record.registration_id, "using stored registration");
        return Ok(record);
    }

    let mut config = ProvisioningConfig::default();
    if let Some(interval) = args.poll_interval {
        config.polling.default_poll_interval = interval;
    }
    if let Some(interval) = args.poll_min_interval {
        config.polling.min_poll_interval = interval;
    }
    if let Some(timeout) = cli.response_timeout {
        config.correlation.response_timeout = timeout;
    }
    let security_client = SecurityClient {
        provisioning_host: args.provisioning_host.clone(),
        registration_id: args.registration_id.clone(),
        id_scope: args.id_scope.clone(),
        ca_cert,
        credential: read_credential(&args.credentials).await?,
    };

    let client = ProvisioningClient::create(security_client, config).await?;
    let result = tokio::select! {
        result = client.register(args.payload.clone()) => result?,
        _ = tokio::signal::ctrl_c() => {
            warn!("interrupted, cancelling registration");
            client.cancel().await?;
            bail!("registration cancelled");
        }
    };

    let record = RegistrationRecord {
        provisioning_host: args.provisioning_host.clone(),
        id_scope: args.id_scope.clone(),
        registration_id: args.registration_id.clone(),
        result,
    };
    config::save(config_store, &record).await?;
    info!(status = ?record.result.status, "registration stored");

    Ok(record)
}

/// Hub hostname and device id assigned by a stored registration
fn assigned_identity(result: &RegistrationResult) -> (Option<String>, Option<String>) {
    match &result.registration_state {
        Some(state) => (state.assigned_hub.clone(), state.device_id.clone()),
        None => (None, None),
    }
}

#[instrument(skip_all, err)]
async fn send(
    cli: &Cli,
    args: &SendArgs,
    ca_cert: Option<String>,
    config_store: &Store,
) -> Result<()> {
    let stored: Option<RegistrationRecord> = config::load(config_store).await?;
    let (stored_hub, stored_device) = stored
        .as_ref()
        .map(|record| assigned_identity(&record.result))
        .unwrap_or_default();

    let hostname = args
        .hostname
        .clone()
        .or(stored_hub)
        .ok_or_else(|| anyhow!("no hub hostname given and no registration stored"))?;
    let device_id = args
        .device_id
        .clone()
        .or(stored_device)
        .ok_or_else(|| anyhow!("no device id given and no registration stored"))?;

    let auth_provider = AuthProvider {
        device_id,
        module_id: args.module_id.clone(),
        hostname,
        gateway_hostname: args.gateway_hostname.clone(),
        ca_cert,
        credential: read_credential(&args.credentials).await?,
    };

    let mut config = HubConfig::default();
    if let Some(timeout) = cli.response_timeout {
        config.correlation.response_timeout = timeout;
    }

    let client = HubClient::builder(config)
        .on_disconnected(|| debug!("hub connection closed"))
        .create(auth_provider)
        .await?;

    let mut message = Message::new(args.message.clone());
    message.content_type = args.content_type.clone();
    client.send_telemetry(message).await?;
    info!("message sent");

    client.disconnect().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use clap::Parser;
    use std::path::Path;
    use tempfile::tempdir;
    use tether_provisioning::RegistrationStatus;

    fn record() -> RegistrationRecord {
        RegistrationRecord {
            provisioning_host: "global.azure-devices-provisioning.net".into(),
            id_scope: "0ne000A0D5F".into(),
            registration_id: "dev-1".into(),
            result: RegistrationResult {
                operation_id: "op1".into(),
                status: RegistrationStatus::Assigned,
                registration_state: None,
            },
        }
    }

    fn register_cli(config_dir: &Path, force: bool) -> (Cli, RegisterArgs) {
        let mut argv = vec![
            "tether".to_string(),
            "--config-dir".into(),
            config_dir.display().to_string(),
            "register".into(),
            "--provisioning-host".into(),
            "global.azure-devices-provisioning.net".into(),
            "--id-scope".into(),
            "0ne000A0D5F".into(),
            "--registration-id".into(),
            "dev-1".into(),
            "--sas-token".into(),
            "sig".into(),
        ];
        if force {
            argv.push("--force".into());
        }
        let cli = Cli::try_parse_from(argv).unwrap();
        let Command::Register(args) = cli.command.clone() else {
            unreachable!()
        };
        (cli, args)
    }

    #[tokio::test]
    async fn test_stored_registration_is_reused() {
        let dir = tempdir().unwrap();
        let store = Store::new(dir.path());
        config::save(&store, &record()).await.unwrap();

        let (cli, args) = register_cli(dir.path(), false);
        let reused = maybe_register(&cli, &args, None, &store).await.unwrap();
        assert_eq!(reused, record());
    }

    #[tokio::test]
    async fn test_force_removes_stored_registration() {
        let dir = tempdir().unwrap();
        let store = Store::new(dir.path());
        config::save(&store, &record()).await.unwrap();

        let (_, args) = register_cli(dir.path(), true);
        assert_eq!(stored_registration(&args, &store).await.unwrap(), None);

        let stored: Option<RegistrationRecord> = config::load(&store).await.unwrap();
        assert_eq!(stored, None);
    }

    #[tokio::test]
    async fn test_other_identity_is_not_reused() {
        let dir = tempdir().unwrap();
        let store = Store::new(dir.path());
        config::save(&store, &record()).await.unwrap();

        let (_, mut args) = register_cli(dir.path(), false);
        args.id_scope = "0ne000B0000".into();
        assert_eq!(stored_registration(&args, &store).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_missing_certificate_file_names_the_path() {
        let dir = tempdir().unwrap();
        let credentials = Credentials {
            sas_token: None,
            cert_file: Some(dir.path().join("missing.pem")),
            key_file: Some(dir.path().join("missing.key")),
        };
        let err = read_credential(&credentials).await.unwrap_err();
        assert!(err.to_string().contains("missing.pem"));
    }

    #[test]
    fn test_identity_comparison() {
        let dir = tempdir().unwrap();
        let (_, mut args) = register_cli(dir.path(), false);
        assert!(is_same_identity(&record(), &args));

        args.registration_id = "dev-2".into();
        assert!(!is_same_identity(&record(), &args));
    }

    #[tokio::test]
    async fn test_sas_token_takes_precedence() {
        let credentials = Credentials {
            sas_token: Some("sig".into()),
            cert_file: None,
            key_file: None,
        };
        assert_eq!(
            read_credential(&credentials).await.unwrap(),
            Credential::SasToken("sig".into())
        );
    }

    #[tokio::test]
    async fn test_certificate_is_read_from_files() {
        let dir = tempdir().unwrap();
        let cert_file = dir.path().join("device.pem");
        let key_file = dir.path().join("device.key");
        tokio::fs::write(&cert_file, "CERT").await.unwrap();
        tokio::fs::write(&key_file, "KEY").await.unwrap();

        let credentials = Credentials {
            sas_token: None,
            cert_file: Some(cert_file),
            key_file: Some(key_file),
        };
        assert_eq!(
            read_credential(&credentials).await.unwrap(),
            Credential::X509(Certificate {
                certificate: "CERT".into(),
                private_key: "KEY".into(),
            })
        );
    }
}
