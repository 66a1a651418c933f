//! MQTT leaf transport backed by rumqttc.

use std::time::Duration;

use rumqttc::{
    AsyncClient, ConnectReturnCode, Event as MqttEvent, EventLoop, MqttOptions, Outgoing, Packet,
    QoS, TlsConfiguration, Transport,
};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, instrument, trace, warn};

use tether_util::json::{deserialize_duration_from_ms, serialize_duration_to_ms};

use crate::error::PipelineError;
use crate::event::Event;
use crate::model::{Certificate, MqttConnectionArgs};
use crate::operation::{OpKind, Operation};
use crate::pipeline::PipelineHandle;
use crate::stage::{Context, Stage};

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct MqttTransportConfig {
    pub port: u16,

    #[serde(
        deserialize_with = "deserialize_duration_from_ms",
        serialize_with = "serialize_duration_to_ms"
    )]
    pub keep_alive: Duration,

    /// Use TLS for the broker connection
    pub tls: bool,
}

impl Default for MqttTransportConfig {
    fn default() -> Self {
        Self {
            port: 8883,
            keep_alive: Duration::from_secs(60),
            tls: true,
        }
    }
}

struct Connection {
    client: AsyncClient,
    control: UnboundedSender<Operation>,
}

/// Leaf stage speaking MQTT to a broker
///
/// Connection arguments and credentials must be set before connecting.
/// Publish, subscribe and unsubscribe complete once the request has been
/// queued on the client. Incoming publishes are emitted as
/// [`Event::IncomingMqttMessage`], and a connection dropped by the broker
/// as [`Event::Disconnected`].
#[derive(Default)]
pub struct MqttTransport {
    config: MqttTransportConfig,
    args: Option<MqttConnectionArgs>,
    sas_token: Option<String>,
    certificate: Option<Certificate>,
    connection: Option<Connection>,
}

fn transport_error(err: impl std::fmt::Display) -> PipelineError {
    PipelineError::Transport(err.to_string())
}

impl MqttTransport {
    pub fn new(config: MqttTransportConfig) -> Self {
        Self {
            config,
            ..Default::default()
        }
    }

    fn options(&self) -> Result<MqttOptions, PipelineError> {
        let args = self
            .args
            .as_ref()
            .ok_or_else(|| transport_error("connection arguments were not set"))?;

        let mut options = MqttOptions::new(&args.client_id, &args.hostname, self.config.port);
        options.set_keep_alive(self.config.keep_alive);
        options.set_clean_session(false);
        options.set_credentials(
            &args.username,
            self.sas_token.clone().unwrap_or_default(),
        );

        if self.config.tls {
            let client_auth = self
                .certificate
                .as_ref()
                .map(|c| (c.certificate.clone().into_bytes(), c.private_key.clone().into_bytes()));

            let transport = match (&args.ca_cert, client_auth) {
                (Some(ca), client_auth) => Transport::Tls(TlsConfiguration::Simple {
                    ca: ca.clone().into_bytes(),
                    alpn: None,
                    client_auth,
                }),
                (None, None) => Transport::tls_with_default_config(),
                (None, Some(_)) => {
                    return Err(transport_error(
                        "a CA certificate is required for certificate authentication",
                    ));
                }
            };
            options.set_transport(transport);
        }

        Ok(options)
    }

    fn connect(&mut self, ctx: &mut Context<'_>, op: Operation) {
        let Some(handle) = ctx.handle() else {
            return ctx.complete(op, Err(PipelineError::Shutdown));
        };
        let options = match self.options() {
            Ok(options) => options,
            Err(err) => return ctx.complete(op, Err(err)),
        };

        let (client, eventloop) = AsyncClient::new(options, 64);
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        // a previous connection, if any, is dropped here
        self.connection = Some(Connection {
            client,
            control: control_tx,
        });
        tokio::spawn(drive(eventloop, op, control_rx, handle));
    }

    fn disconnect(&mut self, ctx: &mut Context<'_>, op: Operation) {
        let Some(connection) = self.connection.take() else {
            return ctx.complete(op, Ok(()));
        };
        if let Err(err) = connection.client.try_disconnect() {
            return ctx.complete(op, Err(transport_error(err)));
        }
        // the event loop completes the operation once the packet is out
        if let Err(mpsc::error::SendError(op)) = connection.control.send(op) {
            ctx.complete(op, Ok(()));
        }
    }

    fn client(&self) -> Result<&AsyncClient, PipelineError> {
        self.connection
            .as_ref()
            .map(|connection| &connection.client)
            .ok_or_else(|| transport_error("not connected"))
    }

    fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), PipelineError> {
        trace!(%topic, "publishing");
        self.client()?
            .try_publish(topic, QoS::AtLeastOnce, false, payload.to_vec())
            .map_err(transport_error)
    }

    fn subscribe(&self, topic: &str) -> Result<(), PipelineError> {
        debug!(%topic, "subscribing");
        self.client()?
            .try_subscribe(topic, QoS::AtLeastOnce)
            .map_err(transport_error)
    }

    fn unsubscribe(&self, topic: &str) -> Result<(), PipelineError> {
        debug!(%topic, "unsubscribing");
        self.client()?.try_unsubscribe(topic).map_err(transport_error)
    }
}

impl Stage for MqttTransport {
    fn name(&self) -> &'static str {
        "MqttTransport"
    }

    fn run_op(&mut self, ctx: &mut Context<'_>, op: Operation) {
        let result = match &op.kind {
            OpKind::SetMqttConnectionArgs(args) => {
                self.args = Some(args.clone());
                Ok(())
            }
            OpKind::SetSasToken { sas_token } => {
                self.sas_token = Some(sas_token.clone());
                Ok(())
            }
            OpKind::SetCertificate { certificate } => {
                self.certificate = Some(certificate.clone());
                Ok(())
            }
            OpKind::Connect => return self.connect(ctx, op),
            OpKind::Disconnect => return self.disconnect(ctx, op),
            OpKind::MqttPublish { topic, payload } => self.publish(topic, payload),
            OpKind::MqttSubscribe { topic } => self.subscribe(topic),
            OpKind::MqttUnsubscribe { topic } => self.unsubscribe(topic),
            _ => return ctx.send_op_down(op),
        };
        ctx.complete(op, result);
    }
}

/// Poll the rumqttc event loop until the connection ends
#[instrument(name = "mqtt", skip_all)]
async fn drive(
    mut eventloop: EventLoop,
    connect: Operation,
    mut control: UnboundedReceiver<Operation>,
    handle: PipelineHandle,
) {
    let mut connect = Some(connect);
    let mut disconnect: Option<Operation> = None;

    loop {
        tokio::select! {
            Some(op) = control.recv(), if disconnect.is_none() => {
                disconnect = Some(op);
            }
            event = eventloop.poll() => match event {
                Ok(MqttEvent::Incoming(Packet::ConnAck(ack))) => {
                    let Some(op) = connect.take() else {
                        continue;
                    };
                    if ack.code == ConnectReturnCode::Success {
                        handle.complete(op, Ok(()));
                    } else {
                        handle.complete(op, Err(transport_error(format!("connection refused: {:?}", ack.code))));
                        break;
                    }
                }
                Ok(MqttEvent::Incoming(Packet::Publish(publish))) => {
                    trace!(topic = %publish.topic, "message received");
                    handle.emit_event(Event::IncomingMqttMessage {
                        topic: publish.topic,
                        payload: publish.payload.to_vec(),
                    });
                }
                Ok(MqttEvent::Outgoing(Outgoing::Disconnect)) => {
                    if let Some(op) = disconnect.take() {
                        handle.complete(op, Ok(()));
                    }
                    break;
                }
                Ok(_) => {}
                Err(err) => {
                    if let Some(op) = connect.take() {
                        handle.complete(op, Err(transport_error(err)));
                    } else if let Some(op) = disconnect.take() {
                        handle.complete(op, Ok(()));
                    } else {
                        warn!("connection dropped: {err}");
                        handle.emit_event(Event::Disconnected);
                    }
                    break;
                }
            }
        }
    }
    debug!("event loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::pipeline::PipelineBuilder;

    fn args() -> MqttConnectionArgs {
        MqttConnectionArgs {
            client_id: "dev-1".into(),
            hostname: "127.0.0.1".into(),
            username: "hub/dev-1/?api-version=2018-06-30".into(),
            ca_cert: None,
        }
    }

    #[tokio::test]
    async fn test_connect_without_arguments_fails() {
        let pipeline = PipelineBuilder::new()
            .append_stage(MqttTransport::default())
            .spawn();

        let res = pipeline.submit(OpKind::Connect).await;
        assert!(matches!(res, Err(PipelineError::Transport(_))));
    }

    #[tokio::test]
    async fn test_publish_without_connection_fails() {
        let pipeline = PipelineBuilder::new()
            .append_stage(MqttTransport::default())
            .spawn();

        let res = pipeline
            .submit(OpKind::MqttPublish {
                topic: "devices/dev-1/messages/events/".into(),
                payload: b"hi".to_vec(),
            })
            .await;
        assert_eq!(res, Err(PipelineError::Transport("not connected".into())));
    }

    #[tokio::test]
    async fn test_disconnect_without_connection_succeeds() {
        let pipeline = PipelineBuilder::new()
            .append_stage(MqttTransport::default())
            .spawn();

        assert_eq!(pipeline.submit(OpKind::Disconnect).await, Ok(None));
    }

    #[tokio::test]
    async fn test_unreachable_broker_fails_connect() {
        // reserve a port and release it so nothing listens there
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let pipeline = PipelineBuilder::new()
            .append_stage(MqttTransport::new(MqttTransportConfig {
                port,
                tls: false,
                ..Default::default()
            }))
            .spawn();

        pipeline
            .submit(OpKind::SetMqttConnectionArgs(args()))
            .await
            .unwrap();
        pipeline
            .submit(OpKind::SetSasToken {
                sas_token: "SharedAccessSignature sr=x".into(),
            })
            .await
            .unwrap();

        let res = pipeline.submit(OpKind::Connect).await;
        assert!(matches!(res, Err(PipelineError::Transport(_))), "{res:?}");
    }

    #[test]
    fn test_certificate_auth_with_ca() {
        let transport = MqttTransport {
            args: Some(MqttConnectionArgs {
                ca_cert: Some("-----BEGIN CERTIFICATE-----".into()),
                ..args()
            }),
            certificate: Some(Certificate {
                certificate: "cert".into(),
                private_key: "key".into(),
            }),
            ..Default::default()
        };
        let options = transport.options().unwrap();
        assert!(matches!(options.transport(), Transport::Tls(_)));
    }

    #[test]
    fn test_certificate_auth_requires_ca() {
        let transport = MqttTransport {
            args: Some(args()),
            certificate: Some(Certificate {
                certificate: "cert".into(),
                private_key: "key".into(),
            }),
            ..Default::default()
        };
        assert!(matches!(
            transport.options(),
            Err(PipelineError::Transport(_))
        ));
    }
}
