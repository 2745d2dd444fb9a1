//! MQTT subscriber on rumqttc.
//!
//! The first connection is awaited before `start` returns, so a wrong
//! host or bad credentials fail startup. After that, connection errors
//! are retried with backoff and subscriptions are renewed on every
//! `ConnAck`.

use common::{RetryOutcome, RetryPolicy, broker_url, watchdog};
use metrics::counter;
use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop,
    MqttOptions, Packet, QoS, Transport,
};
use teleforge_config::MqttSourceCfg;
use teleforge_core::InboundMessage;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{SourceError, SourceHandle, SourceResult};

const CLIENT_REQUEST_CAPACITY: usize = 64;

#[derive(Clone)]
pub struct MqttSource {
    cfg: MqttSourceCfg,
    pipeline: String,
}

impl MqttSource {
    pub fn new(cfg: MqttSourceCfg, pipeline: &str) -> Self {
        Self {
            cfg,
            pipeline: pipeline.to_string(),
        }
    }

    pub fn id(&self) -> &str {
        &self.cfg.id
    }

    /// Capacity for the channel between this source and the pipeline.
    pub fn channel_capacity(&self) -> usize {
        self.cfg.channel_capacity()
    }

    /// Client id from config, or one derived from the pipeline name.
    pub fn client_id(&self) -> String {
        self.cfg.client_id(&self.pipeline)
    }

    pub fn qos(&self) -> SourceResult<QoS> {
        qos_from(self.cfg.qos)
    }

    pub fn options(&self) -> MqttOptions {
        let mut opts =
            MqttOptions::new(self.client_id(), &self.cfg.host, self.cfg.port);
        opts.set_keep_alive(self.cfg.keep_alive());
        opts.set_clean_session(true);

        if let Some((user, pass)) = self.cfg.credentials() {
            opts.set_credentials(user, pass);
        }
        if self.cfg.tls {
            opts.set_transport(Transport::tls_with_default_config());
        }
        opts
    }

    /// Connect, subscribe and spawn the receive loop.
    ///
    /// Returns an error if the broker does not acknowledge the first
    /// connection within the connect timeout.
    pub async fn start(
        &self,
        tx: mpsc::Sender<InboundMessage>,
        cancel: CancellationToken,
    ) -> SourceResult<SourceHandle> {
        let qos = self.qos()?;
        let broker = broker_url(&self.cfg.host, self.cfg.port, self.cfg.tls);
        info!(
            source_id = %self.cfg.id,
            %broker,
            client_id = %self.client_id(),
            subscription = %self.cfg.subscription,
            authenticated = self.cfg.credentials().is_some(),
            "connecting to MQTT broker"
        );

        let (client, mut eventloop) =
            AsyncClient::new(self.options(), CLIENT_REQUEST_CAPACITY);

        watchdog(
            await_connack(&mut eventloop),
            self.cfg.connect_timeout(),
            &cancel,
            "mqtt_connect",
        )
        .await
        .map_err(|outcome| match outcome {
            RetryOutcome::Cancelled => SourceError::Cancelled,
            RetryOutcome::Timeout { action } => SourceError::Timeout { action },
            RetryOutcome::Failed(e) | RetryOutcome::Exhausted { last_error: e, .. } => e,
        })?;

        subscribe(&client, &self.cfg.subscription, qos)?;
        info!(source_id = %self.cfg.id, %broker, "connected to MQTT broker");

        let this = self.clone();
        let cancel_for_task = cancel.clone();
        let join = tokio::spawn(async move {
            let res = this
                .receive_loop(client, eventloop, qos, tx, cancel_for_task)
                .await;
            if let Err(e) = &res {
                error!(error = ?e, "mqtt source ended with error");
            }
            res
        });

        Ok(SourceHandle { cancel, join })
    }

    async fn receive_loop(
        &self,
        client: AsyncClient,
        mut eventloop: EventLoop,
        qos: QoS,
        tx: mpsc::Sender<InboundMessage>,
        cancel: CancellationToken,
    ) -> SourceResult<()> {
        let mut backoff = RetryPolicy::default();
        let mut subscription = Subscription::new(&self.cfg.subscription, qos);

        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                ev = eventloop.poll() => ev,
            };

            match event {
                Ok(Event::Incoming(Packet::Publish(p))) => {
                    let msg = InboundMessage::new(p.topic, p.payload);
                    counter!(
                        "teleforge_messages_received_total",
                        "pipeline" => self.pipeline.clone()
                    )
                    .increment(1);

                    let sent = tokio::select! {
                        _ = cancel.cancelled() => break,
                        r = tx.send(msg) => r,
                    };
                    if sent.is_err() {
                        debug!(source_id = %self.cfg.id, "receiver dropped, stopping");
                        break;
                    }
                }
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!(source_id = %self.cfg.id, "reconnected, renewing subscription");
                    backoff.reset();
                    subscription.renew(&client);
                }
                Ok(_) => {
                    if subscription.pending {
                        subscription.renew(&client);
                    }
                }
                Err(e) => {
                    let delay = backoff.next_backoff();
                    warn!(
                        source_id = %self.cfg.id,
                        error = %e,
                        retry_in_ms = delay.as_millis() as u64,
                        "mqtt connection error, will reconnect"
                    );
                    counter!(
                        "teleforge_source_reconnects_total",
                        "pipeline" => self.pipeline.clone()
                    )
                    .increment(1);

                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        if let Err(e) = client.try_disconnect() {
            debug!(source_id = %self.cfg.id, error = %e, "mqtt disconnect failed");
        }
        info!(source_id = %self.cfg.id, "mqtt source stopped");
        Ok(())
    }
}

/// Poll until the broker acknowledges the connection.
async fn await_connack(eventloop: &mut EventLoop) -> SourceResult<()> {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => return Ok(()),
            Ok(_) => {}
            Err(e) => return Err(connection_error(e)),
        }
    }
}

/// Subscription renewed after reconnects. A failed renewal is retried on
/// the next event instead of ending the receive loop.
struct Subscription<'a> {
    topic: &'a str,
    qos: QoS,
    pending: bool,
}

impl<'a> Subscription<'a> {
    fn new(topic: &'a str, qos: QoS) -> Self {
        Self {
            topic,
            qos,
            pending: false,
        }
    }

    fn renew(&mut self, client: &AsyncClient) -> bool {
        match subscribe(client, self.topic, self.qos) {
            Ok(()) => {
                self.pending = false;
                true
            }
            Err(e) => {
                warn!(topic = self.topic, error = %e, "subscription renewal failed, will retry");
                self.pending = true;
                false
            }
        }
    }
}

fn subscribe(client: &AsyncClient, topic: &str, qos: QoS) -> SourceResult<()> {
    client
        .try_subscribe(topic, qos)
        .map_err(|e| SourceError::Connect {
            details: format!("subscribe {topic}: {e}").into(),
        })
}

fn connection_error(e: ConnectionError) -> SourceError {
    match e {
        ConnectionError::ConnectionRefused(
            code @ (ConnectReturnCode::BadUserNamePassword
            | ConnectReturnCode::NotAuthorized),
        ) => SourceError::Auth {
            details: format!("broker refused connection: {code:?}").into(),
        },
        other => SourceError::Connect {
            details: other.to_string().into(),
        },
    }
}

pub(crate) fn qos_from(level: u8) -> SourceResult<QoS> {
    match level {
        0 => Ok(QoS::AtMostOnce),
        1 => Ok(QoS::AtLeastOnce),
        2 => Ok(QoS::ExactlyOnce),
        n => Err(SourceError::Incompatible {
            details: format!("unsupported qos {n}").into(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn cfg() -> MqttSourceCfg {
        MqttSourceCfg {
            id: "broker".into(),
            host: "127.0.0.1".into(),
            port: 1883,
            client_id: None,
            username: None,
            password: None,
            tls: false,
            subscription: "Sensoren/#".into(),
            qos: 1,
            keep_alive_secs: Some(20),
            connect_timeout_secs: Some(1),
            channel_capacity: None,
        }
    }

    #[test]
    fn qos_levels() {
        assert_eq!(qos_from(0).unwrap(), QoS::AtMostOnce);
        assert_eq!(qos_from(1).unwrap(), QoS::AtLeastOnce);
        assert_eq!(qos_from(2).unwrap(), QoS::ExactlyOnce);
        assert!(matches!(qos_from(3), Err(SourceError::Incompatible { .. })));
    }

    #[test]
    fn options_from_config() {
        let src = MqttSource::new(cfg(), "sensors");
        let opts = src.options();
        assert_eq!(opts.broker_address(), ("127.0.0.1".to_string(), 1883));
        assert_eq!(opts.keep_alive(), Duration::from_secs(20));
        assert_eq!(opts.client_id(), "teleforge-sensors-broker");
        assert_eq!(opts.credentials(), None);
        assert_eq!(src.channel_capacity(), 1024);
    }

    #[test]
    fn unset_timings_use_defaults() {
        let mut c = cfg();
        c.keep_alive_secs = None;
        c.connect_timeout_secs = None;
        c.client_id = Some("gw-1".into());
        let src = MqttSource::new(c.clone(), "sensors");
        assert_eq!(src.options().keep_alive(), Duration::from_secs(30));
        assert_eq!(src.options().client_id(), "gw-1");
        assert_eq!(c.connect_timeout(), Duration::from_secs(15));
    }

    #[test]
    fn credentials_only_when_both_present() {
        let mut c = cfg();
        c.username = Some("ingest".into());
        c.password = Some(String::new());
        assert_eq!(MqttSource::new(c.clone(), "p").options().credentials(), None);

        c.password = Some("pw".into());
        assert_eq!(
            MqttSource::new(c, "p").options().credentials(),
            Some(("ingest".to_string(), "pw".to_string()))
        );
    }

    #[test]
    fn failed_renewal_stays_pending() {
        let (client, eventloop) = AsyncClient::new(MqttSource::new(cfg(), "p").options(), 1);
        drop(eventloop);

        let mut sub = Subscription::new("Sensoren/#", QoS::AtLeastOnce);
        assert!(!sub.renew(&client));
        assert!(sub.pending);
        assert!(!sub.renew(&client));
        assert!(sub.pending);
    }

    #[test]
    fn refused_credentials_are_auth_errors() {
        let err = connection_error(ConnectionError::ConnectionRefused(
            ConnectReturnCode::NotAuthorized,
        ));
        assert!(matches!(err, SourceError::Auth { .. }));
    }

    #[tokio::test]
    async fn unreachable_broker_fails_start() {
        let mut c = cfg();
        c.port = 1;
        let src = MqttSource::new(c, "p");
        let (tx, _rx) = mpsc::channel(8);
        let res = src.start(tx, CancellationToken::new()).await;
        assert!(matches!(
            res,
            Err(SourceError::Connect { .. } | SourceError::Timeout { .. })
        ));
    }
}
