//! MQTT transport adapter: one broker connection for the whole process,
//! fleet-wide subscriptions installed up front, inbound publishes fanned into
//! an in-process broadcast channel. Reconnects with full-jitter backoff and
//! re-subscribes on every ConnAck, so retained state/status replays after an
//! outage.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use fleet_core::bus::{Bus, Message, PublishOpts, QoS, topic_matches};
use fleet_core::error::{CoreError, ErrorKind};
use fleet_core::wire::SUBSCRIPTIONS;
use rand::Rng;
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions};
use tokio::sync::broadcast;
use tokio_stream::{Stream, StreamExt, wrappers::BroadcastStream};

const BACKOFF_MIN: Duration = Duration::from_secs(1);
const BACKOFF_MAX: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct MqttBus {
    client: AsyncClient,
    tx: Arc<broadcast::Sender<Message>>,
    connected: Arc<AtomicBool>,
}

impl MqttBus {
    pub async fn connect(host: &str, port: u16, client_id: &str) -> Result<Self> {
        let mut opts = MqttOptions::new(client_id, host, port);
        opts.set_keep_alive(Duration::from_secs(5));
        opts.set_clean_session(false);

        let (client, mut eventloop) = AsyncClient::new(opts, 100);

        let (tx, _rx) = broadcast::channel(1024);
        let tx = Arc::new(tx);
        let forwarder_tx = Arc::clone(&tx);
        let connected = Arc::new(AtomicBool::new(false));
        let connected_flag = Arc::clone(&connected);
        let subscriber = client.clone();

        tokio::spawn(async move {
            let mut backoff = BACKOFF_MIN;
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                        connected_flag.store(true, Ordering::Relaxed);
                        backoff = BACKOFF_MIN;
                        for pattern in SUBSCRIPTIONS {
                            if let Err(e) =
                                subscriber.subscribe(*pattern, rumqttc::QoS::AtLeastOnce).await
                            {
                                tracing::error!("subscribe {pattern} failed: {e}");
                            }
                        }
                    }
                    Ok(Event::Incoming(Incoming::Publish(p))) => {
                        let _ = forwarder_tx.send(Message {
                            topic: p.topic,
                            payload: Bytes::from(p.payload.to_vec()),
                        });
                    }
                    Ok(_) => {}
                    Err(e) => {
                        connected_flag.store(false, Ordering::Relaxed);
                        let wait = full_jitter(backoff);
                        tracing::warn!("mqtt event loop error: {e}, reconnecting in {wait:?}");
                        tokio::time::sleep(wait).await;
                        backoff = (backoff * 2).min(BACKOFF_MAX);
                    }
                }
            }
        });

        Ok(Self { client, tx, connected })
    }
}

fn full_jitter(cap: Duration) -> Duration {
    rand::thread_rng().gen_range(Duration::ZERO..=cap)
}

fn to_rumqttc_qos(qos: QoS) -> rumqttc::QoS {
    match qos {
        QoS::AtMostOnce => rumqttc::QoS::AtMostOnce,
        QoS::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
    }
}

#[async_trait]
impl Bus for MqttBus {
    async fn publish(&self, topic: &str, payload: Bytes, opts: PublishOpts) -> Result<()> {
        // non-blocking submit: a full request queue surfaces as backpressure
        // instead of stalling the caller
        match self.client.try_publish(topic, to_rumqttc_qos(opts.qos), opts.retain, payload) {
            Ok(()) => Ok(()),
            Err(rumqttc::ClientError::TryRequest(_)) => {
                Err(CoreError::new(ErrorKind::ServiceBusy, "mqtt publish queue is full").into())
            }
            Err(e) => Err(e).context("publish mqtt message"),
        }
    }

    async fn subscribe(
        &self,
        pattern: &str,
    ) -> Result<Box<dyn Stream<Item = Message> + Unpin + Send>> {
        let rx = self.tx.subscribe();
        let pattern = pattern.to_string();
        let stream = BroadcastStream::new(rx).filter_map(move |item| match item {
            Ok(msg) if topic_matches(&pattern, &msg.topic) => Some(msg),
            _ => None,
        });
        Ok(Box::new(stream))
    }

    fn healthy(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        io::ErrorKind,
        net::TcpListener,
        process::{Child, Command, Stdio},
    };
    use tokio::time::{Duration, sleep};

    struct MosquittoGuard(Child);

    impl Drop for MosquittoGuard {
        fn drop(&mut self) {
            let _ = self.0.kill();
        }
    }

    async fn start_broker() -> Result<(MosquittoGuard, u16)> {
        let listener = TcpListener::bind("127.0.0.1:0")?;
        let port = listener.local_addr()?.port();
        drop(listener);

        let child = Command::new("mosquitto")
            .args(["-p", &port.to_string(), "-v"])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .context("spawn mosquitto")?;

        let guard = MosquittoGuard(child); // ensures kill on drop
        let mut attempts = 0;
        loop {
            match tokio::net::TcpStream::connect(("127.0.0.1", port)).await {
                Ok(_) => break,
                Err(_) if attempts < 20 => {
                    attempts += 1;
                    sleep(Duration::from_millis(50)).await;
                }
                Err(e) => return Err(e.into()),
            }
        }

        Ok((guard, port))
    }

    #[tokio::test]
    async fn publishes_and_receives_fleet_topics() -> Result<()> {
        let (_guard, port) = match start_broker().await {
            Ok(ok) => ok,
            Err(e)
                if e.downcast_ref::<std::io::Error>().map(|io| io.kind())
                    == Some(ErrorKind::NotFound) =>
            {
                eprintln!("skipping publishes_and_receives_fleet_topics: mosquitto not installed");
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        let bus = MqttBus::connect("127.0.0.1", port, "test-client").await?;

        let mut stream = bus.subscribe("home/+/device/+/ack").await?;
        // give the ConnAck handler a beat to install subscriptions
        sleep(Duration::from_millis(200)).await;
        bus.publish(
            "home/1/device/d1/ack",
            Bytes::from_static(br#"{"cmdId":"C1","ok":true,"ts":1}"#),
            PublishOpts::command(),
        )
        .await?;

        let msg = stream.next().await.expect("message expected");
        assert_eq!(msg.topic, "home/1/device/d1/ack");
        Ok(())
    }

    #[tokio::test]
    async fn wildcards_filter_between_channels() -> Result<()> {
        let (_guard, port) = match start_broker().await {
            Ok(ok) => ok,
            Err(e)
                if e.downcast_ref::<std::io::Error>().map(|io| io.kind())
                    == Some(ErrorKind::NotFound) =>
            {
                eprintln!("skipping wildcards_filter_between_channels: mosquitto not installed");
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        let bus = MqttBus::connect("127.0.0.1", port, "test-filter").await?;

        let mut stream = bus.subscribe("home/hub/+/status").await?;
        sleep(Duration::from_millis(200)).await;
        bus.publish(
            "home/1/device/d1/state",
            Bytes::from_static(b"{}"),
            PublishOpts::retained(),
        )
        .await?;
        bus.publish(
            "home/hub/h1/status",
            Bytes::from_static(br#"{"ts":1,"online":true}"#),
            PublishOpts::retained(),
        )
        .await?;

        let msg = stream.next().await.expect("filtered message");
        assert_eq!(msg.topic, "home/hub/h1/status");
        Ok(())
    }
}
