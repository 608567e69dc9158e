// src/rabbitmq/monitor.rs
// Periodic health check that re-dials the broker after a dropped connection

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info};

use super::connection::ConnectionSupervisor;
use super::errors::RabbitMQError;

pub const DEFAULT_HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(10);

/// Handle on the running health-check task
pub struct HealthMonitor {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl HealthMonitor {
    pub fn spawn(supervisor: Arc<ConnectionSupervisor>, uri: String, period: Duration) -> Self {
        let (stop, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(run(supervisor, uri, period, stop_rx));
        info!(interval_ms = period.as_millis() as u64, "Health monitor started");
        Self { stop, handle }
    }

    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }

    /// Signal the loop and wait for it to exit
    pub async fn stop(self) {
        let _ = self.stop.send(true);
        if let Err(e) = self.handle.await {
            error!(error = %e, "Health monitor task failed");
        }
        info!("Health monitor stopped");
    }
}

async fn run(
    supervisor: Arc<ConnectionSupervisor>,
    uri: String,
    period: Duration,
    mut stop: watch::Receiver<bool>,
) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // the first tick completes immediately
    ticker.tick().await;

    let mut active = supervisor.is_healthy();

    loop {
        tokio::select! {
            biased;
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    break;
                }
                continue;
            }
            _ = ticker.tick() => {}
        }

        if supervisor.is_healthy() {
            if !active {
                info!("RabbitMQ connection is active");
                active = true;
            }
            continue;
        }

        // edge-triggered: one record per lost connection
        if active {
            error!("RabbitMQ connection is closed");
            active = false;
        }

        supervisor.mark_failed().await;
        match supervisor.connect(&uri).await {
            Ok(()) => {
                info!(generation = supervisor.generation(), "Reconnected to RabbitMQ successfully");
                active = true;
            }
            Err(RabbitMQError::ShuttingDown) => break,
            Err(e) => debug!(error = %e, "Reconnect attempt failed"),
        }
    }

    debug!("Health monitor loop exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rabbitmq::memory::InMemoryBroker;
    use crate::rabbitmq::transport::ChannelConfig;
    use std::sync::Mutex;
    use tracing::field::{Field, Visit};
    use tracing::{Event, Subscriber};
    use tracing_subscriber::layer::{Context, Layer, SubscriberExt};

    const URI: &str = "amqp://memory";

    /// Collects the message of every event
    #[derive(Clone, Default)]
    struct Messages(Arc<Mutex<Vec<String>>>);

    impl Messages {
        fn count(&self, message: &str) -> usize {
            self.0.lock().unwrap().iter().filter(|m| *m == message).count()
        }
    }

    struct MessageVisitor<'a>(&'a mut Option<String>);

    impl Visit for MessageVisitor<'_> {
        fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
            if field.name() == "message" {
                *self.0 = Some(format!("{:?}", value));
            }
        }
    }

    impl<S: Subscriber> Layer<S> for Messages {
        fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
            let mut message = None;
            event.record(&mut MessageVisitor(&mut message));
            if let Some(message) = message {
                self.0.lock().unwrap().push(message);
            }
        }
    }

    fn supervisor(broker: &InMemoryBroker) -> Arc<ConnectionSupervisor> {
        Arc::new(ConnectionSupervisor::new(
            Arc::new(broker.clone()),
            ChannelConfig::default(),
        ))
    }

    fn spawn(supervisor: &Arc<ConnectionSupervisor>) -> HealthMonitor {
        HealthMonitor::spawn(supervisor.clone(), URI.to_string(), Duration::from_secs(10))
    }

    #[tokio::test(start_paused = true)]
    async fn reconnects_after_the_connection_drops() {
        let broker = InMemoryBroker::new();
        let supervisor = supervisor(&broker);
        supervisor.connect(URI).await.unwrap();
        let first = supervisor.generation().unwrap();

        let monitor = spawn(&supervisor);
        broker.sever_connections();
        assert!(!supervisor.is_healthy());

        tokio::time::sleep(Duration::from_secs(11)).await;

        assert!(supervisor.is_healthy());
        assert!(supervisor.generation().unwrap() > first);
        assert_eq!(broker.open_connections(), 1);
        monitor.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn keeps_retrying_while_the_broker_is_down() {
        let broker = InMemoryBroker::new();
        let supervisor = supervisor(&broker);
        supervisor.connect(URI).await.unwrap();

        let monitor = spawn(&supervisor);
        broker.set_reachable(false);
        broker.sever_connections();

        tokio::time::sleep(Duration::from_secs(35)).await;
        assert!(!supervisor.is_healthy());
        assert!(supervisor.lease().is_err());

        broker.set_reachable(true);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(supervisor.is_healthy());

        monitor.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn logs_each_edge_once() {
        let messages = Messages::default();
        let _guard = tracing::subscriber::set_default(
            tracing_subscriber::registry().with(messages.clone()),
        );

        let broker = InMemoryBroker::new();
        let supervisor = supervisor(&broker);
        supervisor.connect(URI).await.unwrap();

        let monitor = spawn(&supervisor);
        // let the loop see a healthy connection first
        tokio::time::sleep(Duration::from_secs(1)).await;
        broker.set_reachable(false);
        broker.sever_connections();

        // three failed ticks
        tokio::time::sleep(Duration::from_secs(34)).await;
        assert_eq!(messages.count("RabbitMQ connection is closed"), 1);
        assert_eq!(messages.count("Reconnect attempt failed"), 3);
        assert_eq!(messages.count("Reconnected to RabbitMQ successfully"), 0);

        broker.set_reachable(true);
        tokio::time::sleep(Duration::from_secs(30)).await;
        monitor.stop().await;

        assert_eq!(messages.count("RabbitMQ connection is closed"), 1);
        assert_eq!(messages.count("Reconnected to RabbitMQ successfully"), 1);
        assert_eq!(messages.count("RabbitMQ connection is active"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn connects_when_started_disconnected() {
        let broker = InMemoryBroker::new();
        let supervisor = supervisor(&broker);

        let monitor = spawn(&supervisor);
        tokio::time::sleep(Duration::from_secs(11)).await;

        assert!(supervisor.is_healthy());
        monitor.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn stop_ends_the_loop() {
        let broker = InMemoryBroker::new();
        let supervisor = supervisor(&broker);
        supervisor.connect(URI).await.unwrap();

        let monitor = spawn(&supervisor);
        assert!(monitor.is_running());
        monitor.stop().await;

        broker.sever_connections();
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(!supervisor.is_healthy());
    }
}
