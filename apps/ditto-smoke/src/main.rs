mod logging;

use std::{process, time::Duration};

use ditto_core::{
    Channel, ClientError, Envelope, Inbound, Selector, Signal, protocol::JWT_TOKEN_PREFIX,
};
use ditto_session::{
    DittoSession, Executors, MemoryConnection, MemoryTransport, Response, SessionConfig,
};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

const THING_TOPIC: &str = "org.acme/lamp/things/twin";

#[tokio::main]
async fn main() {
    logging::init();

    let config = match SessionConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "invalid configuration");
            process::exit(1);
        }
    };

    if let Err(err) = run(config).await {
        error!(error = %err, "smoke run failed");
        process::exit(1);
    }
}

async fn run(config: SessionConfig) -> Result<(), ClientError> {
    let (transport, mut peer) = MemoryTransport::for_config(&config);
    tokio::spawn(async move {
        while let Some(connection) = peer.accept().await {
            tokio::spawn(loopback(connection));
        }
    });

    let session = DittoSession::connect(config, transport, Executors::current()).await?;
    info!(session = %session.session_id(), "connected to loopback backend");

    session.start_consumption(Channel::Twin, &[]).await?;

    let (changes_tx, mut changes_rx) = mpsc::unbounded_channel();
    session.register(
        "lamp-attributes",
        Selector::parse("/things/{thingId}/attributes"),
        move |envelope: Envelope| {
            let _ = changes_tx.send(envelope);
        },
    )?;

    let modify = Signal::new(format!("{THING_TOPIC}/commands/modify"), "/attributes/on")
        .with_value(json!(true))
        .with_requested_acks(["twin-persisted"]);
    match session.send(modify).await? {
        Response::Acknowledged(acks) => info!(?acks, "modify acknowledged"),
        Response::Reply(envelope) => info!(status = ?envelope.status, "modify answered"),
    }

    match tokio::time::timeout(Duration::from_secs(5), changes_rx.recv()).await {
        Ok(Some(change)) => info!(path = %change.path, value = ?change.value, "change received"),
        _ => warn!("no change notification arrived"),
    }

    let retrieve = Signal::new(format!("{THING_TOPIC}/commands/retrieve"), "/");
    if let Response::Reply(envelope) = session.send(retrieve).await? {
        info!(value = ?envelope.value, "thing retrieved");
    }

    session.stop_consumption(Channel::Twin).await?;
    session.close();
    info!("smoke run complete");
    Ok(())
}

/// Minimal backend: acknowledges control commands, answers commands and
/// echoes modifications back as events.
async fn loopback(mut connection: MemoryConnection) {
    while let Some(frame) = connection.recv().await {
        for reply in loopback_replies(&frame) {
            if connection.send(reply).await.is_err() {
                return;
            }
        }
    }
}

fn loopback_replies(frame: &str) -> Vec<String> {
    let envelope = match Inbound::parse(frame) {
        Ok(Inbound::Envelope(envelope)) => envelope,
        Ok(Inbound::Control(command)) if command.starts_with(JWT_TOKEN_PREFIX) => {
            return Vec::new();
        }
        Ok(Inbound::Control(command)) => {
            let command = command.split('?').next().unwrap_or_default();
            return vec![format!("{command}:ACK")];
        }
        Err(err) => {
            warn!(error = %err, "loopback dropped a frame");
            return Vec::new();
        }
    };

    let correlation_id = envelope.correlation_id().unwrap_or_default().to_owned();
    let base = envelope
        .topic
        .rsplitn(3, '/')
        .nth(2)
        .unwrap_or(THING_TOPIC)
        .to_owned();
    let mut replies = Vec::new();

    if envelope.topic.ends_with("/modify") {
        let event = Envelope::new(format!("{base}/events/modified"), envelope.path.clone())
            .with_value(envelope.value.clone().unwrap_or(Value::Null));
        replies.push(event);
    }

    let requested = envelope.requested_acks();
    if requested.is_empty() {
        replies.push(
            Envelope::new(envelope.topic.clone(), envelope.path.clone())
                .with_correlation_id(correlation_id)
                .with_status(200)
                .with_value(json!({"thingId": "org.acme:lamp", "attributes": {"on": true}})),
        );
    } else {
        for label in requested {
            replies.push(
                Envelope::new(format!("{base}/acks/{label}"), "/")
                    .with_correlation_id(correlation_id.clone())
                    .with_status(204),
            );
        }
    }

    replies
        .into_iter()
        .filter_map(|reply| reply.to_json().ok())
        .collect()
}
