// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

use log_shipper::config::ShipperConfig;
use log_shipper::record::Stream;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

pub const HOST: &str = "10.0.0.1";

/// Configuration with every startup and shutdown delay shortened.
pub fn test_config(brokers: Vec<String>, stream: Stream) -> ShipperConfig {
    ShipperConfig {
        stream,
        host: HOST.to_string(),
        task_id: "t1".to_string(),
        group_name: "g".to_string(),
        app_name: "a".to_string(),
        backend_enabled: !brokers.is_empty(),
        brokers,
        initial_delay: Duration::ZERO,
        drain_timeout: Duration::from_secs(1),
        linger: Duration::ZERO,
        retry_interval: Duration::from_millis(100),
        retry_max_interval: Duration::from_millis(400),
        request_timeout: Duration::from_secs(30),
        ..Default::default()
    }
}

pub fn compliant(severity: &str, message: &str) -> String {
    format!("*|1|{severity}|t1|p1|g|a|proc|corr|main.go:42|2024-01-01T00:00:00Z|{message}")
}

/// A broker that accepts connections and never answers.
///
/// Connections are held open until the returned token is cancelled.
pub async fn silent_broker() -> (String, CancellationToken) {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("failed to bind silent broker");
    let url = format!("http://{}", listener.local_addr().expect("no local addr"));
    let stop = CancellationToken::new();

    let token = stop.clone();
    tokio::spawn(async move {
        let mut held = Vec::new();
        loop {
            tokio::select! {
                () = token.cancelled() => break,
                accepted = listener.accept() => {
                    if let Ok((socket, _)) = accepted {
                        held.push(socket);
                    }
                }
            }
        }
    });

    (url, stop)
}
