//! End-to-end scenarios: real listeners on ephemeral ports, a mock
//! upstream, and a mock collector.

mod helpers;

use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;

use palisade_core::config::{ListenProtocol, OperationMode};
use palisade_core::rules::{RuleAction, RuleScope};

use helpers::{
    start_agent, substring_rule, wait_until, HttpUpstream, MockCollector, TcpUpstream, WsBackend,
};

const WAIT: Duration = Duration::from_secs(5);

fn ua_rule() -> Vec<palisade_core::rules::Rule> {
    vec![substring_rule(
        "r-ua",
        Some(RuleAction::Drop),
        &[RuleScope::HttpRequest],
        "User-Agent: evil",
    )]
}

// ---------------------------------------------------------------------------
// S1 - HTTP allow
// ---------------------------------------------------------------------------

#[tokio::test]
async fn http_allowed_request_reaches_the_upstream() {
    let collector = MockCollector::spawn().await;
    let upstream = HttpUpstream::spawn().await;
    let agent = start_agent(
        ListenProtocol::Http,
        &upstream.url,
        ua_rule(),
        OperationMode::Waf,
        &collector.url,
    )
    .await;

    let response = reqwest::Client::new()
        .get(agent.http_url("/x"))
        .header("User-Agent", "good")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    assert_eq!(response.headers().get("x-upstream").unwrap(), "yes");
    assert_eq!(response.text().await.unwrap(), "upstream says hi");

    let requests = upstream.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].method, "GET");
    assert_eq!(requests[0].path_and_query, "/x");
    assert_eq!(requests[0].user_agent, "good");

    assert!(wait_until(|| collector.record_count() == 1, WAIT).await);
    let record = &collector.records()[0];
    assert_eq!(record["type"], "http");
    assert_eq!(record["verdict"], "allow");
    assert_eq!(record["agentId"], helpers::AGENT_UUID);
    assert_eq!(record["requestFindings"].as_array().unwrap().len(), 0);
    assert_eq!(record["responseFindings"].as_array().unwrap().len(), 0);
    // The shipped request dump decodes back to the canonical form.
    let dump = BASE64.decode(record["request"].as_str().unwrap()).unwrap();
    let dump = String::from_utf8(dump).unwrap();
    assert!(dump.starts_with("GET /x HTTP/1.1\n"));
}

// ---------------------------------------------------------------------------
// S2 - HTTP drop on request
// ---------------------------------------------------------------------------

#[tokio::test]
async fn http_dropped_request_never_reaches_the_upstream() {
    let collector = MockCollector::spawn().await;
    let upstream = HttpUpstream::spawn().await;
    let agent = start_agent(
        ListenProtocol::Http,
        &upstream.url,
        ua_rule(),
        OperationMode::Waf,
        &collector.url,
    )
    .await;

    let response = reqwest::Client::new()
        .get(agent.http_url("/x"))
        .header("User-Agent", "evil")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 403);
    assert_eq!(
        response.headers().get("content-type").unwrap(),
        "text/html"
    );
    let body = response.text().await.unwrap();
    assert!(body.contains("Forbidden"));

    assert!(upstream.requests().is_empty());

    assert!(wait_until(|| collector.record_count() == 1, WAIT).await);
    let record = &collector.records()[0];
    assert_eq!(record["verdict"], "drop");
    let findings = record["requestFindings"].as_array().unwrap();
    assert_eq!(findings.len(), 1);
    assert_eq!(findings[0]["ruleId"], "r-ua");
    // The logged response is the raw forbidden message.
    let logged = BASE64.decode(record["response"].as_str().unwrap()).unwrap();
    assert!(String::from_utf8_lossy(&logged).starts_with("HTTP/1.1 403 Forbidden"));
}

#[tokio::test]
async fn http_forward_preserves_path_query_and_body() {
    let collector = MockCollector::spawn().await;
    let upstream = HttpUpstream::spawn().await;
    let agent = start_agent(
        ListenProtocol::Http,
        &upstream.url,
        Vec::new(),
        OperationMode::Waf,
        &collector.url,
    )
    .await;

    let response = reqwest::Client::new()
        .post(agent.http_url("/api/items?page=2&sort=asc"))
        .body("payload-bytes")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let requests = upstream.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].method, "POST");
    assert_eq!(requests[0].path_and_query, "/api/items?page=2&sort=asc");
    assert_eq!(requests[0].body, b"payload-bytes");
}

// ---------------------------------------------------------------------------
// S3 - TCP per-chunk sequencing
// ---------------------------------------------------------------------------

#[tokio::test]
async fn tcp_chunks_get_gapless_stream_indexes() {
    let collector = MockCollector::spawn().await;
    let upstream = TcpUpstream::spawn(vec![b'R'; 50]).await;
    let agent = start_agent(
        ListenProtocol::Tcp,
        &format!("tcp://{}", upstream.addr),
        Vec::new(),
        OperationMode::Waf,
        &collector.url,
    )
    .await;

    let mut client = TcpStream::connect(agent.addr()).await.unwrap();
    client.write_all(&[b'A'; 100]).await.unwrap();

    // Read the interleaved 50-byte reply before sending the second chunk.
    let mut reply = vec![0u8; 50];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply, vec![b'R'; 50]);

    client.write_all(&[b'B'; 100]).await.unwrap();

    assert!(wait_until(|| collector.record_count() == 3, WAIT).await);
    let records = collector.records();

    let uuids: Vec<&str> = records
        .iter()
        .map(|r| r["streamUUID"].as_str().unwrap())
        .collect();
    assert_eq!(uuids[0], uuids[1]);
    assert_eq!(uuids[1], uuids[2]);

    let indexes: Vec<i64> = records
        .iter()
        .map(|r| r["streamIndex"].as_i64().unwrap())
        .collect();
    assert_eq!(indexes, vec![0, 1, 2]);

    let directions: Vec<&str> = records
        .iter()
        .map(|r| r["direction"].as_str().unwrap())
        .collect();
    assert_eq!(directions, vec!["ingress", "egress", "ingress"]);

    for record in &records {
        assert_eq!(record["type"], "tcp");
        assert_eq!(record["verdict"], "allow");
    }
    assert_eq!(
        BASE64.decode(records[0]["request"].as_str().unwrap()).unwrap(),
        vec![b'A'; 100]
    );
    assert_eq!(
        BASE64.decode(records[1]["response"].as_str().unwrap()).unwrap(),
        vec![b'R'; 50]
    );

    let chunks = upstream.chunks();
    assert_eq!(chunks.len(), 2);
    assert_eq!(chunks[0], vec![b'A'; 100]);
    assert_eq!(chunks[1], vec![b'B'; 100]);
}

#[tokio::test]
async fn tcp_dropped_chunk_is_replaced_by_the_forbidden_message() {
    let collector = MockCollector::spawn().await;
    let upstream = TcpUpstream::spawn(Vec::new()).await;
    let rules = vec![substring_rule(
        "r-tcp",
        Some(RuleAction::Drop),
        &[RuleScope::TcpIngress],
        "attack",
    )];
    let agent = start_agent(
        ListenProtocol::Tcp,
        &format!("tcp://{}", upstream.addr),
        rules,
        OperationMode::Waf,
        &collector.url,
    )
    .await;

    let mut client = TcpStream::connect(agent.addr()).await.unwrap();
    client.write_all(b"attack payload").await.unwrap();

    // The client gets the forbidden bytes instead.
    let mut notice = vec![0u8; "Forbidden\n".len()];
    client.read_exact(&mut notice).await.unwrap();
    assert_eq!(notice, b"Forbidden\n");

    // The connection survives; a clean chunk still goes through.
    client.write_all(b"hello").await.unwrap();
    assert!(
        wait_until(
            || upstream.chunks().first().map(|c| c.as_slice() == b"hello").unwrap_or(false),
            WAIT
        )
        .await,
        "clean chunk should still be forwarded"
    );
    assert_eq!(upstream.chunks().len(), 1);

    assert!(wait_until(|| collector.record_count() == 2, WAIT).await);
    let records = collector.records();
    assert_eq!(records[0]["verdict"], "drop");
    assert_eq!(records[0]["streamIndex"], 0);
    assert_eq!(records[1]["verdict"], "allow");
    assert_eq!(records[1]["streamIndex"], 1);
}

// ---------------------------------------------------------------------------
// S4 - WebSocket drop keeps the session open
// ---------------------------------------------------------------------------

#[tokio::test]
async fn websocket_dropped_frame_gets_a_forbidden_notice() {
    let collector = MockCollector::spawn().await;
    let backend = WsBackend::spawn().await;
    let rules = vec![substring_rule(
        "r-ws",
        Some(RuleAction::Drop),
        &[RuleScope::WsMessage],
        "BAD",
    )];
    let agent = start_agent(
        ListenProtocol::Http,
        &backend.url,
        rules,
        OperationMode::Waf,
        &collector.url,
    )
    .await;

    let (mut socket, _) = tokio_tungstenite::connect_async(agent.ws_url())
        .await
        .expect("websocket upgrade through the agent");

    socket.send(Message::Text("ok".into())).await.unwrap();
    socket.send(Message::Text("BAD".into())).await.unwrap();

    // The middle frame comes back as a forbidden notice.
    let notice = socket.next().await.unwrap().unwrap();
    let notice = notice.into_text().unwrap();
    let notice: serde_json::Value = serde_json::from_str(notice.as_str()).unwrap();
    assert_eq!(notice["message"], "Forbidden\n");

    // The session stays open: a third frame still reaches the backend.
    socket.send(Message::Text("ok".into())).await.unwrap();
    assert!(wait_until(|| backend.received().len() == 2, WAIT).await);
    assert_eq!(backend.received(), vec!["ok".to_string(), "ok".to_string()]);

    assert!(wait_until(|| collector.record_count() == 3, WAIT).await);
    let records = collector.records();
    let verdicts: Vec<&str> = records
        .iter()
        .map(|r| r["verdict"].as_str().unwrap())
        .collect();
    assert_eq!(verdicts, vec!["allow", "drop", "allow"]);
    for record in &records {
        assert_eq!(record["type"], "websocket");
    }
    assert_eq!(
        BASE64.decode(records[1]["request"].as_str().unwrap()).unwrap(),
        b"BAD"
    );
}

// ---------------------------------------------------------------------------
// S5 - Testing mode observes without blocking
// ---------------------------------------------------------------------------

#[tokio::test]
async fn testing_mode_logs_the_drop_but_forwards_anyway() {
    let collector = MockCollector::spawn().await;
    let upstream = HttpUpstream::spawn().await;
    let agent = start_agent(
        ListenProtocol::Http,
        &upstream.url,
        ua_rule(),
        OperationMode::Testing,
        &collector.url,
    )
    .await;

    let response = reqwest::Client::new()
        .get(agent.http_url("/x"))
        .header("User-Agent", "evil")
        .send()
        .await
        .unwrap();

    // No blocking: the client sees the upstream response.
    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), "upstream says hi");
    assert_eq!(upstream.requests().len(), 1);

    assert!(wait_until(|| collector.record_count() == 1, WAIT).await);
    let record = &collector.records()[0];
    assert_eq!(record["verdict"], "drop");
    assert_eq!(record["requestFindings"][0]["ruleId"], "r-ua");
}

// ---------------------------------------------------------------------------
// S6 - Collector outage never touches the data path
// ---------------------------------------------------------------------------

#[tokio::test]
async fn collector_outage_changes_no_traffic_outcome() {
    // Nothing listens here: every log POST fails with connection refused.
    let dead_collector = format!("http://127.0.0.1:{}", helpers::free_port());
    let upstream = HttpUpstream::spawn().await;
    let agent = start_agent(
        ListenProtocol::Http,
        &upstream.url,
        ua_rule(),
        OperationMode::Waf,
        &dead_collector,
    )
    .await;

    let client = reqwest::Client::new();

    let allowed = client
        .get(agent.http_url("/x"))
        .header("User-Agent", "good")
        .send()
        .await
        .unwrap();
    assert_eq!(allowed.status(), 200);
    assert_eq!(allowed.text().await.unwrap(), "upstream says hi");

    let blocked = client
        .get(agent.http_url("/x"))
        .header("User-Agent", "evil")
        .send()
        .await
        .unwrap();
    assert_eq!(blocked.status(), 403);

    assert_eq!(upstream.requests().len(), 1);
}

// ---------------------------------------------------------------------------
// HTTP response inspection
// ---------------------------------------------------------------------------

#[tokio::test]
async fn http_dropped_response_is_replaced_by_the_forbidden_page() {
    let collector = MockCollector::spawn().await;
    let upstream = HttpUpstream::spawn().await;
    let rules = vec![substring_rule(
        "r-resp",
        Some(RuleAction::Drop),
        &[RuleScope::HttpResponse],
        "upstream says hi",
    )];
    let agent = start_agent(
        ListenProtocol::Http,
        &upstream.url,
        rules,
        OperationMode::Waf,
        &collector.url,
    )
    .await;

    let response = reqwest::Client::new()
        .get(agent.http_url("/x"))
        .send()
        .await
        .unwrap();

    // The upstream was reached, but its body never leaves the agent.
    assert_eq!(response.status(), 403);
    let body = response.text().await.unwrap();
    assert!(body.contains("Forbidden"));
    assert!(!body.contains("upstream says hi"));
    assert_eq!(upstream.requests().len(), 1);

    assert!(wait_until(|| collector.record_count() == 1, WAIT).await);
    let record = &collector.records()[0];
    assert_eq!(record["verdict"], "drop");
    assert_eq!(record["responseFindings"][0]["ruleId"], "r-resp");
}
