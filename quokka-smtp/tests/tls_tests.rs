mod common;

use common::{TestCert, TestClient, plain_response, spawn_server, tls_handshake};
use pretty_assertions::assert_eq;
use quokka_smtp::{InMemoryQueue, Metrics, Server, ServerConfig, StaticCredentials};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;

const DOMAIN: &str = "mail.test.local";

fn tls_server(config: ServerConfig) -> Server {
    let users = StaticCredentials::new().with_user("alice", "secret").unwrap();
    Server::new(config)
        .with_tls(TestCert::generate().acceptor())
        .with_authenticator(Arc::new(users))
        .with_metrics(Arc::new(Metrics::new().unwrap()))
}

#[tokio::test]
async fn starttls_upgrades_and_resets_session() {
    let queue = Arc::new(InMemoryQueue::new());
    let server = tls_server(ServerConfig::submission(DOMAIN)).with_queue(queue.clone());
    let (addr, _) = spawn_server(&server).await;

    let mut client = TestClient::connect(addr).await;
    assert_eq!(client.read_reply().await.0, 220);

    let (_, lines) = client.command("EHLO client").await;
    assert!(lines.contains(&"STARTTLS".to_string()));
    assert!(!lines.contains(&"AUTH PLAIN".to_string()));

    let (code, lines) = client.command("STARTTLS").await;
    assert_eq!(code, 220);
    assert_eq!(lines, vec!["2.0.0 Ready to start TLS"]);

    let mut client = tls_handshake(client.into_inner()).await;

    let (code, lines) = client.command("EHLO client").await;
    assert_eq!(code, 250);
    assert!(lines.contains(&"AUTH PLAIN".to_string()));
    assert!(!lines.contains(&"STARTTLS".to_string()));

    assert_eq!(client.command("STARTTLS").await.0, 503);

    let (code, _) = client
        .command(&format!("AUTH PLAIN {}", plain_response("alice", "secret")))
        .await;
    assert_eq!(code, 235);

    client.command("MAIL FROM:<alice@test.local>").await;
    client.command("RCPT TO:<bob@example.org>").await;
    assert_eq!(client.command("DATA").await.0, 354);
    client.send("over tls").await;
    assert_eq!(client.command(".").await.0, 250);
    assert_eq!(client.command("QUIT").await.0, 221);

    let messages = queue.drain().await;
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].authenticated_as.as_deref(), Some("alice"));
    assert_eq!(server.metrics().unwrap().tls_handshakes_total.get(), 1);
}

#[tokio::test]
async fn transaction_before_starttls_is_discarded() {
    let server = tls_server(ServerConfig::relay(DOMAIN));
    let (addr, _) = spawn_server(&server).await;

    let mut client = TestClient::connect(addr).await;
    client.read_reply().await;
    assert_eq!(client.command("MAIL FROM:<a@example.org>").await.0, 250);
    assert_eq!(client.command("STARTTLS").await.0, 220);

    let mut client = tls_handshake(client.into_inner()).await;
    assert_eq!(client.command("RCPT TO:<b@example.org>").await.0, 503);
}

#[tokio::test]
async fn implicit_tls_greets_after_handshake() {
    let server = tls_server(ServerConfig::submissions(DOMAIN));
    let (addr, _) = spawn_server(&server).await;

    let tcp = TcpStream::connect(addr).await.unwrap();
    let mut client = tls_handshake(tcp).await;

    let (code, lines) = client.read_reply().await;
    assert_eq!(code, 220);
    assert_eq!(lines, vec![format!("{DOMAIN} ESMTP service ready")]);

    let (_, lines) = client.command("EHLO client").await;
    assert!(lines.contains(&"AUTH PLAIN".to_string()));
    assert!(!lines.contains(&"STARTTLS".to_string()));

    assert_eq!(client.command("MAIL FROM:<a@example.org>").await.0, 530);
    let (code, _) = client
        .command(&format!("AUTH PLAIN {}", plain_response("alice", "secret")))
        .await;
    assert_eq!(code, 235);
    assert_eq!(client.command("MAIL FROM:<a@example.org>").await.0, 250);
}

#[tokio::test]
async fn failed_implicit_tls_handshake_closes_connection() {
    let server = tls_server(ServerConfig::submissions(DOMAIN));
    let (addr, _) = spawn_server(&server).await;

    let mut client = TestClient::connect(addr).await;
    client.send("EHLO plaintext-client").await;
    assert!(client.is_closed().await);

    let mut ok = tls_handshake(TcpStream::connect(addr).await.unwrap()).await;
    assert_eq!(ok.read_reply().await.0, 220);
}

#[tokio::test]
async fn close_aborts_a_stalled_tls_handshake() {
    let server = tls_server(ServerConfig::submissions(DOMAIN))
        .with_shutdown_grace(Duration::from_millis(300));
    let (addr, handle) = spawn_server(&server).await;

    // Connected, but the client never sends a ClientHello.
    let mut client = TestClient::connect(addr).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    server.close();

    let result = tokio::time::timeout(Duration::from_secs(4), handle)
        .await
        .expect("serve did not return after close")
        .unwrap();
    assert!(result.is_ok());
    assert!(client.is_closed().await);
    assert_eq!(server.metrics().unwrap().sessions_active.get(), 0);
}
