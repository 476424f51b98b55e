//! Integration tests for SMTP delivery against a scripted local relay.
//!
//! 1. An accepted message arrives with its headers and Message-ID
//! 2. A refused connection is an SMTP error, not a panic or a hang

use dunning_core::{
    config::{AppConfig, MailConfig, MailTransportKind},
    error::DunningError,
    transport::transport_from_config,
};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;

/// Accepts one session and returns the DATA section it received.
async fn relay_once(listener: TcpListener) -> String {
    let (stream, _) = listener.accept().await.unwrap();
    let (read, mut write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();
    let _ = write.write_all(b"220 relay.test ESMTP\r\n").await;

    let mut data = String::new();
    let mut in_data = false;
    while let Ok(Some(line)) = lines.next_line().await {
        if in_data {
            if line == "." {
                in_data = false;
                let _ = write.write_all(b"250 2.0.0 Ok: queued\r\n").await;
            } else {
                data.push_str(&line);
                data.push('\n');
            }
            continue;
        }
        let verb = line.to_ascii_uppercase();
        let reply: &[u8] = if verb.starts_with("EHLO") {
            b"250-relay.test\r\n250 8BITMIME\r\n"
        } else if verb.starts_with("MAIL") || verb.starts_with("RCPT") || verb.starts_with("RSET") {
            b"250 2.1.0 Ok\r\n"
        } else if verb.starts_with("DATA") {
            in_data = true;
            b"354 End data with <CR><LF>.<CR><LF>\r\n"
        } else if verb.starts_with("QUIT") {
            let _ = write.write_all(b"221 2.0.0 Bye\r\n").await;
            break;
        } else {
            b"502 5.5.2 Command not recognized\r\n"
        };
        let _ = write.write_all(reply).await;
    }
    data
}

fn smtp_config(port: u16) -> MailConfig {
    let mut mail = AppConfig::default_test().mail;
    mail.transport = MailTransportKind::Smtp;
    mail.smtp_port = port;
    mail
}

#[tokio::test]
async fn relay_receives_the_message_with_its_id() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let relay = tokio::spawn(relay_once(listener));

    let transport = transport_from_config(&smtp_config(port)).unwrap();
    let receipt = transport
        .send("ap@acme.io", "Final notice: Acme", "<p>Pay now.</p>")
        .await
        .unwrap();
    assert!(receipt.message_id.ends_with("@test.example>"));

    let data = relay.await.unwrap();
    assert!(data.contains("Subject: Final notice: Acme"), "{data}");
    assert!(data.contains("To: ap@acme.io"), "{data}");
    assert!(data.contains("<ar@test.example>"), "{data}");
    assert!(data.contains(&receipt.message_id), "{data}");
    assert!(data.contains("Content-Type: text/html; charset=utf-8"), "{data}");
}

#[tokio::test]
async fn closed_relay_port_is_an_smtp_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let transport = transport_from_config(&smtp_config(port)).unwrap();
    let err = transport
        .send("ap@acme.io", "Final notice", "<p>Pay now.</p>")
        .await
        .unwrap_err();
    assert!(matches!(err, DunningError::Smtp(_)), "{err}");
}
