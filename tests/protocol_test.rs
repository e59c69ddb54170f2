// tests/protocol_test.rs — IrcClient against an in-process fake relay

use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;

use streamcap::infra::config::{IrcConfig, IrcCredentials};
use streamcap::protocol::{ChatTransport, ConnectionState, IrcClient};

const WAIT: Duration = Duration::from_secs(5);

struct FakeRelay {
    reader: BufReader<tokio::net::tcp::OwnedReadHalf>,
    writer: tokio::net::tcp::OwnedWriteHalf,
}

impl FakeRelay {
    async fn accept(listener: TcpListener) -> Self {
        let (socket, _) = timeout(WAIT, listener.accept()).await.unwrap().unwrap();
        let (read_half, writer) = socket.into_split();
        Self {
            reader: BufReader::new(read_half),
            writer,
        }
    }

    async fn read_line(&mut self) -> String {
        let mut line = String::new();
        timeout(WAIT, self.reader.read_line(&mut line))
            .await
            .unwrap()
            .unwrap();
        line.trim_end().to_string()
    }

    async fn send(&mut self, line: &str) {
        self.writer.write_all(line.as_bytes()).await.unwrap();
        self.writer.write_all(b"\r\n").await.unwrap();
        self.writer.flush().await.unwrap();
    }
}

fn test_creds() -> IrcCredentials {
    IrcCredentials {
        nick: "capturebot".to_string(),
        oauth: "oauth:secret".to_string(),
    }
}

fn config_for(port: u16) -> IrcConfig {
    IrcConfig {
        server: "127.0.0.1".to_string(),
        port,
        use_tls: false,
        join_delay_s: 0.0,
    }
}

async fn connect_pair() -> (IrcClient, FakeRelay, mpsc::Receiver<streamcap::protocol::ChatEvent>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let (tx, rx) = mpsc::channel(64);
    let accept = tokio::spawn(FakeRelay::accept(listener));
    let client = IrcClient::connect(&config_for(port), &test_creds(), tx)
        .await
        .unwrap();
    let mut relay = accept.await.unwrap();

    // Auth handshake arrives in order before anything else.
    assert_eq!(relay.read_line().await, "PASS oauth:secret");
    assert_eq!(relay.read_line().await, "NICK capturebot");
    assert_eq!(
        relay.read_line().await,
        "CAP REQ :twitch.tv/tags twitch.tv/commands twitch.tv/membership"
    );

    (client, relay, rx)
}

#[tokio::test]
async fn ping_is_answered_with_matching_pong() {
    let (client, mut relay, _rx) = connect_pair().await;
    assert_eq!(client.state(), ConnectionState::Connected);

    relay.send("PING :tmi.twitch.tv").await;
    assert_eq!(relay.read_line().await, "PONG :tmi.twitch.tv");

    client.close().await;
}

#[tokio::test]
async fn privmsg_is_delivered_as_chat_event() {
    let (client, mut relay, mut rx) = connect_pair().await;

    relay
        .send("@mod=1;badges=subscriber/12 :alice!alice@alice.tmi.twitch.tv PRIVMSG #Chan :hi there")
        .await;

    let event = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(event.channel, "chan");
    assert_eq!(event.user, "alice");
    assert_eq!(event.message, "hi there");
    assert_eq!(event.tags.get("mod").map(String::as_str), Some("1"));

    client.close().await;
}

#[tokio::test]
async fn non_privmsg_lines_are_ignored() {
    let (client, mut relay, mut rx) = connect_pair().await;

    relay.send(":tmi.twitch.tv 001 capturebot :Welcome").await;
    relay.send(":alice!alice@host JOIN #chan").await;
    relay
        .send(":bob!bob@bob.tmi.twitch.tv PRIVMSG #chan :real one")
        .await;

    // Only the PRIVMSG comes through.
    let event = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(event.user, "bob");

    client.close().await;
}

#[tokio::test]
async fn join_and_part_are_idempotent() {
    let (client, mut relay, _rx) = connect_pair().await;

    client.join("#Chan").await.unwrap();
    client.join("chan").await.unwrap(); // already joined, no-op
    client.part("chan").await.unwrap();
    client.part("chan").await.unwrap(); // already parted, no-op
    client.join("chan").await.unwrap(); // re-join after part is real

    assert_eq!(relay.read_line().await, "JOIN #chan");
    assert_eq!(relay.read_line().await, "PART #chan");
    assert_eq!(relay.read_line().await, "JOIN #chan");

    client.close().await;
}

#[tokio::test]
async fn close_sends_quit_and_is_safe_twice() {
    let (client, mut relay, _rx) = connect_pair().await;

    client.close().await;
    assert_eq!(relay.read_line().await, "QUIT");
    assert_eq!(client.state(), ConnectionState::Disconnected);

    // Safe to call again after the connection is gone.
    client.close().await;

    // Operations after close fail without panicking.
    assert!(client.join("chan").await.is_err());
}

#[tokio::test]
async fn server_eof_marks_client_disconnected() {
    let (client, relay, mut rx) = connect_pair().await;

    drop(relay);

    // Reader sees EOF and drops its event sender side effectlessly; the
    // channel yields None once the connection is done.
    assert!(timeout(WAIT, rx.recv()).await.unwrap().is_none());

    // State settles to Disconnected.
    let mut state = client.state();
    for _ in 0..50 {
        if state == ConnectionState::Disconnected {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        state = client.state();
    }
    assert_eq!(state, ConnectionState::Disconnected);
}
