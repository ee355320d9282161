//! In-process stand-in for a NATS server. It speaks just enough of the
//! protocol for the client handshake, the JetStream account lookup and
//! publish acknowledgements.

use std::{sync::Arc, time::Duration};

use parking_lot::Mutex;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::TcpListener,
    sync::mpsc,
    task::JoinHandle,
};

const INFO: &str = concat!(
    r#"INFO {"server_id":"fake","server_name":"fake","version":"2.10.0","proto":1,"#,
    r#""headers":true,"max_payload":1048576}"#,
    "\r\n"
);

const ACCOUNT_INFO: &str = concat!(
    r#"{"memory":0,"storage":0,"streams":0,"consumers":0,"#,
    r#""limits":{"max_memory":-1,"max_storage":-1,"max_streams":-1,"max_consumers":-1,"#,
    r#""max_bytes_required":false,"max_ack_pending":-1,"memory_max_stream_bytes":-1,"#,
    r#""storage_max_stream_bytes":-1},"api":{"total":0,"errors":0}}"#
);

/// Everything the client sent that the tests care about.
#[derive(Debug, Default)]
pub struct Seen {
    /// Raw `CONNECT` lines.
    pub connects: Vec<String>,
    /// Subject of every `PUB`/`HPUB`.
    pub published: Vec<String>,
}

pub struct FakeBroker {
    pub url: String,
    pub seen: Arc<Mutex<Seen>>,
    session: JoinHandle<()>,
}

impl FakeBroker {
    /// Accept one client. Publishes outside `$JS.` are acknowledged after
    /// `ack_delay`.
    pub async fn start(ack_delay: Duration) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind broker");
        let url = format!("nats://{}", listener.local_addr().expect("broker addr"));
        let seen = Arc::new(Mutex::new(Seen::default()));
        let session = tokio::spawn(serve(listener, seen.clone(), ack_delay));
        Self { url, seen, session }
    }

    /// True if the client closed its socket within `within`.
    pub async fn client_hung_up(self, within: Duration) -> bool {
        tokio::time::timeout(within, self.session).await.is_ok()
    }
}

async fn serve(listener: TcpListener, seen: Arc<Mutex<Seen>>, ack_delay: Duration) {
    let Ok((socket, _)) = listener.accept().await else {
        return;
    };
    let (read, mut write) = socket.into_split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if write.write_all(frame.as_bytes()).await.is_err() {
                return;
            }
        }
    });
    let _ = tx.send(INFO.to_owned());

    let mut lines = BufReader::new(read).lines();
    let mut inbox_sid = String::from("0");
    let mut sequence = 0u64;
    // returns once the client hangs up
    while let Ok(Some(line)) = lines.next_line().await {
        let parts: Vec<&str> = line.split_whitespace().collect();
        match parts.as_slice() {
            ["CONNECT", ..] => seen.lock().connects.push(line.clone()),
            ["PING"] => {
                let _ = tx.send("PONG\r\n".to_owned());
            }
            ["SUB", _, sid] => inbox_sid = (*sid).to_owned(),
            [verb @ ("PUB" | "HPUB"), subject, rest @ ..] => {
                seen.lock().published.push((*subject).to_owned());
                // PUB <subject> <reply> <len> / HPUB <subject> <reply> <hlen> <len>
                let with_reply = if *verb == "PUB" { 2 } else { 3 };
                if rest.len() != with_reply {
                    continue;
                }
                let reply = rest[0];
                if *subject == "$JS.API.INFO" {
                    let _ = tx.send(msg(reply, &inbox_sid, ACCOUNT_INFO));
                } else if !subject.starts_with("$JS.") {
                    sequence += 1;
                    let ack = format!(r#"{{"stream":"S","seq":{sequence}}}"#);
                    let frame = msg(reply, &inbox_sid, &ack);
                    let tx = tx.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(ack_delay).await;
                        let _ = tx.send(frame);
                    });
                }
            }
            _ => {}
        }
    }
}

fn msg(subject: &str, sid: &str, payload: &str) -> String {
    format!("MSG {subject} {sid} {}\r\n{payload}\r\n", payload.len())
}
