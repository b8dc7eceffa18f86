//! End-to-end tests against a running server with the in-memory backend

use splitcache::server::connection::MAX_LINE_LEN;
use splitcache::{MemoryStore, PoolConfig, StorePool, TcpServer};
use std::net::SocketAddr;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

async fn start_server() -> SocketAddr {
    let pool = StorePool::new(MemoryStore::new(), PoolConfig::default());
    let server = TcpServer::bind("127.0.0.1:0", pool).await.unwrap();
    let addr = server.local_addr().unwrap();
    tokio::spawn(server.run(std::future::pending()));
    addr
}

struct Client {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl Client {
    async fn connect(addr: SocketAddr) -> Self {
        let (reader, writer) = TcpStream::connect(addr).await.unwrap().into_split();
        Client {
            reader: BufReader::new(reader),
            writer,
        }
    }

    async fn send(&mut self, line: &str) {
        self.writer.write_all(line.as_bytes()).await.unwrap();
        self.writer.write_all(b"\r\n").await.unwrap();
    }

    /// Returns `None` once the server has closed the connection.
    async fn line(&mut self) -> Option<String> {
        let mut buf = String::new();
        if self.reader.read_line(&mut buf).await.unwrap() == 0 {
            return None;
        }
        Some(buf.trim_end_matches(['\r', '\n']).to_string())
    }

    /// Read lines up to and including `END`.
    async fn until_end(&mut self) -> Vec<String> {
        let mut lines = Vec::new();
        loop {
            let line = self.line().await.expect("connection closed before END");
            let done = line == "END";
            lines.push(line);
            if done {
                return lines;
            }
        }
    }

    async fn add(&mut self, payload: &str) -> String {
        self.send(&format!("add 0 0 0 {}", payload.len())).await;
        self.send(payload).await;
        self.line().await.unwrap()
    }

    async fn stats(&mut self, args: &str) -> Vec<(String, u64)> {
        self.send(&format!("stats {}", args)).await;
        self.until_end()
            .await
            .into_iter()
            .filter_map(|line| {
                let mut parts = line.split(' ');
                (parts.next() == Some("STAT")).then(|| {
                    let name = parts.next().unwrap().to_string();
                    (name, parts.next().unwrap().parse().unwrap())
                })
            })
            .collect()
    }
}

const TWO_VARIANTS: &str = r#"{"name":"x","variants":[{"id":1,"name":"a"},{"id":2,"name":"b"}]}"#;

#[tokio::test]
async fn test_bucketing_scenario() {
    let mut client = Client::connect(start_server().await).await;

    assert_eq!(client.add(TWO_VARIANTS).await, "STORED");
    client.send("TOUCH 1 0").await;
    assert_eq!(client.line().await.unwrap(), "TOUCHED");

    client.send("GET 1:bob").await;
    assert_eq!(client.until_end().await, vec!["VALUE 1:bob 0 0", "", "END"]);
    client.send("GET 1:bob").await;
    assert_eq!(client.until_end().await, vec!["VALUE 1:bob 0 0", "", "END"]);

    let stats = client.stats("1").await;
    assert_eq!(stats.len(), 8);
    let assigned: Vec<&(String, u64)> = stats
        .iter()
        .filter(|(name, value)| name.starts_with("bucket-users.1.") && *value == 1)
        .collect();
    assert_eq!(assigned.len(), 1);

    let variant = assigned[0].0.rsplit('.').next().unwrap();
    let impressions = format!("bucket-impressions.1.{}", variant);
    assert!(stats.contains(&(impressions, 2)));
}

#[tokio::test]
async fn test_assignment_is_sticky_across_connections() {
    let addr = start_server().await;
    let mut admin = Client::connect(addr).await;
    let payload = r#"{"variants":[{"id":1,"value":"red"},{"id":2,"value":"blue"},{"id":3,"value":"green"}]}"#;
    admin.add(payload).await;
    admin.send("touch 1 0").await;
    admin.line().await;

    let mut first = Client::connect(addr).await;
    first.send("get 1:dana").await;
    let served = first.until_end().await;

    for _ in 0..5 {
        let mut other = Client::connect(addr).await;
        other.send("get 1:dana").await;
        assert_eq!(other.until_end().await, served);
    }

    let total: u64 = admin
        .stats("1")
        .await
        .into_iter()
        .filter(|(name, _)| name.starts_with("bucket-impressions"))
        .map(|(_, value)| value)
        .sum();
    assert_eq!(total, 6);
}

#[tokio::test]
async fn test_conversion_gating() {
    let mut client = Client::connect(start_server().await).await;
    client.add(TWO_VARIANTS).await;

    // Not active: bucket lookups are skipped and conversions refused.
    client.send("get 1:erin").await;
    assert_eq!(client.until_end().await, vec!["END"]);
    client.send("incr 1:erin").await;
    assert_eq!(client.line().await.unwrap(), "0");

    client.send("touch 1 0").await;
    client.line().await;

    // Active but never bucketed.
    client.send("incr 1:erin").await;
    assert_eq!(client.line().await.unwrap(), "0");
    let converted: u64 = client
        .stats("1")
        .await
        .into_iter()
        .filter(|(name, _)| name.starts_with("convert-"))
        .map(|(_, value)| value)
        .sum();
    assert_eq!(converted, 0);

    client.send("get 1:erin").await;
    client.until_end().await;
    client.send("incr 1:erin 1").await;
    assert_eq!(client.line().await.unwrap(), "1");

    client.send("delete 1").await;
    assert_eq!(client.line().await.unwrap(), "DELETED");
    client.send("incr 1:erin").await;
    assert_eq!(client.line().await.unwrap(), "0");
}

#[tokio::test]
async fn test_round_trip_and_soft_delete() {
    let mut client = Client::connect(start_server().await).await;
    let payload = r#"{"id":77,"name":"checkout","description":"d","hypothesis":"h","variants":[{"id":1,"name":"a","value":"v","control":true,"weight":50}]}"#;
    assert_eq!(client.add(payload).await, "STORED");

    client.send("touch 1 0").await;
    client.line().await;
    client.send("delete 1").await;
    assert_eq!(client.line().await.unwrap(), "DELETED");

    client.send("get experiment:1").await;
    let lines = client.until_end().await;
    assert_eq!(lines.len(), 3);
    assert_eq!(lines[0], format!("VALUE experiment:1 0 {}", lines[1].len()));

    let mut expected: serde_json::Value = serde_json::from_str(payload).unwrap();
    expected["id"] = serde_json::json!(1);
    let actual: serde_json::Value = serde_json::from_str(&lines[1]).unwrap();
    assert_eq!(actual, expected);

    client.send("get experiment:active").await;
    assert_eq!(client.until_end().await, vec!["END"]);
}

#[tokio::test]
async fn test_experiment_listings() {
    let mut client = Client::connect(start_server().await).await;
    client.add(r#"{"name":"one"}"#).await;
    client.add(r#"{"name":"two"}"#).await;
    client.send("touch 2 0").await;
    client.line().await;

    client.send("get experiment:* experiment:active").await;
    let lines = client.until_end().await;
    assert_eq!(lines.len(), 5);

    let all: Vec<serde_json::Value> = serde_json::from_str(&lines[1]).unwrap();
    let names: Vec<&str> = all.iter().map(|e| e["name"].as_str().unwrap()).collect();
    assert_eq!(names, vec!["one", "two"]);

    let active: Vec<serde_json::Value> = serde_json::from_str(&lines[3]).unwrap();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0]["id"], 2);
}

#[tokio::test]
async fn test_set_replaces_record() {
    let mut client = Client::connect(start_server().await).await;
    client.add(r#"{"name":"before"}"#).await;

    let payload = r#"{"name":"after"}"#;
    client.send(&format!("replace 1 0 0 {}", payload.len())).await;
    client.send(payload).await;
    assert_eq!(client.line().await.unwrap(), "STORED");

    client.send("get experiment:1").await;
    let lines = client.until_end().await;
    assert!(lines[1].contains(r#""name":"after""#));

    client.send("set 1 0 0 5").await;
    client.send("{bad}").await;
    assert_eq!(client.line().await.unwrap(), "NOT_STORED");
}

#[tokio::test]
async fn test_protocol_errors_keep_connection_open() {
    let mut client = Client::connect(start_server().await).await;

    client.send("frobnicate").await;
    assert_eq!(client.line().await.unwrap(), "CLIENT_ERROR Unknown Command");
    client.send("decr 1:a").await;
    assert_eq!(client.line().await.unwrap(), "CLIENT_ERROR Command Not Implemented");
    client.send("get nocolon").await;
    assert!(client.line().await.unwrap().starts_with("CLIENT_ERROR"));
    client.send("").await;
    client.send("set 1 0 0").await;
    assert!(client.line().await.unwrap().starts_with("CLIENT_ERROR"));

    client.send("stats").await;
    assert_eq!(client.until_end().await, vec!["END"]);
}

#[tokio::test]
async fn test_bad_store_key_consumes_data_line() {
    let mut client = Client::connect(start_server().await).await;

    client.send("set 0 0 0 2").await;
    client.send("{}").await;
    client.send("add x 0 0 2").await;
    client.send("{}").await;
    client.send("stats").await;

    assert_eq!(
        client.line().await.unwrap(),
        "CLIENT_ERROR SET key must be a positive integer"
    );
    assert_eq!(
        client.line().await.unwrap(),
        "CLIENT_ERROR ADD key must be an unsigned integer"
    );
    assert_eq!(client.until_end().await, vec!["END"]);

    client.send("get experiment:*").await;
    assert_eq!(client.until_end().await, vec!["END"]);
}

#[tokio::test]
async fn test_stats_with_only_non_numeric_ids() {
    let mut client = Client::connect(start_server().await).await;
    client.add(TWO_VARIANTS).await;
    client.send("touch 1 0").await;
    client.line().await;

    assert!(client.stats("x").await.is_empty());
    assert_eq!(client.stats("").await.len(), 8);
    assert_eq!(client.stats("x 1").await.len(), 8);
}

#[tokio::test]
async fn test_oversized_line_closes_connection() {
    let mut client = Client::connect(start_server().await).await;
    let line = vec![b'a'; MAX_LINE_LEN + 16];
    // The server may reset the socket before the whole line is written.
    let _ = client.writer.write_all(&line).await;
    let _ = client.writer.write_all(b"\r\n").await;

    let mut rest = Vec::new();
    let closed = match client.reader.read_to_end(&mut rest).await {
        Ok(_) => rest.is_empty(),
        Err(_) => true,
    };
    assert!(closed);
}

#[tokio::test]
async fn test_quit_closes_connection() {
    let mut client = Client::connect(start_server().await).await;
    client.send("quit").await;
    assert_eq!(client.line().await, None);
}
