#[macro_use]
extern crate log;

use std::net::ToSocketAddrs;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use structopt::StructOpt;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use url::Url;

use mqtt_client::{Client, ClientConfig, ConnectOptions, Error, Factory, Transport};
use mqtt_core::QoS;

/// Drives the engine over a plain TCP socket, split into owned halves via
/// `tokio::io::split` so the read loop and the writes the engine issues
/// from timer callbacks can live in separate tasks. A TLS deployment would
/// wrap the same halves in a `tokio_tls`/`rustls` stream; the engine itself
/// is transport-agnostic, per spec.md's OUT-OF-SCOPE clause on TLS.
struct TcpTransport {
    writer: tokio::io::WriteHalf<TcpStream>,
}

#[async_trait::async_trait]
impl Transport for TcpTransport {
    async fn write(&mut self, bytes: &[u8]) -> mqtt_client::Result<()> {
        self.writer
            .write_all(bytes)
            .await
            .map_err(|_| Error::TransportClosed)
    }

    async fn abort(&mut self) {
        let _ = self.writer.shutdown().await;
    }

    async fn close(&mut self) {
        let _ = self.writer.shutdown().await;
    }
}

#[derive(StructOpt, Debug)]
#[structopt(name = "sub_client", about = "a minimal MQTT 3.1/3.1.1 subscriber")]
struct Opt {
    /// Specify the host to connect to.
    #[structopt(short, long, default_value = "localhost")]
    host: String,

    /// Connect to the port specified.
    #[structopt(short, long, default_value = "1883")]
    port: u16,

    /// Specify user, password, hostname, port and topic at once as a URL.
    /// The URL must be in the form: mqtt(s)://[username[:password]@]host[:port]/topic
    ///
    /// If the scheme is mqtt:// then the port defaults to 1883. If the scheme is mqtts:// then the port defaults to 8883.
    #[structopt(short = "L", long)]
    url: Option<Url>,

    /// The id to use for this client.
    #[structopt(short, long, default_value = "rust-mqtt-sub")]
    id: String,

    /// The number of seconds between PINGREQ packets.
    #[structopt(short, long, default_value = "60")]
    keep_alive: u16,

    /// Provide a username to be used for authenticating with the broker.
    #[structopt(short, long)]
    username: Option<String>,

    /// Provide a password to be used for authenticating with the broker.
    #[structopt(short = "P", long)]
    password: Option<String>,

    /// The MQTT topic filter(s) to subscribe to.
    #[structopt(short, long)]
    topic: Vec<String>,

    /// The quality of service to request for the subscription.
    #[structopt(short, long, default_value = "0", parse(try_from_str = parse_qos))]
    qos: QoS,
}

fn parse_qos(s: &str) -> Result<QoS> {
    match s {
        "0" | "at-most-once" => Ok(QoS::AtMostOnce),
        "1" | "at-least-once" => Ok(QoS::AtLeastOnce),
        "2" | "exactly-once" => Ok(QoS::ExactlyOnce),
        _ => Err(anyhow!("invalid QoS: {}", s)),
    }
}

impl Opt {
    /// Resolves the effective (host, port) pair: `--url` wins over the
    /// separate `--host`/`--port` flags when given.
    fn server(&self) -> Result<(&str, u16)> {
        if let Some(ref url) = self.url {
            let host = url.host_str().ok_or_else(|| anyhow!("URL is missing a hostname"))?;
            let port = url
                .port()
                .or_else(|| match url.scheme() {
                    "mqtt" => Some(1883),
                    "mqtts" => Some(8883),
                    _ => None,
                })
                .ok_or_else(|| anyhow!("unexpected URL scheme {:?}", url.scheme()))?;

            Ok((host, port))
        } else {
            Ok((self.host.as_str(), self.port))
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    pretty_env_logger::init();

    let opt = Opt::from_args();
    debug!("{:#?}", opt);

    let (host, port) = opt.server()?;
    let addr = (host, port)
        .to_socket_addrs()
        .context("resolving broker address")?
        .next()
        .ok_or_else(|| anyhow!("no address found for {}:{}", host, port))?;

    let stream = TcpStream::connect(addr).await.context("connecting to broker")?;
    let (mut reader, writer) = tokio::io::split(stream);

    let factory = Factory::new(ClientConfig::new());
    let engine = factory.build(addr, TcpTransport { writer }, opt.id.clone());
    let client = Client::new(engine);

    client
        .set_on_publish(Arc::new(|delivery| {
            println!(
                "{}: {}",
                delivery.topic,
                String::from_utf8_lossy(&delivery.payload)
            );
        }))
        .await;

    client
        .set_on_disconnection(Arc::new(|reason| {
            eprintln!("disconnected: {}", reason);
        }))
        .await;

    let read_loop_client = client.clone();
    tokio::spawn(async move {
        let mut buf = [0u8; 4096];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) | Err(_) => {
                    read_loop_client.on_transport_lost(Error::TransportClosed).await;
                    break;
                }
                Ok(n) => {
                    if read_loop_client.on_bytes(&buf[..n]).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    let session_present = client
        .connect(ConnectOptions {
            keep_alive: opt.keep_alive,
            will: None,
            username: opt.username.clone(),
            password: opt.password.clone().map(String::into_bytes),
        })
        .await?
        .await
        .context("connect signal dropped")??;

    println!("connected, session_present={}", session_present);

    if !opt.topic.is_empty() {
        let subscriptions = opt.topic.iter().cloned().map(|t| (t, opt.qos)).collect();
        let granted = client
            .subscribe(subscriptions)
            .await
            .await
            .context("subscribe signal dropped")??;
        println!("subscribed: {:?}", granted);
    }

    tokio::time::delay_for(Duration::from_secs(3600)).await;

    Ok(())
}
