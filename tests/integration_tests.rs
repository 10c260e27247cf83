//! Integration tests for mitm-proxy

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mitm_proxy::{
  issue_leaf, Body, CapturedExchange, CertificateAuthority, ChannelRecorder, Connector, Error,
  ErrorKind, HostCertCache, HttpLimits, ProxyServer, Recorder, Request, ResponseBuilder,
  ResponseConfig, RootCredential, CONNECT_ESTABLISHED, MAX_SERIAL,
};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_rustls::rustls::client::danger::ServerCertVerifier;
use tokio_rustls::rustls::client::WebPkiServerVerifier;
use tokio_rustls::rustls::pki_types::{ServerName, UnixTime};
use tokio_rustls::rustls::{self, RootCertStore};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use x509_parser::prelude::{FromDer, GeneralName, X509Certificate};

fn provider() -> Arc<rustls::crypto::CryptoProvider> {
  Arc::new(rustls::crypto::ring::default_provider())
}

fn temp_dir(name: &str) -> PathBuf {
  let dir = std::env::temp_dir().join(format!("mitm-proxy-{name}-{}", std::process::id()));
  if dir.exists() {
    std::fs::remove_dir_all(&dir).ok();
  }
  dir
}

struct Fixture {
  authority: Arc<CertificateAuthority>,
  server: ProxyServer,
  exchanges: mpsc::UnboundedReceiver<CapturedExchange>,
}

fn fixture() -> Fixture {
  let (recorder, exchanges) = ChannelRecorder::channel();
  let mut fixture = fixture_with(Arc::new(recorder));
  fixture.exchanges = exchanges;
  fixture
}

fn fixture_with(recorder: Arc<dyn Recorder>) -> Fixture {
  let root = RootCredential::generate("mitm-proxy test root").unwrap();
  let root_pem = root.root_cert_pem().to_string();
  let authority = Arc::new(CertificateAuthority::new(root, HostCertCache::default()));
  let connector = Connector::builder()
    .root_certificates(root_pem)
    .connect_timeout(Some(Duration::from_secs(2)))
    .read_timeout(Some(Duration::from_secs(5)))
    .build()
    .unwrap();
  let server = ProxyServer::builder()
    .authority(authority.clone())
    .connector(connector)
    .recorder(recorder)
    .build()
    .unwrap();
  let (_, exchanges) = mpsc::unbounded_channel();
  Fixture {
    authority,
    server,
    exchanges,
  }
}

fn client_tls(authority: &CertificateAuthority) -> TlsConnector {
  let mut roots = RootCertStore::empty();
  roots.add(authority.root().cert_der().clone()).unwrap();
  let config = rustls::ClientConfig::builder_with_provider(provider())
    .with_safe_default_protocol_versions()
    .unwrap()
    .with_root_certificates(roots)
    .with_no_client_auth();
  TlsConnector::from(Arc::new(config))
}

fn origin_tls(authority: &CertificateAuthority) -> TlsAcceptor {
  let leaf = issue_leaf("127.0.0.1", authority.root()).unwrap();
  let (chain, key) = leaf.certified_chain().unwrap();
  let config = rustls::ServerConfig::builder_with_provider(provider())
    .with_safe_default_protocol_versions()
    .unwrap()
    .with_no_client_auth()
    .with_single_cert(chain, key)
    .unwrap();
  TlsAcceptor::from(Arc::new(config))
}

/// A one-request-per-connection origin that reports each raw request it sees.
struct Origin {
  addr: SocketAddr,
  requests: mpsc::UnboundedReceiver<String>,
}

async fn spawn_origin(tls: Option<TlsAcceptor>, delay: Duration) -> Origin {
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();
  let (tx, requests) = mpsc::unbounded_channel();
  tokio::spawn(async move {
    while let Ok((stream, _)) = listener.accept().await {
      let (tx, tls) = (tx.clone(), tls.clone());
      tokio::spawn(async move {
        match tls {
          Some(acceptor) => {
            if let Ok(stream) = acceptor.accept(stream).await {
              answer(stream, tx, delay).await;
            }
          }
          None => answer(stream, tx, delay).await,
        }
      });
    }
  });
  Origin { addr, requests }
}

async fn answer<S>(stream: S, tx: mpsc::UnboundedSender<String>, delay: Duration)
where
  S: AsyncRead + AsyncWrite + Unpin,
{
  let mut reader = BufReader::new(stream);
  let mut raw = String::new();
  loop {
    let mut line = String::new();
    if reader.read_line(&mut line).await.unwrap_or(0) == 0 {
      return;
    }
    raw.push_str(&line);
    if line == "\r\n" {
      break;
    }
  }
  let length = raw
    .lines()
    .find_map(|l| {
      l.to_ascii_lowercase()
        .strip_prefix("content-length:")
        .map(|v| v.trim().parse::<usize>().unwrap())
    })
    .unwrap_or(0);
  let mut body = vec![0; length];
  reader.read_exact(&mut body).await.unwrap();
  raw.push_str(&String::from_utf8_lossy(&body));
  let path = raw.split(' ').nth(1).unwrap_or("/").to_string();
  tx.send(raw).ok();
  tokio::time::sleep(delay).await;
  let payload = format!("hello from {path}");
  let response = format!(
    "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\nSet-Cookie: session=abc; Path=/; HttpOnly\r\n\r\n{payload}",
    payload.len()
  );
  reader.write_all(response.as_bytes()).await.unwrap();
  reader.shutdown().await.ok();
}

struct Running {
  addr: SocketAddr,
  stop: oneshot::Sender<()>,
  serving: JoinHandle<mitm_proxy::Result<()>>,
}

async fn start(server: ProxyServer) -> Running {
  let listener = server.bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();
  let (stop, rx) = oneshot::channel::<()>();
  let serving = tokio::spawn(listener.serve(async {
    let _ = rx.await;
  }));
  Running {
    addr,
    stop,
    serving,
  }
}

async fn plain_exchange(proxy: SocketAddr, raw: String) -> String {
  let mut stream = TcpStream::connect(proxy).await.unwrap();
  stream.write_all(raw.as_bytes()).await.unwrap();
  let mut response = Vec::new();
  stream.read_to_end(&mut response).await.unwrap();
  String::from_utf8_lossy(&response).to_string()
}

fn get(path: &str) -> Request {
  Request::builder()
    .uri(path)
    .body(Body::default())
    .unwrap()
    .into()
}

#[tokio::test]
async fn root_credential_loads_from_pem_files() {
  let dir = temp_dir("load");
  let (key, cert) = (dir.join("ca.key"), dir.join("ca.crt"));
  let root = RootCredential::generate("load test").unwrap();
  root.write_pem(&key, &cert).await.unwrap();

  let loaded = RootCredential::load(&key, &cert).await.unwrap();
  assert_eq!(loaded.cert_der(), root.cert_der());

  let err = root.write_pem(&key, &cert).await.unwrap_err();
  assert_eq!(err.kind(), ErrorKind::Config, "existing files are kept");
  std::fs::remove_dir_all(&dir).ok();
}

#[tokio::test]
async fn missing_or_garbled_root_is_config_error() {
  let dir = temp_dir("bad-root");
  std::fs::create_dir_all(&dir).unwrap();
  let err = RootCredential::load(dir.join("nope.key"), dir.join("nope.crt"))
    .await
    .unwrap_err();
  assert_eq!(err.kind(), ErrorKind::Config);
  assert!(err.is_fatal());

  std::fs::write(dir.join("ca.key"), "not a key").unwrap();
  std::fs::write(dir.join("ca.crt"), "not a cert").unwrap();
  let err = RootCredential::load(dir.join("ca.key"), dir.join("ca.crt"))
    .await
    .unwrap_err();
  assert_eq!(err.kind(), ErrorKind::Config);
  std::fs::remove_dir_all(&dir).ok();
}

#[tokio::test]
async fn leaves_chain_to_the_root() {
  let root = RootCredential::generate("chain test").unwrap();
  let mut roots = RootCertStore::empty();
  roots.add(root.cert_der().clone()).unwrap();
  let verifier = WebPkiServerVerifier::builder_with_provider(Arc::new(roots), provider())
    .build()
    .unwrap();

  for (host, name) in [
    ("example.com", ServerName::try_from("example.com").unwrap()),
    ("10.0.0.7", ServerName::try_from("10.0.0.7").unwrap()),
  ] {
    let leaf = issue_leaf(host, &root).unwrap();
    assert!(leaf.serial() < MAX_SERIAL);
    let (chain, _) = leaf.certified_chain().unwrap();
    verifier
      .verify_server_cert(&chain[0], &[], &name, &[], UnixTime::now())
      .unwrap();

    let (_, cert) = X509Certificate::from_der(&chain[0]).unwrap();
    let cn = cert.subject().iter_common_name().next().unwrap();
    assert_eq!(cn.as_str().unwrap(), host);
    let san = cert.subject_alternative_name().unwrap().unwrap();
    match &san.value.general_names[0] {
      GeneralName::DNSName(dns) => assert_eq!(*dns, "example.com"),
      GeneralName::IPAddress(ip) => assert_eq!(*ip, &[10, 0, 0, 7][..]),
      other => panic!("unexpected SAN {other:?}"),
    }
  }
}

#[tokio::test]
async fn connect_is_acknowledged_then_intercepted() {
  let fixture = fixture();
  let handler = fixture.server.handler().clone();
  let (mut client, proxy_side) = tokio::io::duplex(64 * 1024);
  let task = tokio::spawn(async move { handler.handle(proxy_side).await });

  client
    .write_all(b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n")
    .await
    .unwrap();
  let mut ack = vec![0; CONNECT_ESTABLISHED.len()];
  client.read_exact(&mut ack).await.unwrap();
  assert_eq!(ack, CONNECT_ESTABLISHED);

  let tls = client_tls(&fixture.authority)
    .connect(ServerName::try_from("example.com").unwrap(), client)
    .await
    .unwrap();
  let presented = tls.get_ref().1.peer_certificates().unwrap()[0].clone();
  let (_, cert) = X509Certificate::from_der(&presented).unwrap();
  let cn = cert.subject().iter_common_name().next().unwrap();
  assert_eq!(cn.as_str().unwrap(), "example.com");

  let cached = fixture.authority.leaf_for("example.com").await.unwrap();
  assert_eq!(fixture.authority.cache().len().await, 1);
  assert_eq!(cached.host(), "example.com");

  drop(tls);
  task.await.unwrap().unwrap();
}

#[tokio::test]
async fn truncated_tunnel_request_is_protocol_error() {
  let fixture = fixture();
  for partial in [
    &b"GET /a HTTP/1.1\r\nHost: example.com\r\n"[..],
    &b"GET /a HTTP/1.1\r\nHost: exam"[..],
    &b"GET /a HT"[..],
  ] {
    let handler = fixture.server.handler().clone();
    let (mut client, proxy_side) = tokio::io::duplex(64 * 1024);
    let task = tokio::spawn(async move { handler.handle(proxy_side).await });
    client
      .write_all(b"CONNECT example.com:443 HTTP/1.1\r\n\r\n")
      .await
      .unwrap();
    let mut ack = vec![0; CONNECT_ESTABLISHED.len()];
    client.read_exact(&mut ack).await.unwrap();
    let mut tls = client_tls(&fixture.authority)
      .connect(ServerName::try_from("example.com").unwrap(), client)
      .await
      .unwrap();
    tls.write_all(partial).await.unwrap();
    tls.flush().await.unwrap();
    // the duplex closes underneath rustls, so no close_notify is sent
    drop(tls);
    let err = task.await.unwrap().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Protocol, "{partial:?}");
  }
}

#[tokio::test]
async fn tunnel_serves_sequential_requests() {
  let mut fixture = fixture();
  let mut origin = spawn_origin(Some(origin_tls(&fixture.authority)), Duration::ZERO).await;
  let port = origin.addr.port();
  let handler = fixture.server.handler().clone();
  let (mut client, proxy_side) = tokio::io::duplex(64 * 1024);
  let task = tokio::spawn(async move { handler.handle(proxy_side).await });

  client
    .write_all(format!("CONNECT 127.0.0.1:{port} HTTP/1.1\r\n\r\n").as_bytes())
    .await
    .unwrap();
  let mut ack = vec![0; CONNECT_ESTABLISHED.len()];
  client.read_exact(&mut ack).await.unwrap();
  let tls = client_tls(&fixture.authority)
    .connect(ServerName::try_from("127.0.0.1").unwrap(), client)
    .await
    .unwrap();
  let mut tunnel = BufReader::new(tls);

  tunnel
    .write_all(format!("GET /one?x=1 HTTP/1.1\r\nHost: 127.0.0.1:{port}\r\nProxy-Connection: keep-alive\r\n\r\n").as_bytes())
    .await
    .unwrap();
  let config = ResponseConfig::new(&get("/one"), None, HttpLimits::default());
  let first = ResponseBuilder::new(&mut tunnel, config).build().await.unwrap();
  assert_eq!(first.status_code(), 200);
  assert!(first.headers().get("connection").is_none());
  assert_eq!(first.body().as_ref().unwrap().to_vec(), b"hello from /one?x=1");

  let form = "a=1&b=two+words";
  tunnel
    .write_all(
      format!(
        "POST /two HTTP/1.1\r\nHost: 127.0.0.1:{port}\r\nCookie: a=1; b=2\r\nContent-Type: application/x-www-form-urlencoded\r\nContent-Length: {}\r\n\r\n{form}",
        form.len()
      )
      .as_bytes(),
    )
    .await
    .unwrap();
  let config = ResponseConfig::new(&get("/two"), None, HttpLimits::default());
  let second = ResponseBuilder::new(&mut tunnel, config).build().await.unwrap();
  assert_eq!(second.body().as_ref().unwrap().to_vec(), b"hello from /two");

  tunnel.shutdown().await.unwrap();
  task.await.unwrap().unwrap();

  let seen = origin.requests.recv().await.unwrap();
  assert!(seen.starts_with("GET /one?x=1 HTTP/1.1\r\n"));
  assert!(!seen.to_ascii_lowercase().contains("proxy-connection"));

  let one = fixture.exchanges.recv().await.unwrap();
  assert_eq!(one.request.url, format!("https://127.0.0.1:{port}/one?x=1"));
  assert_eq!(one.request.query["x"], vec!["1"]);
  assert_eq!(one.response.status, 200);
  assert_eq!(one.response.cookies[0].name(), "session");
  let two = fixture.exchanges.recv().await.unwrap();
  assert_eq!(two.request.method, "POST");
  assert_eq!(two.request.cookies.len(), 2);
  assert_eq!(two.request.post_form["b"], vec!["two words"]);
}

#[tokio::test]
async fn plain_request_is_forwarded_once() {
  let mut fixture = fixture();
  let mut origin = spawn_origin(None, Duration::ZERO).await;
  let port = origin.addr.port();
  let running = start(fixture.server).await;

  let response = plain_exchange(
    running.addr,
    format!(
      "GET http://127.0.0.1:{port}/plain HTTP/1.1\r\nHost: stale.test\r\nProxy-Connection: keep-alive\r\nKeep-Alive: 300\r\nTE: trailers\r\nX-Custom: yes\r\n\r\n"
    ),
  )
  .await;
  assert!(response.starts_with("HTTP/1.1 200 OK\r\n"), "{response}");
  assert!(response.ends_with("hello from /plain"));

  let seen = origin.requests.recv().await.unwrap().to_ascii_lowercase();
  assert!(seen.starts_with("get /plain http/1.1\r\n"));
  assert!(seen.contains("x-custom: yes"));
  assert!(seen.contains(&format!("host: 127.0.0.1:{port}\r\n")), "{seen}");
  assert!(!seen.contains("stale.test"));
  for stripped in ["proxy-connection", "keep-alive", "te:"] {
    assert!(!seen.contains(stripped), "{stripped} reached the origin");
  }
  let exchange = fixture.exchanges.recv().await.unwrap();
  assert_eq!(exchange.request.url, format!("http://127.0.0.1:{port}/plain"));
  assert!(exchange.request.headers.get("x-custom").is_some());

  running.stop.send(()).unwrap();
  running.serving.await.unwrap().unwrap();
}

#[derive(Debug)]
struct FailingRecorder;

#[async_trait]
impl Recorder for FailingRecorder {
  async fn record(&self, _exchange: CapturedExchange) -> mitm_proxy::Result<()> {
    Err(Error::capture("store unavailable"))
  }
}

#[tokio::test]
async fn capture_failure_does_not_block_response() {
  let fixture = fixture_with(Arc::new(FailingRecorder));
  let origin = spawn_origin(None, Duration::ZERO).await;
  let port = origin.addr.port();
  let running = start(fixture.server).await;

  let response = plain_exchange(
    running.addr,
    format!("GET http://127.0.0.1:{port}/kept HTTP/1.1\r\n\r\n"),
  )
  .await;
  assert!(response.ends_with("hello from /kept"), "{response}");
  running.stop.send(()).unwrap();
}

#[tokio::test]
async fn unreachable_origin_yields_bad_gateway() {
  let fixture = fixture();
  let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let dead = closed.local_addr().unwrap().port();
  drop(closed);

  let handler = fixture.server.handler().clone();
  let (mut client, proxy_side) = tokio::io::duplex(64 * 1024);
  let task = tokio::spawn(async move { handler.handle(proxy_side).await });
  client
    .write_all(format!("GET http://127.0.0.1:{dead}/ HTTP/1.1\r\n\r\n").as_bytes())
    .await
    .unwrap();
  let mut response = Vec::new();
  client.read_to_end(&mut response).await.unwrap();
  assert!(response.starts_with(b"HTTP/1.1 502 Bad Gateway\r\n"));
  let err = task.await.unwrap().unwrap_err();
  assert_eq!(err.kind(), ErrorKind::Upstream);
  assert!(!err.is_fatal());

  let origin = spawn_origin(None, Duration::ZERO).await;
  let running = start(fixture.server).await;
  let failed = plain_exchange(
    running.addr,
    format!("GET http://127.0.0.1:{dead}/ HTTP/1.1\r\n\r\n"),
  )
  .await;
  assert!(failed.starts_with("HTTP/1.1 502 Bad Gateway\r\n"));
  let served = plain_exchange(
    running.addr,
    format!("GET http://127.0.0.1:{}/after HTTP/1.1\r\n\r\n", origin.addr.port()),
  )
  .await;
  assert!(served.ends_with("hello from /after"), "listener stopped accepting");
  running.stop.send(()).unwrap();
}

#[tokio::test]
async fn malformed_first_request_is_protocol_error() {
  let fixture = fixture();
  let handler = fixture.server.handler().clone();
  let (mut client, proxy_side) = tokio::io::duplex(1024);
  let task = tokio::spawn(async move { handler.handle(proxy_side).await });
  client.write_all(b"BOGUS\r\n\r\n").await.unwrap();
  let err = task.await.unwrap().unwrap_err();
  assert_eq!(err.kind(), ErrorKind::Protocol);
}

#[tokio::test]
async fn shutdown_drains_in_flight_connections() {
  let fixture = fixture();
  let mut origin = spawn_origin(None, Duration::from_millis(300)).await;
  let port = origin.addr.port();
  let running = start(fixture.server).await;

  let mut stream = TcpStream::connect(running.addr).await.unwrap();
  stream
    .write_all(format!("GET http://127.0.0.1:{port}/slow HTTP/1.1\r\n\r\n").as_bytes())
    .await
    .unwrap();
  origin.requests.recv().await.unwrap();
  running.stop.send(()).unwrap();

  let mut response = Vec::new();
  stream.read_to_end(&mut response).await.unwrap();
  assert!(String::from_utf8_lossy(&response).ends_with("hello from /slow"));
  running.serving.await.unwrap().unwrap();
  assert!(TcpStream::connect(running.addr).await.is_err());
}
