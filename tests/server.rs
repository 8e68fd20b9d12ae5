//! End-to-end tests against a running server over real TLS connections.

use rcgen::{BasicConstraints, CertificateParams, DnType, IsCa, KeyPair};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName};
use rustls::{ClientConfig, ClientConnection, RootCertStore, StreamOwned};
use shroud::stats::ServerStats;
use shroud::{Config, Server, ServerError, credentials};
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime};
use tempfile::TempDir;

const TEMPLATE: &str =
    "data: {data}, local address: {local_address}, remote address: {remote_address}\n";

type Client = BufReader<StreamOwned<ClientConnection, TcpStream>>;

struct Pki {
    ca_cert: rcgen::Certificate,
    ca_key: KeyPair,
}

impl Pki {
    fn new() -> Self {
        let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params
            .distinguished_name
            .push(DnType::CommonName, "shroud integration ca");
        let ca_key = KeyPair::generate().unwrap();
        let ca_cert = params.self_signed(&ca_key).unwrap();
        Self { ca_cert, ca_key }
    }

    fn issue(&self, name: &str) -> (rcgen::Certificate, KeyPair) {
        let params = CertificateParams::new(vec![name.to_string()]).unwrap();
        let key = KeyPair::generate().unwrap();
        let cert = params.signed_by(&key, &self.ca_cert, &self.ca_key).unwrap();
        (cert, key)
    }

    fn roots(&self) -> RootCertStore {
        let mut roots = RootCertStore::empty();
        roots.add(self.ca_cert.der().clone()).unwrap();
        roots
    }

    fn client_config(&self) -> Arc<ClientConfig> {
        credentials::client_config(self.roots(), None).unwrap()
    }

    fn client_config_with_identity(&self) -> Arc<ClientConfig> {
        let (cert, key) = self.issue("client");
        let chain: Vec<CertificateDer<'static>> = vec![cert.der().clone()];
        let key: PrivateKeyDer<'static> = PrivatePkcs8KeyDer::from(key.serialize_der()).into();
        credentials::client_config(self.roots(), Some((chain, key))).unwrap()
    }
}

struct TestServer {
    addr: SocketAddr,
    stats: Arc<ServerStats>,
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<Result<(), ServerError>>>,
    template: PathBuf,
    _dir: TempDir,
}

impl TestServer {
    fn start(pki: &Pki, client_auth: bool) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let (cert, key) = pki.issue("localhost");

        let cert_path = write(dir.path(), "server.crt", &cert.pem());
        let key_path = write(dir.path(), "server.key", &key.serialize_pem());
        let ca_path = write(dir.path(), "ca.crt", &pki.ca_cert.pem());
        let template = write(dir.path(), "processor.tmpl", TEMPLATE);

        let trust = if client_auth {
            format!("trust = {:?}", ca_path.display().to_string())
        } else {
            String::new()
        };
        let config = format!(
            r#"
            [server]
            host = "127.0.0.1"
            port = 0
            selector_timeout_ms = 50
            handshake_timeout_ms = 2000
            io_timeout_ms = 2000

            [workers]
            threads = 2
            task_threads = 1

            [processor]
            path = {:?}
            refresh_interval_ms = 50

            [tls]
            cert = {:?}
            key = {:?}
            {trust}

            [logging]
            level = "debug"
            "#,
            template.display().to_string(),
            cert_path.display().to_string(),
            key_path.display().to_string(),
        );
        let config_path = write(dir.path(), "shroud.toml", &config);
        let config = Config::load(&config_path).unwrap();

        let server = Server::from_config(config).unwrap();
        let addr = server.local_addr();
        let stats = server.stats();
        let shutdown = server.shutdown_handle();
        let handle = thread::spawn(move || server.run());

        Self {
            addr,
            stats,
            shutdown,
            handle: Some(handle),
            template,
            _dir: dir,
        }
    }

    fn connect(&self, config: Arc<ClientConfig>) -> Client {
        let tcp = TcpStream::connect(self.addr).unwrap();
        tcp.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        tcp.set_nodelay(true).unwrap();
        let name = ServerName::try_from("localhost").unwrap();
        let conn = ClientConnection::new(config, name).unwrap();
        BufReader::new(StreamOwned::new(conn, tcp))
    }

    fn expected(&self, client: &Client, data: &str) -> String {
        let remote = client.get_ref().sock.local_addr().unwrap();
        format!(
            "data: {data}, local address: {}, remote address: {remote}\n",
            self.addr
        )
    }

    fn stop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            handle.join().unwrap().unwrap();
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn write(dir: &Path, name: &str, contents: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, contents).unwrap();
    path
}

fn send(client: &mut Client, payload: &[u8]) {
    let stream = client.get_mut();
    stream.write_all(payload).unwrap();
    stream.flush().unwrap();
}

fn read_line(client: &mut Client) -> String {
    let mut line = String::new();
    client.read_line(&mut line).unwrap();
    line
}

fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    condition()
}

#[test]
fn test_responses_carry_payload_and_addresses() {
    let pki = Pki::new();
    let mut server = TestServer::start(&pki, false);
    let mut client = server.connect(pki.client_config());

    send(&mut client, b"test1");
    assert_eq!(read_line(&mut client), server.expected(&client, "test1"));

    send(&mut client, b"test2");
    assert_eq!(read_line(&mut client), server.expected(&client, "test2"));

    drop(client);
    server.stop();
}

#[test]
fn test_back_to_back_requests_keep_order() {
    let pki = Pki::new();
    let mut server = TestServer::start(&pki, false);
    let mut client = server.connect(pki.client_config());

    // two records before reading anything; records that arrive in the same
    // socket read are decoded as one payload
    send(&mut client, b"test1");
    send(&mut client, b"test2");

    let first = read_line(&mut client);
    if first != server.expected(&client, "test1test2") {
        assert_eq!(first, server.expected(&client, "test1"));
        assert_eq!(read_line(&mut client), server.expected(&client, "test2"));
    }

    drop(client);
    server.stop();
}

#[test]
fn test_payload_larger_than_initial_buffer() {
    let pki = Pki::new();
    let mut server = TestServer::start(&pki, false);
    let mut client = server.connect(pki.client_config());

    let payload = "x".repeat(12_000);
    send(&mut client, payload.as_bytes());
    assert_eq!(read_line(&mut client), server.expected(&client, &payload));

    drop(client);
    server.stop();
}

#[test]
fn test_concurrent_clients() {
    let pki = Pki::new();
    let mut server = TestServer::start(&pki, false);
    let config = pki.client_config();

    let mut clients: Vec<Client> = (0..4).map(|_| server.connect(config.clone())).collect();
    for (i, client) in clients.iter_mut().enumerate() {
        send(client, format!("client{i}").as_bytes());
    }
    for (i, client) in clients.iter_mut().enumerate() {
        let expected = server.expected(client, &format!("client{i}"));
        assert_eq!(read_line(client), expected);
    }
    assert!(wait_until(Duration::from_secs(2), || {
        server.stats.active_connections() == 4
    }));

    drop(clients);
    assert!(wait_until(Duration::from_secs(5), || {
        server.stats.active_connections() == 0
    }));
    server.stop();
}

#[test]
fn test_disconnect_during_handshake_registers_nothing() {
    let pki = Pki::new();
    let mut server = TestServer::start(&pki, false);

    {
        let mut tcp = TcpStream::connect(server.addr).unwrap();
        // start of a ClientHello record, then hang up
        tcp.write_all(&[0x16, 0x03, 0x01, 0x00, 0xc8, 0x01, 0x00]).unwrap();
    }

    assert!(wait_until(Duration::from_secs(5), || {
        server.stats.snapshot().handshake_failures == 1
    }));
    assert_eq!(server.stats.active_connections(), 0);

    // the server keeps serving
    let mut client = server.connect(pki.client_config());
    send(&mut client, b"test1");
    assert_eq!(read_line(&mut client), server.expected(&client, "test1"));

    drop(client);
    server.stop();
}

#[test]
fn test_untrusted_server_certificate_fails_handshake() {
    let pki = Pki::new();
    let mut server = TestServer::start(&pki, false);

    let other = Pki::new();
    let mut client = server.connect(other.client_config());
    let result = client.get_mut().write_all(b"test1");
    assert!(result.is_err());

    assert!(wait_until(Duration::from_secs(5), || {
        server.stats.snapshot().handshake_failures == 1
    }));
    assert_eq!(server.stats.active_connections(), 0);

    drop(client);
    server.stop();
}

#[test]
fn test_client_certificate_required_when_trust_configured() {
    let pki = Pki::new();
    let mut server = TestServer::start(&pki, true);

    let mut anonymous = server.connect(pki.client_config());
    let _ = anonymous.get_mut().write_all(b"test1");
    let _ = anonymous.get_mut().flush();
    let mut buf = String::new();
    let outcome = anonymous.read_line(&mut buf);
    assert!(matches!(outcome, Err(_) | Ok(0)));
    assert!(wait_until(Duration::from_secs(5), || {
        server.stats.snapshot().handshake_failures == 1
    }));

    let mut client = server.connect(pki.client_config_with_identity());
    send(&mut client, b"test1");
    assert_eq!(read_line(&mut client), server.expected(&client, "test1"));

    drop(anonymous);
    drop(client);
    server.stop();
}

#[test]
fn test_processor_reloads_when_template_changes() {
    let pki = Pki::new();
    let mut server = TestServer::start(&pki, false);
    let mut client = server.connect(pki.client_config());

    send(&mut client, b"before");
    assert_eq!(read_line(&mut client), server.expected(&client, "before"));

    std::fs::write(&server.template, "reloaded: {data}\n").unwrap();
    let file = std::fs::File::options()
        .write(true)
        .open(&server.template)
        .unwrap();
    file.set_modified(SystemTime::now() + Duration::from_secs(10))
        .unwrap();

    let mut reloaded = false;
    for _ in 0..100 {
        send(&mut client, b"after");
        if read_line(&mut client) == "reloaded: after\n" {
            reloaded = true;
            break;
        }
        thread::sleep(Duration::from_millis(20));
    }
    assert!(reloaded);

    drop(client);
    server.stop();
}

#[test]
fn test_broken_template_keeps_previous_processor() {
    let pki = Pki::new();
    let mut server = TestServer::start(&pki, false);
    let mut client = server.connect(pki.client_config());

    std::fs::write(&server.template, "broken {placeholder\n").unwrap();
    let file = std::fs::File::options()
        .write(true)
        .open(&server.template)
        .unwrap();
    file.set_modified(SystemTime::now() + Duration::from_secs(10))
        .unwrap();
    // several refresh intervals
    thread::sleep(Duration::from_millis(300));

    send(&mut client, b"test1");
    assert_eq!(read_line(&mut client), server.expected(&client, "test1"));

    drop(client);
    server.stop();
}

#[test]
fn test_shutdown_closes_open_connections() {
    let pki = Pki::new();
    let mut server = TestServer::start(&pki, false);
    let mut client = server.connect(pki.client_config());

    send(&mut client, b"test1");
    read_line(&mut client);
    server.stop();

    // close_notify then end of stream
    let mut rest = Vec::new();
    let _ = client.read_to_end(&mut rest);
    assert!(rest.is_empty());
    assert_eq!(server.stats.active_connections(), 0);
}
