//! TLS-terminating chat proxy.
//!
//! The client connects to a loopback listener and is served with a bundled
//! certificate; the proxy dials the real chat server and runs the two pumps
//! of [`engine`] between them. When either leg drops, both are closed, the
//! next client connection is accepted and the server is dialed again. The
//! listener, the settings and everything in [`PresenceMemory`] outlive every
//! single session.

pub mod commands;
pub mod engine;
mod identity;
mod inject;
mod rewrite;
mod tree;

use std::future::Future;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore, ServerConfig};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, error, info, warn};

use crate::config_proxy::ChatServer;
use crate::control::ControlHandle;
use crate::prompt::Prompt;
use crate::settings::Settings;
use engine::PresenceMemory;

/// Global flag to disable TLS certificate verification on the server leg.
/// Set once at startup via `set_dangerous_insecure_tls()` from the CLI `--dangerous-insecure-tls` flag.
static DANGEROUS_INSECURE_TLS: std::sync::OnceLock<bool> = std::sync::OnceLock::new();

/// Set the insecure TLS flag (called once from main.rs at startup).
pub fn set_dangerous_insecure_tls(enabled: bool) {
    let _ = DANGEROUS_INSECURE_TLS.set(enabled);
}

fn is_insecure_tls() -> bool {
    DANGEROUS_INSECURE_TLS.get().copied().unwrap_or(false)
}

/// Served to the client, which is told to accept bad certificates.
const PROXY_CERT_PEM: &[u8] = include_bytes!("../../certs/proxy.pem");
const PROXY_KEY_PEM: &[u8] = include_bytes!("../../certs/proxy.key");

/// TCP connect timeout for the chat server.
const TCP_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// How long to wait for the config proxy to reveal the chat server once the
/// client has connected. The client fetches its config before connecting to
/// chat, so this only runs out when the config answer had no chat settings.
const CHAT_SERVER_TIMEOUT: Duration = Duration::from_secs(10);

/// Pause between an accepted retry and the next dial.
const REDIAL_BACKOFF: Duration = Duration::from_secs(1);

const REDIAL_MESSAGE: &str = "Unable to reconnect to the chat server. Please check your internet \
     connection. If this issue persists and you can connect to chat normally without Veil, \
     please file a bug report.";

#[derive(Debug, Error)]
pub enum SetupError {
    #[error(
        "Veil was unable to find the chat server. If this issue persists and you can connect \
         to chat normally without Veil, please file a bug report."
    )]
    ChatServerUnknown,
    #[error("Gave up reconnecting to the chat server.")]
    DialCancelled,
    #[error("TLS setup failed: {0}")]
    Tls(String),
    #[error("bundled proxy certificate is unusable: {0}")]
    Certificate(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Initialize rustls crypto provider (must be called once at startup)
pub fn init_crypto_provider() {
    use std::sync::Once;
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

/// TLS certificate verifier that accepts all certificates without validation.
///
/// **DANGEROUS**: Only used when `--dangerous-insecure-tls` CLI flag is set.
/// Intended for testing against chat servers with self-signed certificates.
#[derive(Debug)]
struct InsecureCertVerifier(Arc<rustls::crypto::CryptoProvider>);

impl rustls::client::danger::ServerCertVerifier for InsecureCertVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &rustls::pki_types::CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &rustls::pki_types::CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

fn insecure_tls_connector() -> TlsConnector {
    let provider = rustls::crypto::ring::default_provider();
    let config = ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(InsecureCertVerifier(Arc::new(provider))))
        .with_no_client_auth();
    TlsConnector::from(Arc::new(config))
}

/// Create a TLS connector for the chat server using the system's native root certificates.
///
/// When `--dangerous-insecure-tls` is set, certificate verification is skipped entirely.
fn create_tls_connector() -> Result<TlsConnector, SetupError> {
    if is_insecure_tls() {
        warn!("TLS certificate verification DISABLED (--dangerous-insecure-tls)");
        return Ok(insecure_tls_connector());
    }

    let mut root_store = RootCertStore::empty();
    let native_certs = rustls_native_certs::load_native_certs();
    if native_certs.certs.is_empty() {
        return Err(SetupError::Tls(
            "No system root certificates found. TLS connections will fail. \
            Ensure CA certificates are installed (e.g., ca-certificates package on Linux)."
                .to_string(),
        ));
    }
    for cert in native_certs.certs {
        root_store
            .add(cert)
            .map_err(|e| SetupError::Tls(format!("Failed to add cert: {}", e)))?;
    }

    let config = ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();

    Ok(TlsConnector::from(Arc::new(config)))
}

/// Server-role TLS for the client leg, from the bundled certificate.
fn create_tls_acceptor() -> Result<TlsAcceptor, SetupError> {
    let certs = CertificateDer::pem_slice_iter(PROXY_CERT_PEM)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| SetupError::Certificate(format!("certificate: {}", e)))?;
    let key = PrivateKeyDer::from_pem_slice(PROXY_KEY_PEM)
        .map_err(|e| SetupError::Certificate(format!("private key: {}", e)))?;
    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| SetupError::Certificate(e.to_string()))?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

fn classify_tls_error(error: &std::io::Error) -> &'static str {
    let detail = error.to_string().to_lowercase();
    if detail.contains("certificate") {
        "certificate_error"
    } else if detail.contains("timed out") || detail.contains("timeout") {
        "timeout"
    } else if detail.contains("refused") || detail.contains("reset") {
        "connection_refused"
    } else {
        "other"
    }
}

/// Upgrade a TCP stream to TLS using the given host for SNI.
async fn upgrade_to_tls(
    connector: &TlsConnector,
    tcp_stream: TcpStream,
    host: &str,
) -> Result<tokio_rustls::client::TlsStream<TcpStream>, SetupError> {
    let server_name = ServerName::try_from(host.to_string())
        .map_err(|e| SetupError::Tls(format!("Invalid server name: {}", e)))?;

    connector
        .connect(server_name, tcp_stream)
        .await
        .map_err(|e| {
            let classification = classify_tls_error(&e);
            error!(host, error = %e, error_class = classification, "TLS handshake failed");
            SetupError::Tls(format!(
                "TLS handshake failed with {} ({}): {}",
                host, classification, e
            ))
        })
}

/// Dial and TLS-wrap the chat server.
async fn connect_chat_server(
    connector: &TlsConnector,
    server: &ChatServer,
) -> Result<tokio_rustls::client::TlsStream<TcpStream>, SetupError> {
    let tcp_stream = tokio::time::timeout(
        TCP_CONNECT_TIMEOUT,
        TcpStream::connect((server.host.as_str(), server.port)),
    )
    .await
    .map_err(|_| {
        error!(
            host = %server.host, port = server.port,
            timeout_secs = TCP_CONNECT_TIMEOUT.as_secs(),
            "TCP connect timed out"
        );
        SetupError::Io(std::io::ErrorKind::TimedOut.into())
    })?
    .map_err(|e| {
        error!(
            host = %server.host, port = server.port,
            error = %e, error_kind = ?e.kind(),
            "TCP connect failed"
        );
        SetupError::Io(e)
    })?;

    let tls_stream = upgrade_to_tls(connector, tcp_stream, &server.host).await?;
    info!(host = %server.host, port = server.port, "Connected to chat server");
    Ok(tls_stream)
}

async fn wait_for_chat_server(
    chat_server: &mut watch::Receiver<Option<ChatServer>>,
) -> Result<ChatServer, SetupError> {
    let known = tokio::time::timeout(CHAT_SERVER_TIMEOUT, chat_server.wait_for(Option::is_some))
        .await
        .map_err(|_| SetupError::ChatServerUnknown)?
        .map_err(|_| SetupError::ChatServerUnknown)?
        .clone();
    known.ok_or(SetupError::ChatServerUnknown)
}

/// Pause after a failed `accept()`, so a persistent failure (out of file
/// descriptors) does not spin.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Accepts until one connection completes the server-side TLS handshake.
/// Failed accepts and failed handshakes are logged and skipped.
async fn accept_tls<A, F>(mut accept: A, acceptor: &TlsAcceptor) -> ClientLeg
where
    A: FnMut() -> F,
    F: Future<Output = std::io::Result<(TcpStream, SocketAddr)>>,
{
    loop {
        let (tcp, addr) = match accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(error = %e, error_kind = ?e.kind(), "Accept failed, waiting for another connection");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
                continue;
            }
        };
        info!(addr = %addr, "Client connected");
        match acceptor.accept(tcp).await {
            Ok(tls) => return tls,
            Err(e) => {
                warn!(
                    addr = %addr, error = %e, error_class = classify_tls_error(&e),
                    "Client TLS handshake failed, waiting for another connection"
                );
            }
        }
    }
}

type ClientLeg = tokio_rustls::server::TlsStream<TcpStream>;
type ServerLeg = tokio_rustls::client::TlsStream<TcpStream>;

/// Owns the loopback listener and restarts the proxy whenever a session ends.
pub struct Supervisor<P> {
    listener: TcpListener,
    acceptor: TlsAcceptor,
    connector: TlsConnector,
    memory: Arc<PresenceMemory>,
    control: ControlHandle,
    settings: Settings,
    prompt: Arc<P>,
}

impl<P: Prompt> Supervisor<P> {
    /// Binds the loopback listener. Nothing is accepted until [`run`](Self::run).
    pub async fn bind(
        memory: Arc<PresenceMemory>,
        control: ControlHandle,
        settings: Settings,
        prompt: Arc<P>,
    ) -> Result<Self, SetupError> {
        init_crypto_provider();
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
        info!(port = listener.local_addr()?.port(), "Chat proxy listening");
        Ok(Self {
            listener,
            acceptor: create_tls_acceptor()?,
            connector: create_tls_connector()?,
            memory,
            control,
            settings,
            prompt,
        })
    }

    pub fn port(&self) -> Result<u16, SetupError> {
        Ok(self.listener.local_addr()?.port())
    }

    /// Proxies sessions until setup fails for good. `chat_server` is where
    /// the config proxy reports the real chat server.
    pub async fn run(
        self,
        mut chat_server: watch::Receiver<Option<ChatServer>>,
    ) -> Result<(), SetupError> {
        let mut attempt: u64 = 0;
        loop {
            attempt += 1;
            let (client, server) = self.establish(attempt, &mut chat_server).await?;

            let mut running =
                engine::start(client, server, self.memory.clone(), self.control.clone()).await;
            let session_id = running.session().id();
            debug!(session_id, attempt, "Proxying");

            let reason = running.ended().await;
            let injection = running.session().injection();
            info!(
                session_id,
                reason = ?reason,
                roster_injected = injection.roster_injected(),
                introduced = injection.introduction_sent(),
                "Session over, reconnecting"
            );
            running.close().await;

            if let Err(e) = self.settings.save_status(self.control.state().visibility) {
                warn!(error = %e, "Failed to save status");
            }
        }
    }

    /// Accept, handshake, learn the chat server, dial it.
    async fn establish(
        &self,
        attempt: u64,
        chat_server: &mut watch::Receiver<Option<ChatServer>>,
    ) -> Result<(ClientLeg, ServerLeg), SetupError> {
        debug!(attempt, "Waiting for the client to connect");
        let client = self.accept_client().await;

        let server = wait_for_chat_server(chat_server).await?;
        let upstream = self.dial_with_prompt(&server).await?;
        Ok((client, upstream))
    }

    async fn accept_client(&self) -> ClientLeg {
        let listener = &self.listener;
        accept_tls(move || listener.accept(), &self.acceptor).await
    }

    /// Dials until it works or the operator gives up.
    async fn dial_with_prompt(&self, server: &ChatServer) -> Result<ServerLeg, SetupError> {
        loop {
            match connect_chat_server(&self.connector, server).await {
                Ok(stream) => return Ok(stream),
                Err(e) => {
                    warn!(host = %server.host, port = server.port, error = %e, "Chat server dial failed");
                    if !self.prompt.retry_or_cancel(REDIAL_MESSAGE).await {
                        info!("Operator cancelled reconnecting");
                        return Err(SetupError::DialCancelled);
                    }
                    tokio::time::sleep(REDIAL_BACKOFF).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::{spawn_controller, ProxyState, Visibility};
    use crate::prompt::testing::ScriptedPrompt;
    use super::identity::ROSTER_MARKER;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    const WAIT: Duration = Duration::from_secs(5);

    fn test_connector() -> TlsConnector {
        init_crypto_provider();
        insecure_tls_connector()
    }

    struct Harness {
        supervisor: Supervisor<ScriptedPrompt>,
        dir: tempfile::TempDir,
        chat_server: watch::Receiver<Option<ChatServer>>,
        _chat_server_tx: watch::Sender<Option<ChatServer>>,
    }

    async fn harness(chat_server: Option<ChatServer>, prompt: ScriptedPrompt) -> Harness {
        init_crypto_provider();
        let dir = tempfile::TempDir::new().unwrap();
        let settings = Settings::at(dir.path()).unwrap();
        let memory = Arc::new(PresenceMemory::default());
        let (control, _task) = spawn_controller(ProxyState::new(Visibility::Mobile), memory.clone());
        let (tx, rx) = watch::channel(chat_server);
        let supervisor = Supervisor {
            listener: TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap(),
            acceptor: create_tls_acceptor().unwrap(),
            connector: test_connector(),
            memory,
            control,
            settings,
            prompt: Arc::new(prompt),
        };
        Harness {
            supervisor,
            dir,
            chat_server: rx,
            _chat_server_tx: tx,
        }
    }

    async fn connect_client(port: u16) -> tokio_rustls::client::TlsStream<TcpStream> {
        let tcp = TcpStream::connect((Ipv4Addr::LOCALHOST, port)).await.unwrap();
        test_connector()
            .connect(ServerName::try_from("localhost").unwrap(), tcp)
            .await
            .unwrap()
    }

    async fn read_text<S: tokio::io::AsyncRead + Unpin>(stream: &mut S) -> String {
        let mut buf = vec![0u8; 16 * 1024];
        let n = tokio::time::timeout(WAIT, stream.read(&mut buf))
            .await
            .expect("timed out")
            .expect("read failed");
        String::from_utf8_lossy(&buf[..n]).into_owned()
    }

    #[test]
    fn test_bundled_certificate_loads() {
        init_crypto_provider();
        assert!(create_tls_acceptor().is_ok());
    }

    #[test]
    fn test_classify_tls_error() {
        let e = std::io::Error::new(std::io::ErrorKind::Other, "invalid peer certificate: UnknownIssuer");
        assert_eq!(classify_tls_error(&e), "certificate_error");
        let e = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "connection reset by peer");
        assert_eq!(classify_tls_error(&e), "connection_refused");
    }

    #[tokio::test]
    async fn test_proxies_and_reconnects() {
        // Fake chat server: TLS with the same bundled certificate.
        let chat_listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let chat_port = chat_listener.local_addr().unwrap().port();
        init_crypto_provider();
        let chat_acceptor = create_tls_acceptor().unwrap();

        let Harness {
            supervisor,
            dir,
            chat_server,
            _chat_server_tx,
        } = harness(
            Some(ChatServer {
                host: "127.0.0.1".to_string(),
                port: chat_port,
            }),
            ScriptedPrompt::default(),
        )
        .await;
        let proxy_port = supervisor.port().unwrap();
        let run = tokio::spawn(supervisor.run(chat_server));

        // First session.
        let mut client = connect_client(proxy_port).await;
        let (tcp, _) = chat_listener.accept().await.unwrap();
        let mut server = chat_acceptor.accept(tcp).await.unwrap();

        client.write_all(b"<iq type='get' id='1'/>").await.unwrap();
        assert_eq!(read_text(&mut server).await, "<iq type='get' id='1'/>");

        let roster = format!("<iq type='result' id='1'>{}</query></iq>", ROSTER_MARKER);
        server.write_all(roster.as_bytes()).await.unwrap();
        let injected = read_text(&mut client).await;
        assert!(injected.contains(&format!("{}<item jid='41c322a1", ROSTER_MARKER)));

        // The chat server drops: the proxy closes the client leg too.
        drop(server);
        let mut buf = [0u8; 1024];
        loop {
            match tokio::time::timeout(WAIT, client.read(&mut buf)).await.expect("client leg left open") {
                Ok(0) | Err(_) => break,
                Ok(_) => continue,
            }
        }
        // Status is saved on every disconnect.
        let saved = tokio::time::timeout(WAIT, async {
            loop {
                if let Ok(s) = std::fs::read_to_string(dir.path().join("status")) {
                    return s;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(saved, "mobile");

        // Second session: fresh injection state, same chat server.
        let mut client = connect_client(proxy_port).await;
        let (tcp, _) = chat_listener.accept().await.unwrap();
        let mut server = chat_acceptor.accept(tcp).await.unwrap();
        server.write_all(roster.as_bytes()).await.unwrap();
        let injected = read_text(&mut client).await;
        assert!(injected.contains("Veil Active!"));

        run.abort();
    }

    #[tokio::test]
    async fn test_cancelled_redial_stops_the_supervisor() {
        // Grab a port with nothing listening on it.
        let closed_port = {
            let l = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
            l.local_addr().unwrap().port()
        };
        let Harness {
            supervisor,
            chat_server,
            _chat_server_tx,
            ..
        } = harness(
            Some(ChatServer {
                host: "127.0.0.1".to_string(),
                port: closed_port,
            }),
            ScriptedPrompt::with_retries(&[true, false]),
        )
        .await;
        let prompt = supervisor.prompt.clone();
        let proxy_port = supervisor.port().unwrap();
        let run = tokio::spawn(supervisor.run(chat_server));

        let _client = connect_client(proxy_port).await;
        let result = tokio::time::timeout(WAIT, run).await.unwrap().unwrap();
        assert!(matches!(result, Err(SetupError::DialCancelled)));
        assert_eq!(prompt.questions_asked(), 2);
    }

    #[tokio::test]
    async fn test_failed_accept_is_not_fatal() {
        init_crypto_provider();
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let acceptor = create_tls_acceptor().unwrap();
        let calls = std::sync::atomic::AtomicUsize::new(0);

        let accept = || {
            let n = calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            let listener = &listener;
            async move {
                if n == 0 {
                    Err(std::io::Error::new(std::io::ErrorKind::Other, "too many open files"))
                } else {
                    listener.accept().await
                }
            }
        };
        let client = tokio::spawn(async move {
            let mut client = connect_client(port).await;
            client.write_all(b"<stream>").await.unwrap();
            client
        });

        let mut leg = tokio::time::timeout(WAIT, accept_tls(accept, &acceptor))
            .await
            .expect("accept loop gave up");
        assert_eq!(read_text(&mut leg).await, "<stream>");
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 2);
        drop(client.await.unwrap());
    }

    #[tokio::test]
    async fn test_chat_server_lookup() {
        let (tx, mut rx) = watch::channel(None);
        let server = ChatServer {
            host: "chat.example".to_string(),
            port: 5223,
        };
        tx.send_replace(Some(server.clone()));
        assert_eq!(wait_for_chat_server(&mut rx).await.unwrap(), server);

        // Config proxy gone before it ever saw a chat server.
        let (tx, mut rx) = watch::channel::<Option<ChatServer>>(None);
        drop(tx);
        assert!(matches!(
            wait_for_chat_server(&mut rx).await,
            Err(SetupError::ChatServerUnknown)
        ));
    }
}
