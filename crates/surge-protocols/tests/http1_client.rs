//! Integration tests for the HTTP/1.1 and UDP clients
//!
//! Every test runs against loopback servers bound to ephemeral ports.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use rustls::pki_types::{CertificateDer, PrivatePkcs8KeyDer};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, UdpSocket};
use tokio_rustls::TlsAcceptor;

use surge_core::{ErrorKind, OpContext, Request, StepIndex};
use surge_protocols::{ClientConfig, DnsCache, Http1Client, ProtocolClient, TlsConnector, UdpClient};

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Read one request head (and its sized body); `None` once the peer closes
async fn read_request<S: AsyncRead + Unpin>(sock: &mut S, buf: &mut Vec<u8>) -> Option<String> {
    loop {
        if let Some(pos) = find(buf, b"\r\n\r\n") {
            let head = String::from_utf8_lossy(&buf[..pos]).to_string();
            let body_len = head
                .lines()
                .find_map(|l| {
                    let (name, value) = l.split_once(':')?;
                    name.eq_ignore_ascii_case("content-length")
                        .then(|| value.trim().parse::<usize>().ok())?
                })
                .unwrap_or(0);
            while buf.len() < pos + 4 + body_len {
                let mut tmp = [0u8; 4096];
                let n = sock.read(&mut tmp).await.ok()?;
                if n == 0 {
                    return None;
                }
                buf.extend_from_slice(&tmp[..n]);
            }
            buf.drain(..pos + 4 + body_len);
            return Some(head);
        }
        let mut tmp = [0u8; 4096];
        let n = sock.read(&mut tmp).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&tmp[..n]);
    }
}

/// Keep-alive server answering each request head with `handler`
async fn spawn_server<F>(handler: F) -> SocketAddr
where
    F: Fn(&str) -> String + Send + Sync + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handler = Arc::new(handler);
    tokio::spawn(async move {
        while let Ok((mut sock, _)) = listener.accept().await {
            let handler = handler.clone();
            tokio::spawn(async move {
                let mut buf = Vec::new();
                while let Some(head) = read_request(&mut sock, &mut buf).await {
                    let reply = handler(&head);
                    if sock.write_all(reply.as_bytes()).await.is_err() {
                        break;
                    }
                }
            });
        }
    });
    addr
}

/// Self-signed acceptor for `localhost`, offering http/1.1
fn tls_acceptor() -> TlsAcceptor {
    let cert = rcgen::generate_simple_self_signed(vec!["localhost".into()]).unwrap();
    let cert_der = CertificateDer::from(cert.serialize_der().unwrap());
    let key_der = PrivatePkcs8KeyDer::from(cert.get_key_pair().serialize_der());
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let mut config = rustls::ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_no_client_auth()
        .with_single_cert(vec![cert_der], key_der.into())
        .unwrap();
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    TlsAcceptor::from(Arc::new(config))
}

/// TLS keep-alive server answering every request with `body`
async fn spawn_tls_server(body: &'static str) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let acceptor = tls_acceptor();
    tokio::spawn(async move {
        while let Ok((tcp, _)) = listener.accept().await {
            let acceptor = acceptor.clone();
            tokio::spawn(async move {
                let Ok(mut sock) = acceptor.accept(tcp).await else {
                    return;
                };
                let mut buf = Vec::new();
                while read_request(&mut sock, &mut buf).await.is_some() {
                    if sock.write_all(ok(body).as_bytes()).await.is_err() {
                        break;
                    }
                    if sock.flush().await.is_err() {
                        break;
                    }
                }
            });
        }
    });
    addr
}

fn ok(body: &str) -> String {
    format!("HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n{body}", body.len())
}

fn redirect(location: &str) -> String {
    format!("HTTP/1.1 302 Found\r\nLocation: {location}\r\nContent-Length: 0\r\n\r\n")
}

fn client(config: ClientConfig) -> Http1Client {
    let dns = Arc::new(DnsCache::system(config.dns_ttl));
    let tls = TlsConnector::new(config.insecure_tls).unwrap();
    Http1Client::new(config, dns, tls)
}

fn ctx() -> OpContext {
    OpContext::new(StepIndex(0), "it")
}

mod http1_tests {
    use super::*;

    #[tokio::test]
    async fn test_simple_get_and_connection_reuse() {
        let addr = spawn_server(|_| ok("hello")).await;
        let client = client(ClientConfig::default());
        let req = Request::get(&format!("http://{addr}/")).unwrap();

        let first = client.execute(&req, &ctx()).await;
        assert!(first.result.is_success(), "{:?}", first.result.error);
        assert_eq!(first.result.status, Some(200));
        assert_eq!(&first.response.unwrap().body[..], b"hello");
        assert_eq!(first.result.connects, 1);
        assert!(first.result.bytes_received > 0);
        assert!(first.result.phases.is_monotone());

        let second = client.execute(&req, &ctx()).await;
        assert!(second.result.is_success());
        assert_eq!(second.result.connects, 0);
        assert_eq!(client.pool().stats().reuses, 1);
    }

    #[tokio::test]
    async fn test_redirect_to_other_origin_dials_twice() {
        let target = spawn_server(|_| ok("final")).await;
        let location = format!("http://{target}/final");
        let origin = spawn_server(move |_| redirect(&location)).await;

        let client = client(ClientConfig::default());
        let req = Request::get(&format!("http://{origin}/start")).unwrap();
        let outcome = client.execute(&req, &ctx()).await;

        assert!(outcome.result.is_success(), "{:?}", outcome.result.error);
        assert_eq!(outcome.result.redirects, 1);
        assert_eq!(outcome.result.connects, 2);
        assert!(outcome.result.url.ends_with("/final"));
        assert_eq!(&outcome.response.unwrap().body[..], b"final");
    }

    #[tokio::test]
    async fn test_redirect_budget_zero_returns_3xx() {
        let addr = spawn_server(|_| redirect("/elsewhere")).await;
        let client = client(ClientConfig::default());
        let req = Request::get(&format!("http://{addr}/")).unwrap().redirects(0);
        let outcome = client.execute(&req, &ctx()).await;
        assert_eq!(outcome.result.status, Some(302));
        assert!(outcome.result.error.is_none());
    }

    #[tokio::test]
    async fn test_redirect_loop_exhausts_budget() {
        let addr = spawn_server(|_| redirect("/loop")).await;
        let client = client(ClientConfig::default());
        let req = Request::get(&format!("http://{addr}/loop")).unwrap();
        let outcome = client.execute(&req, &ctx()).await;

        assert_eq!(outcome.result.error_kind(), Some(ErrorKind::Protocol));
        assert_eq!(outcome.result.redirects, 3);
        assert!(outcome.response.is_none());
    }

    #[tokio::test]
    async fn test_https_upgrade_against_plaintext_listener_fails_connect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            // First connection gets the upgrade redirect; later ones are
            // dropped before any TLS handshake can finish
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            if read_request(&mut sock, &mut buf).await.is_some() {
                let reply = redirect(&format!("https://{addr}/secure"));
                sock.write_all(reply.as_bytes()).await.unwrap();
            }
            while let Ok((sock, _)) = listener.accept().await {
                drop(sock);
            }
        });

        let config = ClientConfig {
            insecure_tls: true,
            connect_timeout: Duration::from_millis(500),
            ..ClientConfig::default()
        };
        let client = client(config);
        let req = Request::get(&format!("http://{addr}/")).unwrap();
        let outcome = client.execute(&req, &ctx()).await;

        assert_eq!(outcome.result.error_kind(), Some(ErrorKind::Connect));
        assert_eq!(outcome.result.redirects, 1);
        assert!(outcome.result.url.starts_with("https://"));
    }

    #[tokio::test]
    async fn test_https_upgrade_completes_over_tls() {
        let secure = spawn_tls_server("secure").await;
        let location = format!("https://{secure}/secure");
        let origin = spawn_server(move |_| redirect(&location)).await;

        let config = ClientConfig {
            insecure_tls: true,
            ..ClientConfig::default()
        };
        let client = client(config);
        let req = Request::get(&format!("http://{origin}/")).unwrap();
        let outcome = client.execute(&req, &ctx()).await;

        assert!(outcome.result.is_success(), "{:?}", outcome.result.error);
        assert_eq!(outcome.result.status, Some(200));
        assert_eq!(outcome.result.redirects, 1);
        assert_eq!(outcome.result.connects, 2);
        assert!(outcome.result.connect_time > Duration::ZERO);
        assert!(outcome.result.url.starts_with("https://"));
        assert_eq!(&outcome.response.unwrap().body[..], b"secure");
    }

    #[tokio::test]
    async fn test_oversized_chunk_size_is_protocol_error() {
        let addr = spawn_server(|_| {
            "HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n1\r\na\r\nffffffffffffffff\r\n"
                .to_string()
        })
        .await;
        let client = client(ClientConfig::default());
        let req = Request::get(&format!("http://{addr}/")).unwrap();
        let outcome = client.execute(&req, &ctx()).await;

        assert_eq!(outcome.result.error_kind(), Some(ErrorKind::Protocol));
        assert!(outcome.response.is_none());
    }

    #[tokio::test]
    async fn test_cancellation_yields_cancelled() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (sock, _) = listener.accept().await.unwrap();
            // Hold the socket open without answering
            tokio::time::sleep(Duration::from_secs(30)).await;
            drop(sock);
        });

        let client = client(ClientConfig::default());
        let req = Request::get(&format!("http://{addr}/slow")).unwrap();
        let ctx = ctx();
        let cancel = ctx.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        });
        let outcome = client.execute(&req, &ctx).await;
        assert_eq!(outcome.result.error_kind(), Some(ErrorKind::Cancelled));
        assert!(outcome.result.latency() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_request_timeout() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (sock, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
            drop(sock);
        });

        let client = client(ClientConfig::default());
        let req = Request::get(&format!("http://{addr}/"))
            .unwrap()
            .timeout(Duration::from_millis(100));
        let outcome = client.execute(&req, &ctx()).await;
        assert_eq!(outcome.result.error_kind(), Some(ErrorKind::Timeout));
    }
}

mod udp_tests {
    use super::*;

    async fn spawn_echo() -> SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 2048];
            while let Ok((n, peer)) = socket.recv_from(&mut buf).await {
                let _ = socket.send_to(&buf[..n], peer).await;
            }
        });
        addr
    }

    fn udp_client() -> UdpClient {
        let config = ClientConfig::default();
        let dns = Arc::new(DnsCache::system(config.dns_ttl));
        UdpClient::new(config, dns)
    }

    #[tokio::test]
    async fn test_echo_round_trip() {
        let addr = spawn_echo().await;
        let client = udp_client();
        let req = Request::post(&format!("udp://{addr}"), "ping").unwrap();

        let outcome = client.execute(&req, &ctx()).await;
        assert!(outcome.result.is_success(), "{:?}", outcome.result.error);
        assert_eq!(outcome.result.bytes_sent, 4);
        assert_eq!(outcome.result.bytes_received, 4);
        assert_eq!(&outcome.response.unwrap().body[..], b"ping");

        let again = client.execute(&req, &ctx()).await;
        assert!(again.result.is_success());
        assert_eq!(again.result.connects, 0);
    }

    #[tokio::test]
    async fn test_fire_and_forget() {
        let addr = spawn_echo().await;
        let client = udp_client();
        let req = Request::post(&format!("udp://{addr}"), "event")
            .unwrap()
            .no_reply();
        let outcome = client.execute(&req, &ctx()).await;
        assert!(outcome.result.is_success());
        assert_eq!(outcome.result.bytes_received, 0);
        assert_eq!(outcome.result.status, None);
    }
}
