//! Integration tests for HTTP/2 outbound flow control
//!
//! A scripted h2c server advertises a 1024-byte stream window and either
//! grants more credit after the first kilobyte or never does.

use bytes::{Bytes, BytesMut};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;

use surge_core::{ErrorKind, OpContext, Request, StepIndex};
use surge_protocols::h2::frame::{setting, Frame, FrameHeader, HEADER_LEN, PREFACE};
use surge_protocols::{ClientConfig, DnsCache, Http2Client, ProtocolClient, TlsConnector};

const BODY_LEN: usize = 4096;
const WINDOW: u32 = 1024;

async fn write_frame(sock: &mut TcpStream, frame: Frame) {
    let mut out = BytesMut::new();
    frame.encode(&mut out);
    sock.write_all(&out).await.unwrap();
}

async fn read_frame(sock: &mut TcpStream) -> Option<Frame> {
    let mut head = [0u8; HEADER_LEN];
    sock.read_exact(&mut head).await.ok()?;
    let head = FrameHeader::parse(&head);
    let mut payload = vec![0u8; head.length as usize];
    sock.read_exact(&mut payload).await.ok()?;
    Frame::decode(head, Bytes::from(payload)).ok()
}

/// What the server saw
#[derive(Debug, Default)]
struct Observed {
    before_update: usize,
    total: usize,
}

async fn spawn_server(grant: bool) -> (String, oneshot::Receiver<Observed>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}/upload", listener.local_addr().unwrap());
    let (tx, rx) = oneshot::channel();

    tokio::spawn(async move {
        let (mut sock, _) = listener.accept().await.unwrap();
        write_frame(
            &mut sock,
            Frame::Settings {
                ack: false,
                params: vec![(setting::INITIAL_WINDOW_SIZE, WINDOW)],
            },
        )
        .await;
        let mut preface = [0u8; 24];
        sock.read_exact(&mut preface).await.unwrap();
        assert_eq!(&preface, PREFACE);

        let mut observed = Observed::default();
        let mut updated = false;
        while let Some(frame) = read_frame(&mut sock).await {
            match frame {
                Frame::Settings { ack: false, .. } => {
                    write_frame(
                        &mut sock,
                        Frame::Settings {
                            ack: true,
                            params: Vec::new(),
                        },
                    )
                    .await;
                }
                Frame::Data {
                    data, end_stream, ..
                } => {
                    observed.total += data.len();
                    if end_stream {
                        // :status 200 from the static table
                        write_frame(
                            &mut sock,
                            Frame::Headers {
                                stream_id: 1,
                                block: Bytes::from_static(&[0x88]),
                                end_stream: true,
                                end_headers: true,
                            },
                        )
                        .await;
                        break;
                    }
                }
                _ => {}
            }

            if observed.total >= WINDOW as usize && !updated {
                // Nothing more may arrive while the window is exhausted
                let mut probe = [0u8; 1];
                let extra =
                    tokio::time::timeout(Duration::from_millis(100), sock.peek(&mut probe)).await;
                assert!(extra.is_err(), "client sent past the stream window");
                observed.before_update = observed.total;
                updated = true;
                if grant {
                    write_frame(
                        &mut sock,
                        Frame::WindowUpdate {
                            stream_id: 1,
                            increment: BODY_LEN as u32 - WINDOW,
                        },
                    )
                    .await;
                }
            }
        }
        let _ = tx.send(observed);
        // Keep the socket open until the client is done with it
        tokio::time::sleep(Duration::from_millis(200)).await;
    });

    (url, rx)
}

fn client() -> Http2Client {
    let config = ClientConfig::default();
    let dns = Arc::new(DnsCache::system(config.dns_ttl));
    let tls = TlsConnector::new(false).unwrap();
    Http2Client::new(config, dns, tls)
}

mod flow_control_tests {
    use super::*;

    #[tokio::test]
    async fn test_send_stalls_until_window_update() {
        let (url, observed) = spawn_server(true).await;
        let client = client();
        let req = Request::post(&url, Bytes::from(vec![7u8; BODY_LEN]))
            .unwrap()
            .timeout(Duration::from_secs(5));

        let outcome = client
            .execute(&req, &OpContext::new(StepIndex(0), "upload"))
            .await;
        assert!(outcome.result.is_success(), "{:?}", outcome.result.error);
        assert_eq!(outcome.result.status, Some(200));

        let observed = observed.await.unwrap();
        assert_eq!(observed.before_update, WINDOW as usize);
        assert_eq!(observed.total, BODY_LEN);
    }

    #[tokio::test]
    async fn test_send_without_credit_times_out() {
        let (url, _observed) = spawn_server(false).await;
        let client = client();
        let req = Request::post(&url, Bytes::from(vec![7u8; BODY_LEN]))
            .unwrap()
            .timeout(Duration::from_millis(400));

        let outcome = client
            .execute(&req, &OpContext::new(StepIndex(0), "upload"))
            .await;
        assert_eq!(outcome.result.error_kind(), Some(ErrorKind::Timeout));
        assert!(outcome.response.is_none());
    }
}
