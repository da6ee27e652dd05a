//! 엔진 종단 간 테스트
//!
//! 실제 루프백 소켓으로 제안 → 연결 → 전송 → ACK → 완료 흐름을 돌린다.

use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::timeout;

use pfs::message::{ack_to_bytes, Dcc};
use pfs::{ChatEvent, Config, Engine, PackCatalog};

const PACK_SIZE: usize = 1_048_576;

fn patterned(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

fn write_pack(dir: &std::path::Path, name: &str, data: &[u8]) -> PathBuf {
    let path = dir.join(name);
    let mut file = std::fs::File::create(&path).unwrap();
    file.write_all(data).unwrap();
    file.flush().unwrap();
    path
}

async fn next_event(rx: &mut UnboundedReceiver<ChatEvent>) -> ChatEvent {
    timeout(Duration::from_secs(15), rx.recv())
        .await
        .expect("no chat event within 15s")
        .expect("chat channel closed")
}

/// 이벤트 스트림에서 조건을 만족하는 첫 이벤트를 기다림
async fn wait_for(
    rx: &mut UnboundedReceiver<ChatEvent>,
    mut pred: impl FnMut(&ChatEvent) -> bool,
) -> ChatEvent {
    loop {
        let event = next_event(rx).await;
        if pred(&event) {
            return event;
        }
    }
}

fn offer_from(event: &ChatEvent) -> (String, u16, u64) {
    let text = match event {
        ChatEvent::Ctcp { text, .. } => text,
        other => panic!("expected ctcp offer, got {:?}", other),
    };
    match Dcc::parse(text) {
        Some(Dcc::Send {
            name, port, size, ..
        }) => (name, port, size),
        other => panic!("expected DCC SEND, got {:?}", other),
    }
}

#[tokio::test]
async fn full_transfer_reaches_done() {
    let dir = tempfile::tempdir().unwrap();
    let data = patterned(PACK_SIZE);
    write_pack(dir.path(), "big_pack.bin", &data);

    let mut catalog = PackCatalog::new();
    catalog
        .add(dir.path().join("big_pack.bin"), "big_pack.bin".into())
        .unwrap();

    let config = Config::new();
    let (engine, handle, mut chat_rx, _persist_rx) = Engine::new(config, catalog);
    tokio::spawn(engine.run());

    handle.request_transfer("leecher", "leech.host", "leecher!u@leech.host", 1, None);

    // 수락 알림과 제안
    let notice = next_event(&mut chat_rx).await;
    match &notice {
        ChatEvent::Notice { text, .. } => {
            assert!(text.contains("Sending you pack #1"), "{}", text);
            assert!(text.contains("resume supported"));
        }
        other => panic!("expected notice, got {:?}", other),
    }
    let (name, port, size) = offer_from(&next_event(&mut chat_rx).await);
    assert_eq!(name, "big_pack.bin");
    assert_eq!(size, PACK_SIZE as u64);

    // 데이터 연결 + 드레인 + ACK
    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let mut received = Vec::with_capacity(PACK_SIZE);
    let mut chunk = vec![0u8; 64 * 1024];

    while received.len() < PACK_SIZE {
        let n = timeout(Duration::from_secs(15), stream.read(&mut chunk))
            .await
            .expect("read stalled")
            .unwrap();
        assert!(n > 0, "peer closed early at {} bytes", received.len());
        received.extend_from_slice(&chunk[..n]);
        stream
            .write_all(&ack_to_bytes(received.len() as u64))
            .await
            .unwrap();
    }

    assert_eq!(received.len(), PACK_SIZE);
    assert_eq!(received, data);

    // 완료 알림
    let done = wait_for(&mut chat_rx, |e| {
        matches!(e, ChatEvent::Notice { text, .. } if text.contains("Transfer Completed"))
    })
    .await;
    match done {
        ChatEvent::Notice { nick, .. } => assert_eq!(nick, "leecher"),
        _ => unreachable!(),
    }

    // 세션 수거 후 통계 반영 (스냅샷은 1초 주기 발행)
    let mut done_seen = false;
    for _ in 0..30 {
        if handle.stats().completed_transfers == 1 && handle.transfers().is_empty() {
            done_seen = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(300)).await;
    }
    assert!(done_seen, "session not reaped");
    assert_eq!(handle.stats().total_sent, PACK_SIZE as u64);

    handle.shutdown();
}

#[tokio::test]
async fn resume_transfer_sends_remainder_only() {
    let dir = tempfile::tempdir().unwrap();
    let data = patterned(PACK_SIZE);
    write_pack(dir.path(), "resume_pack.bin", &data);

    let mut catalog = PackCatalog::new();
    catalog
        .add(dir.path().join("resume_pack.bin"), "resume_pack.bin".into())
        .unwrap();

    let (engine, handle, mut chat_rx, _persist_rx) = Engine::new(Config::new(), catalog);
    tokio::spawn(engine.run());

    handle.request_transfer("dl", "dl.host", "dl!u@dl.host", 1, None);
    let offer = wait_for(&mut chat_rx, |e| matches!(e, ChatEvent::Ctcp { .. })).await;
    let (name, port, size) = offer_from(&offer);

    // 파일 끝 이상의 재개는 거부되고 세션은 그대로
    handle.resume_request("dl", &name, port, size);
    let rejected = wait_for(&mut chat_rx, |e| matches!(e, ChatEvent::Notice { .. })).await;
    match &rejected {
        ChatEvent::Notice { text, .. } => {
            assert!(text.contains("can't resume"), "{}", text);
        }
        _ => unreachable!(),
    }

    // 유효한 오프셋은 ACCEPT로 응답
    let offset = (PACK_SIZE / 2) as u64;
    handle.resume_request("dl", &name, port, offset);
    let accept = wait_for(&mut chat_rx, |e| matches!(e, ChatEvent::Ctcp { .. })).await;
    match accept {
        ChatEvent::Ctcp { text, .. } => match Dcc::parse(&text) {
            Some(Dcc::Accept {
                port: ack_port,
                offset: ack_offset,
                ..
            }) => {
                assert_eq!(ack_port, port);
                assert_eq!(ack_offset, offset);
            }
            other => panic!("expected DCC ACCEPT, got {:?}", other),
        },
        _ => unreachable!(),
    }

    // 연결하면 나머지 절반만 내려온다
    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let expect = PACK_SIZE - offset as usize;
    let mut received = Vec::with_capacity(expect);
    let mut chunk = vec![0u8; 64 * 1024];

    while received.len() < expect {
        let n = timeout(Duration::from_secs(15), stream.read(&mut chunk))
            .await
            .expect("read stalled")
            .unwrap();
        assert!(n > 0, "peer closed early at {} bytes", received.len());
        received.extend_from_slice(&chunk[..n]);
        stream
            .write_all(&ack_to_bytes(offset + received.len() as u64))
            .await
            .unwrap();
    }

    assert_eq!(received.len(), expect);
    assert_eq!(received, data[offset as usize..]);

    // EOF 뒤에 더 오지 않는지 (연결이 완료 수순으로 닫힘)
    let trailing = timeout(Duration::from_secs(10), stream.read(&mut chunk)).await;
    match trailing {
        Ok(Ok(0)) => {}
        Ok(Ok(n)) => panic!("{} unexpected trailing bytes", n),
        Ok(Err(_)) => {}
        Err(_) => panic!("connection not closed after completion"),
    }

    wait_for(&mut chat_rx, |e| {
        matches!(e, ChatEvent::Notice { text, .. } if text.contains("Transfer Completed"))
    })
    .await;

    handle.shutdown();
}

#[tokio::test]
async fn upload_receives_file_and_acks() {
    let dir = tempfile::tempdir().unwrap();
    let upload_dir = dir.path().join("incoming");
    std::fs::create_dir_all(&upload_dir).unwrap();

    let mut config = Config::new();
    config.upload_dir = upload_dir.clone();
    config.upload_hosts = vec!["*!*@*".into()];

    let (engine, handle, mut chat_rx, _persist_rx) = Engine::new(config, PackCatalog::new());
    tokio::spawn(engine.run());

    // 시험용 "상대": 엔진이 이쪽으로 연결해 들어온다
    let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let total: usize = 200_000;
    let payload = patterned(total);

    handle.accept_upload(
        "uploader",
        "up.host",
        "uploader!u@up.host",
        "drop.bin",
        0x7F00_0001,
        port,
        total as u64,
    );

    wait_for(&mut chat_rx, |e| {
        matches!(e, ChatEvent::Notice { text, .. } if text.contains("Connecting"))
    })
    .await;

    let (mut stream, _) = timeout(Duration::from_secs(15), listener.accept())
        .await
        .expect("engine never connected")
        .unwrap();

    wait_for(&mut chat_rx, |e| {
        matches!(e, ChatEvent::Notice { text, .. } if text.contains("Connection Established"))
    })
    .await;

    stream.write_all(&payload).await.unwrap();
    stream.flush().await.unwrap();

    // 누적 ACK가 선언한 총량까지 올라온다
    let mut ack = [0u8; 4];
    let deadline = std::time::Instant::now() + Duration::from_secs(15);
    loop {
        timeout(Duration::from_secs(15), stream.read_exact(&mut ack))
            .await
            .expect("no ack")
            .unwrap();
        if u32::from_be_bytes(ack) as usize >= total {
            break;
        }
        assert!(std::time::Instant::now() < deadline, "acks stalled");
    }

    wait_for(&mut chat_rx, |e| {
        matches!(e, ChatEvent::Notice { text, .. } if text.contains("Upload Completed"))
    })
    .await;

    // 목적지 파일 내용 일치
    let mut written = None;
    for _ in 0..30 {
        let bytes = std::fs::read(upload_dir.join("drop.bin")).unwrap();
        if bytes.len() == total {
            written = Some(bytes);
            break;
        }
        tokio::time::sleep(Duration::from_millis(300)).await;
    }
    assert_eq!(written.expect("upload file incomplete"), payload);

    handle.shutdown();
}

#[tokio::test]
async fn listen_timeout_closes_unclaimed_offer() {
    let dir = tempfile::tempdir().unwrap();
    write_pack(dir.path(), "small.bin", &patterned(4096));

    let mut catalog = PackCatalog::new();
    catalog
        .add(dir.path().join("small.bin"), "small.bin".into())
        .unwrap();

    let mut config = Config::new();
    // 테스트가 기다릴 수 있게 사다리를 앞당긴다
    config.remind_at = [1, 2, 3];
    config.listen_timeout_secs = 4;

    let (engine, handle, mut chat_rx, _persist_rx) = Engine::new(config, catalog);
    tokio::spawn(engine.run());

    handle.request_transfer("ghost", "ghost.host", "ghost!u@ghost.host", 1, None);
    let _ = wait_for(&mut chat_rx, |e| matches!(e, ChatEvent::Ctcp { .. })).await;

    // 연결하지 않으면 리마인더가 오고, 끝내 타임아웃으로 닫힌다
    wait_for(&mut chat_rx, |e| {
        matches!(e, ChatEvent::Notice { text, .. } if text.contains("DCC pending"))
    })
    .await;

    let closed = wait_for(&mut chat_rx, |e| {
        matches!(e, ChatEvent::Notice { text, .. } if text.contains("Closing Connection"))
    })
    .await;
    match closed {
        ChatEvent::Notice { text, .. } => assert!(text.contains("timed out"), "{}", text),
        _ => unreachable!(),
    }

    handle.shutdown();
}
