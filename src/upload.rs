//! 수신(업로드) 세션 상태 기계
//!
//! `Connecting → Getting → Waiting → Done`
//!
//! 송신측보다 단순하다: 대기열이 없고, 목적지 파일이 이미 있으면
//! 덮어쓰는 대신 상대에게 재개를 요청한다.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::Path;

use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::config::Config;
use crate::message::ack_to_bytes;
use crate::stats::SpeedMeter;
use crate::MAX_TX_PER_LOOP;

/// 업로드 세션 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadStatus {
    Connecting,
    Getting,
    Waiting,
    Done,
}

impl UploadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UploadStatus::Connecting => "connecting",
            UploadStatus::Getting => "getting",
            UploadStatus::Waiting => "waiting",
            UploadStatus::Done => "done",
        }
    }
}

/// 목적지 파일 준비 결과
#[derive(Debug)]
pub enum Establish {
    /// 파일 준비 완료, 상대에게 연결 시작
    Connect(SocketAddr),

    /// 같은 이름의 미완성 파일 존재: 재개 요청 송신 후 승인 대기
    ResumeRequest { port: u16, offset: u64 },

    /// 수락 불가
    Refused(String),
}

/// 한 번의 수신 서비스 결과
#[derive(Debug, Default)]
pub struct RecvOutcome {
    /// 이번 서비스에서 받은 바이트
    pub got: u64,

    /// 선언된 총 크기에 도달해 Waiting으로 전환됨
    pub reached_total: bool,
}

/// 업로드 세션 하나
#[derive(Debug)]
pub struct UploadSession {
    pub id: u32,

    /// 보내는 쪽 닉/호스트
    pub nick: String,
    pub hostname: String,

    /// 선언된 파일명 (경로 성분 제거 후)
    pub filename: String,

    /// 상대 주소 (제안에 실린 ip/port)
    pub remote_ip: u32,
    pub remote_port: u16,

    /// 선언된 총 크기
    pub total_size: u64,

    /// 누적 수신 바이트
    pub bytes_got: u64,

    /// 재개 시작 오프셋
    pub resume_size: u64,

    /// 상대가 재개를 승인했는지
    pub resume_accepted: bool,

    pub status: UploadStatus,
    pub speed: SpeedMeter,

    pub last_contact: u64,
    pub connect_time: u64,

    /// 목적지 파일
    pub file: Option<File>,

    /// 데이터 소켓
    pub stream: Option<TcpStream>,

    /// 연결 시도 태스크
    pub connect_task: Option<JoinHandle<()>>,
}

impl UploadSession {
    pub fn new(
        id: u32,
        nick: &str,
        hostname: &str,
        filename: &str,
        remote_ip: u32,
        remote_port: u16,
        total_size: u64,
        now: u64,
    ) -> Self {
        // 경로 성분이 섞인 파일명은 마지막 성분만 취한다
        let base = Path::new(filename)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        Self {
            id,
            nick: nick.to_string(),
            hostname: hostname.to_string(),
            filename: base,
            remote_ip,
            remote_port,
            total_size,
            bytes_got: 0,
            resume_size: 0,
            resume_accepted: false,
            status: UploadStatus::Connecting,
            speed: SpeedMeter::new(),
            last_contact: now,
            connect_time: 0,
            file: None,
            stream: None,
            connect_task: None,
        }
    }

    /// 상대 주소
    pub fn remote_addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(
            Ipv4Addr::from(self.remote_ip),
            self.remote_port,
        ))
    }

    /// 목적지 파일 준비
    ///
    /// 최초 수락 시와 재개 승인 수신 시 두 번 불릴 수 있다.
    pub fn establish(&mut self, upload_dir: &Path) -> Establish {
        if self.filename.is_empty() {
            return Establish::Refused("File Error, Invalid filename".into());
        }

        let dest = upload_dir.join(&self.filename);

        match OpenOptions::new().write(true).create_new(true).open(&dest) {
            Ok(file) => {
                self.file = Some(file);
                Establish::Connect(self.remote_addr())
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                let meta = match std::fs::metadata(&dest) {
                    Ok(m) => m,
                    Err(_) => {
                        return Establish::Refused(
                            "File Error, File couldn't be opened for writing".into(),
                        )
                    }
                };

                if !meta.is_file() || meta.len() >= self.total_size {
                    return Establish::Refused(
                        "File Error, That filename already exists".into(),
                    );
                }

                self.resume_size = meta.len();
                self.bytes_got = meta.len();

                if !self.resume_accepted {
                    // 조용히 덮어쓰지 않는다: 상대에게 재개를 제안
                    return Establish::ResumeRequest {
                        port: self.remote_port,
                        offset: meta.len(),
                    };
                }

                match OpenOptions::new().append(true).open(&dest) {
                    Ok(file) => {
                        self.file = Some(file);
                        self.speed.reset_baseline(self.bytes_got);
                        Establish::Connect(self.remote_addr())
                    }
                    Err(_) => Establish::Refused(
                        "File Error, File couldn't be opened for writing".into(),
                    ),
                }
            }
            Err(_) => {
                Establish::Refused("File Error, File couldn't be opened for writing".into())
            }
        }
    }

    /// 연결 완료: Connecting → Getting
    pub fn attach_stream(&mut self, stream: TcpStream, now: u64) {
        if let Some(task) = self.connect_task.take() {
            task.abort();
        }
        self.stream = Some(stream);
        self.status = UploadStatus::Getting;
        self.connect_time = now;
        self.last_contact = now;
        debug!("upload {}: connection established", self.id);
    }

    /// 수신 서비스 한 번: 소켓 읽기 → 파일 쓰기, 누적 ACK 회신
    pub fn service_recv(&mut self, buf: &mut [u8], now: u64) -> std::io::Result<RecvOutcome> {
        let mut outcome = RecvOutcome::default();

        for _ in 0..MAX_TX_PER_LOOP {
            let stream = match self.stream.as_ref() {
                Some(s) => s,
                None => return Ok(outcome),
            };

            match stream.try_read(buf) {
                Ok(0) => {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::ConnectionReset,
                        "peer closed",
                    ));
                }
                Ok(n) => {
                    let file = match self.file.as_mut() {
                        Some(f) => f,
                        None => return Ok(outcome),
                    };
                    file.write_all(&buf[..n])?;
                    self.bytes_got += n as u64;
                    outcome.got += n as u64;
                    self.last_contact = now;
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }

        // 누적 수신량 회신. 소켓이 밀려 있으면 다음 서비스에서 갱신된 값이 나간다
        if let Some(stream) = self.stream.as_ref() {
            let _ = stream.try_write(&ack_to_bytes(self.bytes_got));
        }

        if self.bytes_got >= self.total_size && self.status == UploadStatus::Getting {
            self.status = UploadStatus::Waiting;
            outcome.reached_total = true;
            debug!("upload {}: received all {} bytes", self.id, self.bytes_got);
        }

        Ok(outcome)
    }

    /// 연결 타임아웃 여부
    pub fn connect_timed_out(&self, now: u64, config: &Config) -> bool {
        self.status == UploadStatus::Connecting
            && now.saturating_sub(self.last_contact) > config.connect_timeout_secs
    }

    /// Waiting에서 완료 판정: 짧은 유휴 후 Done
    pub fn check_complete(&mut self, now: u64) -> bool {
        if self.status == UploadStatus::Waiting && now.saturating_sub(self.last_contact) > 1 {
            self.teardown();
            true
        } else {
            false
        }
    }

    /// 유휴 절대 상한 초과 여부 (상태 무관)
    pub fn idle_timed_out(&self, now: u64, config: &Config) -> bool {
        self.status != UploadStatus::Done
            && now.saturating_sub(self.last_contact) > config.idle_ceiling_secs
    }

    /// 이번 업로드로 실제 받은 바이트 (재개분 제외)
    pub fn effective_bytes(&self) -> u64 {
        self.bytes_got.saturating_sub(self.resume_size).max(1)
    }

    /// 소켓/파일/태스크 해제
    pub fn teardown(&mut self) {
        if let Some(task) = self.connect_task.take() {
            task.abort();
        }
        self.stream = None;
        self.file = None;
        self.status = UploadStatus::Done;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upload(filename: &str, total: u64) -> UploadSession {
        UploadSession::new(1, "peer", "host", filename, 0x7F000001, 5000, total, 1000)
    }

    #[test]
    fn test_establish_new_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut ul = upload("incoming.bin", 100);

        match ul.establish(dir.path()) {
            Establish::Connect(addr) => {
                assert_eq!(addr.to_string(), "127.0.0.1:5000");
            }
            other => panic!("unexpected: {:?}", other),
        }
        assert!(dir.path().join("incoming.bin").exists());
    }

    #[test]
    fn test_establish_refuses_complete_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("incoming.bin"), vec![0u8; 100]).unwrap();

        let mut ul = upload("incoming.bin", 100);
        match ul.establish(dir.path()) {
            Establish::Refused(msg) => assert!(msg.contains("already exists")),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_establish_requests_resume_for_partial() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("incoming.bin"), vec![0u8; 40]).unwrap();

        let mut ul = upload("incoming.bin", 100);

        // 먼저 재개를 요청하고 파일은 건드리지 않는다
        match ul.establish(dir.path()) {
            Establish::ResumeRequest { port, offset } => {
                assert_eq!(port, 5000);
                assert_eq!(offset, 40);
            }
            other => panic!("unexpected: {:?}", other),
        }
        assert!(ul.file.is_none());
        assert_eq!(ul.bytes_got, 40);

        // 승인이 오면 append로 다시 연다
        ul.resume_accepted = true;
        match ul.establish(dir.path()) {
            Establish::Connect(_) => {}
            other => panic!("unexpected: {:?}", other),
        }
        assert!(ul.file.is_some());
        assert_eq!(ul.resume_size, 40);
    }

    #[test]
    fn test_filename_path_components_stripped() {
        let ul = upload("../../etc/passwd", 10);
        assert_eq!(ul.filename, "passwd");
    }

    #[test]
    fn test_waiting_completes_after_idle() {
        let mut ul = upload("a.bin", 10);
        ul.status = UploadStatus::Waiting;
        ul.last_contact = 1000;

        assert!(!ul.check_complete(1001));
        assert!(ul.check_complete(1002));
        assert_eq!(ul.status, UploadStatus::Done);
    }

    #[test]
    fn test_idle_ceiling() {
        let config = Config::new();
        let mut ul = upload("a.bin", 10);
        ul.status = UploadStatus::Getting;
        ul.last_contact = 1000;

        assert!(!ul.idle_timed_out(1000 + config.idle_ceiling_secs, &config));
        assert!(ul.idle_timed_out(1000 + config.idle_ceiling_secs + 1, &config));
    }
}
