//! 송신 세션 상태 기계
//!
//! `Listening → Sending → Waiting → Done`
//!
//! - Listening: 리슨 소켓으로 상대의 데이터 연결을 기다림 (리마인더/타임아웃)
//! - Sending: 쓰기 가능 시 공유 팩 핸들에서 오프셋 읽기 → 소켓 쓰기, ACK 드레인
//! - Waiting: EOF 후 마지막 ACK/플러시 대기
//! - Done: 다음 리액터 패스에서 레지스트리가 수거

use std::fs::File;
use std::os::unix::fs::FileExt;
use std::sync::Arc;

use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::config::Config;
use crate::governor::TxBucket;
use crate::message::ack_from_bytes;
use crate::pack::PackId;
use crate::stats::SpeedMeter;
use crate::MAX_TX_PER_LOOP;

/// 송신 세션 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Listening,
    Sending,
    Waiting,
    Done,
}

impl TransferStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferStatus::Listening => "listening",
            TransferStatus::Sending => "sending",
            TransferStatus::Waiting => "waiting",
            TransferStatus::Done => "done",
        }
    }
}

/// 한 번의 송신 서비스 결과
#[derive(Debug, Default)]
pub struct ServiceOutcome {
    /// 이번 서비스에서 쓴 바이트
    pub wrote: u64,

    /// 파일 끝에 도달해 Waiting으로 전환됨
    pub reached_eof: bool,
}

/// 송신 세션 하나
#[derive(Debug)]
pub struct TransferSession {
    /// 세션 id (동시 활성 세션 간 유일, 해제 후에만 재사용)
    pub id: u32,

    /// 요청자 표시 닉
    pub nick: String,

    /// 정규화된 닉 (대문자)
    pub nick_caps: String,

    /// 요청자 호스트네임
    pub hostname: String,

    /// 참조하는 팩
    pub pack_id: PackId,

    /// 상태
    pub status: TransferStatus,

    /// 누적 송신 바이트 (재개 오프셋 포함)
    pub bytes_sent: u64,

    /// 상대가 마지막으로 확인한 바이트
    pub last_ack: u64,

    /// 재개 시작 오프셋
    pub start_resume: u64,

    /// 평활화 속도
    pub speed: SpeedMeter,

    /// 팩별 송신 예산
    pub bucket: TxBucket,

    /// 관리자 속도 캡 해제
    pub no_max: bool,

    /// 보낸 리마인더 수
    pub reminders_sent: u8,

    /// 리슨 포트
    pub listen_port: u16,

    /// 마지막 활동 시각 (epoch 초)
    pub last_contact: u64,

    /// 연결 수립 시각 (epoch 초, 0이면 미연결)
    pub connect_time: u64,

    /// Waiting 진입 시각
    pub eof_time: u64,

    /// 공유 팩 핸들
    pub file: Option<Arc<File>>,

    /// 데이터 소켓 (연결 후)
    pub stream: Option<TcpStream>,

    /// 리슨 수락 태스크
    pub listen_task: Option<JoinHandle<()>>,

    /// ACK 4바이트 조립 버퍼
    ack_partial: Vec<u8>,
}

impl TransferSession {
    pub fn new(id: u32, nick: &str, hostname: &str, pack_id: PackId, now: u64) -> Self {
        Self {
            id,
            nick: nick.to_string(),
            nick_caps: nick.to_uppercase(),
            hostname: hostname.to_string(),
            pack_id,
            status: TransferStatus::Listening,
            bytes_sent: 0,
            last_ack: 0,
            start_resume: 0,
            speed: SpeedMeter::new(),
            bucket: TxBucket::new(),
            no_max: false,
            reminders_sent: 0,
            listen_port: 0,
            last_contact: now,
            connect_time: 0,
            eof_time: 0,
            file: None,
            stream: None,
            listen_task: None,
            ack_partial: Vec::with_capacity(4),
        }
    }

    /// 재개 협상: 오프셋 검증 후 시작점 설정. 수락 여부 반환
    ///
    /// Listening 상태에서만 유효. 파일 끝 이상의 오프셋은 거부.
    pub fn set_resume(&mut self, offset: u64, pack_size: u64) -> bool {
        if self.status != TransferStatus::Listening || offset >= pack_size {
            return false;
        }
        self.start_resume = offset;
        self.bytes_sent = offset;
        self.last_ack = offset;
        self.speed.reset_baseline(offset);
        true
    }

    /// 상대가 연결해 들어옴: Listening → Sending
    pub fn attach_peer(&mut self, stream: TcpStream, now: u64) {
        if let Some(task) = self.listen_task.take() {
            task.abort();
        }
        self.stream = Some(stream);
        self.status = TransferStatus::Sending;
        self.connect_time = now;
        self.last_contact = now;
        debug!("transfer {}: peer connected, sending from {}", self.id, self.bytes_sent);
    }

    /// 송신 서비스 한 번
    ///
    /// 버킷이 허락하는 동안 최대 `MAX_TX_PER_LOOP` 버퍼를 쓴다.
    /// `throttled`가 거짓이면 (팩 maxspeed 0 또는 no_max) 버킷을 무시한다.
    pub fn service_send(
        &mut self,
        pack_size: u64,
        throttled: bool,
        buf: &mut [u8],
        now: u64,
    ) -> std::io::Result<ServiceOutcome> {
        let mut outcome = ServiceOutcome::default();

        let file = match self.file.as_ref() {
            Some(f) => Arc::clone(f),
            None => return Ok(outcome),
        };

        for _ in 0..MAX_TX_PER_LOOP {
            if throttled && !self.bucket.ready() {
                break;
            }

            let remaining = pack_size.saturating_sub(self.bytes_sent);
            if remaining == 0 {
                break;
            }
            let want = (buf.len() as u64).min(remaining) as usize;

            let got = file.read_at(&mut buf[..want], self.bytes_sent)?;
            if got == 0 {
                // 카탈로그 크기보다 파일이 짧음: 팩이 제자리에서 줄어든 경우
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "pack file truncated",
                ));
            }

            let stream = match self.stream.as_ref() {
                Some(s) => s,
                None => return Ok(outcome),
            };

            match stream.try_write(&buf[..got]) {
                Ok(written) => {
                    self.bytes_sent += written as u64;
                    outcome.wrote += written as u64;
                    if throttled {
                        self.bucket.consume(written as u64);
                    }
                    self.last_contact = now;
                    if written < got {
                        // 소켓 버퍼가 참: 이번 서비스는 여기까지
                        break;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }

        if self.bytes_sent >= pack_size && self.status == TransferStatus::Sending {
            self.status = TransferStatus::Waiting;
            self.eof_time = now;
            outcome.reached_eof = true;
            debug!("transfer {}: eof at {} bytes", self.id, self.bytes_sent);
        }

        Ok(outcome)
    }

    /// 상대가 보내는 ACK/역압 신호 드레인
    ///
    /// 프로토콜상 ACK는 누적 바이트의 32비트 big-endian이다.
    pub fn drain_acks(&mut self, now: u64) -> std::io::Result<()> {
        let stream = match self.stream.as_ref() {
            Some(s) => s,
            None => return Ok(()),
        };

        let mut chunk = [0u8; 512];
        loop {
            match stream.try_read(&mut chunk) {
                Ok(0) => {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::ConnectionReset,
                        "peer closed",
                    ));
                }
                Ok(n) => {
                    self.last_contact = now;
                    for &b in &chunk[..n] {
                        self.ack_partial.push(b);
                        if self.ack_partial.len() == 4 {
                            let raw = [
                                self.ack_partial[0],
                                self.ack_partial[1],
                                self.ack_partial[2],
                                self.ack_partial[3],
                            ];
                            self.ack_partial.clear();
                            let acked = ack_from_bytes(raw) as u64;
                            if acked > self.last_ack && acked <= self.bytes_sent {
                                self.last_ack = acked;
                            }
                        }
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) => return Err(e),
            }
        }
    }

    /// Waiting에서 플러시 완료 판정: 완료면 Done 전환 후 true
    ///
    /// 마지막 ACK가 파일을 덮거나, EOF 후 짧은 유휴가 지나면 완료로 본다.
    pub fn check_flushed(&mut self, now: u64) -> bool {
        if self.status != TransferStatus::Waiting {
            return false;
        }

        let acked_all = self.last_ack >= self.bytes_sent;
        let idled_out = now > self.eof_time + 1;

        if acked_all || idled_out {
            self.status = TransferStatus::Done;
            true
        } else {
            false
        }
    }

    /// 다음 리마인더 시점 도달 여부 (Listening 전용)
    pub fn remind_due(&self, now: u64, config: &Config) -> bool {
        if self.status != TransferStatus::Listening {
            return false;
        }
        let stage = self.reminders_sent as usize;
        stage < config.remind_at.len()
            && now.saturating_sub(self.last_contact) >= config.remind_at[stage]
    }

    /// 리슨 타임아웃 여부
    pub fn listen_timed_out(&self, now: u64, config: &Config) -> bool {
        self.status == TransferStatus::Listening
            && now.saturating_sub(self.last_contact) >= config.listen_timeout_secs
    }

    /// 유휴 상한 초과 여부 (연결 이후 상태 전용)
    pub fn idle_timed_out(&self, now: u64, config: &Config) -> bool {
        matches!(
            self.status,
            TransferStatus::Sending | TransferStatus::Waiting
        ) && now.saturating_sub(self.last_contact) > config.idle_ceiling_secs
    }

    /// 연결 초기 측정 구간 여부 (EWMA 가중치 선택용)
    pub fn in_initial_window(&self, now: u64, config: &Config) -> bool {
        self.connect_time + config.min_measure_secs / 2 > now
    }

    /// 최소 속도 위반 판정 (측정 윈도우 경과 후에만)
    pub fn below_min_speed(&self, now: u64, min_kbs: f32, config: &Config) -> bool {
        min_kbs > 0.0
            && self.status == TransferStatus::Sending
            && self.connect_time != 0
            && now.saturating_sub(self.connect_time) > config.min_measure_secs
            && self.speed.kbs() < min_kbs as f64
    }

    /// 소켓/태스크 해제. 팩 핸들 반환은 엔진이 수행
    pub fn teardown(&mut self) {
        if let Some(task) = self.listen_task.take() {
            task.abort();
        }
        self.stream = None;
        self.file = None;
        self.status = TransferStatus::Done;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> TransferSession {
        TransferSession::new(1, "peer", "host.example.com", 1, 1000)
    }

    #[test]
    fn test_resume_validation() {
        let mut tr = session();

        // 파일 끝 이상은 거부되고 세션은 불변
        assert!(!tr.set_resume(2048, 2048));
        assert!(!tr.set_resume(9999, 2048));
        assert_eq!(tr.bytes_sent, 0);
        assert_eq!(tr.start_resume, 0);

        // 유효 오프셋은 시작점을 일치시킨다
        assert!(tr.set_resume(1024, 2048));
        assert_eq!(tr.start_resume, 1024);
        assert_eq!(tr.bytes_sent, 1024);
        assert_eq!(tr.last_ack, 1024);
    }

    #[test]
    fn test_resume_only_while_listening() {
        let mut tr = session();
        tr.status = TransferStatus::Sending;
        assert!(!tr.set_resume(10, 2048));
    }

    #[test]
    fn test_reminder_ladder() {
        let config = Config::new();
        let mut tr = session();
        let start = tr.last_contact;

        assert!(!tr.remind_due(start + 29, &config));
        assert!(tr.remind_due(start + 30, &config));
        tr.reminders_sent = 1;

        assert!(!tr.remind_due(start + 60, &config));
        assert!(tr.remind_due(start + 90, &config));
        tr.reminders_sent = 2;

        assert!(tr.remind_due(start + 150, &config));
        tr.reminders_sent = 3;

        // 리마인더를 다 쓰면 더는 없음
        assert!(!tr.remind_due(start + 500, &config));
        assert!(tr.listen_timed_out(start + 180, &config));
    }

    #[test]
    fn test_flushed_on_full_ack() {
        let mut tr = session();
        tr.status = TransferStatus::Waiting;
        tr.bytes_sent = 1000;
        tr.eof_time = 2000;

        tr.last_ack = 999;
        assert!(!tr.check_flushed(2000));

        tr.last_ack = 1000;
        assert!(tr.check_flushed(2000));
        assert_eq!(tr.status, TransferStatus::Done);
    }

    #[test]
    fn test_flushed_on_idle() {
        let mut tr = session();
        tr.status = TransferStatus::Waiting;
        tr.bytes_sent = 1000;
        tr.last_ack = 0;
        tr.eof_time = 2000;

        assert!(!tr.check_flushed(2001));
        assert!(tr.check_flushed(2002));
    }

    #[test]
    fn test_min_speed_grace_window() {
        let config = Config::new();
        let mut tr = session();
        tr.status = TransferStatus::Sending;
        tr.connect_time = 1000;

        // 측정 윈도우 안에서는 느려도 봐준다
        assert!(!tr.below_min_speed(1000 + config.min_measure_secs, 10.0, &config));

        // 윈도우가 지나면 평활화 속도 0은 위반
        assert!(tr.below_min_speed(1000 + config.min_measure_secs + 1, 10.0, &config));

        // 최소 속도 0이면 비활성
        assert!(!tr.below_min_speed(1000 + config.min_measure_secs + 1, 0.0, &config));
    }
}
