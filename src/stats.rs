//! 전송 통계

use std::time::Duration;

/// 초기(변동성 큰) 구간의 EWMA 가중치
pub const SPEED_WEIGHT_INITIAL: f64 = 0.5;

/// 안정 구간의 EWMA 가중치
pub const SPEED_WEIGHT_ONGOING: f64 = 0.86;

/// 평활화 속도 측정기
///
/// ~4초 주기로 호출된다. 연결 직후 절반 윈도우 동안은 가파른 가중치로
/// 빠르게 수렴하고, 이후에는 완만한 가중치로 안정된 추정을 유지한다.
#[derive(Debug, Clone, Default)]
pub struct SpeedMeter {
    /// 평활화된 속도 (KB/s)
    kbs: f64,

    /// 직전 측정 시점의 누적 바이트
    last_amount: u64,
}

impl SpeedMeter {
    pub fn new() -> Self {
        Self::default()
    }

    /// 측정 갱신
    ///
    /// `total_bytes`는 세션 누적 바이트, `dt`는 직전 측정 이후 경과,
    /// `initial`은 연결 초기 구간 여부.
    pub fn update(&mut self, total_bytes: u64, dt: Duration, initial: bool) {
        let dt_secs = dt.as_secs_f64();
        if dt_secs <= 0.0 {
            return;
        }

        let weight = if initial {
            SPEED_WEIGHT_INITIAL
        } else {
            SPEED_WEIGHT_ONGOING
        };

        let delta_kb = total_bytes.saturating_sub(self.last_amount) as f64 / 1024.0;
        self.kbs = self.kbs * weight + (delta_kb / dt_secs) * (1.0 - weight);
        self.last_amount = total_bytes;
    }

    /// 재개 시작 오프셋 등 측정 기준점 재설정
    pub fn reset_baseline(&mut self, total_bytes: u64) {
        self.last_amount = total_bytes;
        self.kbs = 0.0;
    }

    /// 현재 평활화 속도 (KB/s)
    pub fn kbs(&self) -> f64 {
        self.kbs
    }
}

/// 전역 누적 통계
#[derive(Debug, Clone, Default)]
pub struct GlobalStats {
    /// 기동 이후 총 송신 바이트
    pub total_sent: u64,

    /// 단일 세션 최고 속도 기록 (KB/s)
    pub record_kbs: f64,

    /// 합산 대역폭 최고 기록 (KB/s)
    pub sent_record_kbs: f64,

    /// 완료된 전송 수
    pub completed_transfers: u64,

    /// 완료된 업로드 수
    pub completed_uploads: u64,

    /// 가동 시간 (초)
    pub uptime_secs: u64,
}

impl GlobalStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// 세션 속도로 기록 갱신
    pub fn note_session_speed(&mut self, kbs: f64) {
        if kbs > self.record_kbs {
            self.record_kbs = kbs;
        }
    }

    /// 합산 대역폭으로 기록 갱신
    pub fn note_aggregate_speed(&mut self, kbs: f64) {
        if kbs > self.sent_record_kbs {
            self.sent_record_kbs = kbs;
        }
    }

    /// 통계 요약 문자열
    pub fn summary(&self) -> String {
        format!(
            "Uptime: {}h{}m | Sent: {:.1} MB | Xfers: {} | Record: {:.1} KB/s",
            self.uptime_secs / 3600,
            (self.uptime_secs % 3600) / 60,
            self.total_sent as f64 / 1_048_576.0,
            self.completed_transfers,
            self.record_kbs,
        )
    }
}
