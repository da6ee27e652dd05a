//! 대역폭 거버너
//!
//! - 전역: 1초 버킷 링으로 최근 4초 송신량을 상한과 비교 (overlimit)
//! - 팩별: 쿼터초마다 충전되는 토큰 버킷 + 버스트 상한
//! - 한도: 일간/주간/월간 전송량 윈도우와 리셋 경계 계산

use chrono::{DateTime, Datelike, Duration as ChronoDuration, Local, TimeZone};
use serde::{Deserialize, Serialize};

use crate::{OVERLIMIT_SPAN, SENT_WINDOW, TX_BURST_SECONDS};

/// 전역 송신 윈도우 (1초 단위 링 버퍼)
#[derive(Debug, Clone, Default)]
pub struct SentWindow {
    buckets: [u64; SENT_WINDOW],
}

impl SentWindow {
    pub fn new() -> Self {
        Self::default()
    }

    /// 현재 초 버킷에 송신량 기록
    pub fn record(&mut self, now_sec: u64, bytes: u64) {
        self.buckets[(now_sec as usize) % SENT_WINDOW] += bytes;
    }

    /// 초가 바뀔 때 다음 버킷을 비움
    pub fn rotate(&mut self, now_sec: u64) {
        self.buckets[(now_sec as usize + 1) % SENT_WINDOW] = 0;
    }

    /// 최근 `OVERLIMIT_SPAN`초 합산 바이트
    pub fn recent(&self, now_sec: u64) -> u64 {
        (0..OVERLIMIT_SPAN)
            .map(|back| {
                self.buckets[(now_sec as usize + SENT_WINDOW - back) % SENT_WINDOW]
            })
            .sum()
    }

    /// 최근 합산 대역폭 (KB/s)
    pub fn recent_kbs(&self, now_sec: u64) -> f64 {
        self.recent(now_sec) as f64 / OVERLIMIT_SPAN as f64 / 1024.0
    }

    /// 전역 상한 도달 여부. `max_kbs == 0`이면 무제한
    pub fn over_limit(&self, now_sec: u64, max_kbs: u32) -> bool {
        max_kbs != 0 && self.recent(now_sec) >= max_kbs as u64 * 1024 * OVERLIMIT_SPAN as u64
    }
}

/// 시간대/요일 기반 전역 상한 스케줄
#[derive(Debug, Clone)]
pub struct RateSchedule {
    /// 기본 상한 (KB/s, 0이면 무제한)
    pub base_kbs: u32,

    /// 주간 시간대 상한 (KB/s)
    pub day_kbs: u32,

    /// 주간 상한 시작/종료 시각
    pub day_start_hour: u32,
    pub day_end_hour: u32,

    /// 적용 요일 비트마스크 (bit0 = 일요일)
    pub day_days: u8,
}

impl RateSchedule {
    /// 현재 시각의 유효 상한 계산
    pub fn current_max_kbs(&self, now: DateTime<Local>) -> u32 {
        use chrono::Timelike;

        if self.day_kbs == 0 || self.day_kbs == self.base_kbs {
            return self.base_kbs;
        }

        let hour = now.hour();
        let wday_bit = 1u8 << now.weekday().num_days_from_sunday();

        if hour >= self.day_start_hour
            && hour < self.day_end_hour
            && (self.day_days & wday_bit) != 0
        {
            self.day_kbs
        } else {
            self.base_kbs
        }
    }
}

/// 팩별 토큰 버킷
///
/// 쿼터초마다 `max_kbs * 1024 / 4` 바이트씩 충전되고,
/// `TX_BURST_SECONDS`초 분량을 상한으로 한다. 마지막 쓰기의 초과분만큼
/// 음수로 내려갈 수 있다.
#[derive(Debug, Clone, Default)]
pub struct TxBucket {
    level: i64,
}

impl TxBucket {
    pub fn new() -> Self {
        Self::default()
    }

    /// 쿼터초 충전
    pub fn refill(&mut self, max_kbs: f32) {
        if max_kbs <= 0.0 {
            return;
        }
        let cap = (TX_BURST_SECONDS as f64 * max_kbs as f64 * 1024.0) as i64;
        self.level = (self.level + (max_kbs as f64 * 1024.0 / 4.0) as i64).min(cap);
    }

    /// 송신량 차감
    pub fn consume(&mut self, bytes: u64) {
        self.level -= bytes as i64;
    }

    /// 송신 가능 여부
    pub fn ready(&self) -> bool {
        self.level > 0
    }

    /// 남은 예산 (바이트)
    pub fn level(&self) -> i64 {
        self.level
    }
}

/// 전송량 한도 윈도우 종류
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitKind {
    Daily = 0,
    Weekly = 1,
    Monthly = 2,
}

impl LimitKind {
    pub const ALL: [LimitKind; 3] = [LimitKind::Daily, LimitKind::Weekly, LimitKind::Monthly];

    pub fn label(&self) -> &'static str {
        match self {
            LimitKind::Daily => "daily",
            LimitKind::Weekly => "weekly",
            LimitKind::Monthly => "monthly",
        }
    }

    /// 이 윈도우의 다음 리셋 시각 (자정 경계)
    pub fn next_end(&self, now: DateTime<Local>) -> i64 {
        let today = now.date_naive();

        let end_date = match self {
            LimitKind::Daily => today + ChronoDuration::days(1),
            LimitKind::Weekly => {
                // 다음 일요일 자정 (오늘이 일요일이면 7일 뒤)
                let ahead = 7 - now.weekday().num_days_from_sunday() as i64;
                today + ChronoDuration::days(ahead)
            }
            LimitKind::Monthly => {
                let (year, month) = if today.month() == 12 {
                    (today.year() + 1, 1)
                } else {
                    (today.year(), today.month() + 1)
                };
                chrono::NaiveDate::from_ymd_opt(year, month, 1)
                    .unwrap_or(today + ChronoDuration::days(31))
            }
        };

        let midnight = end_date.and_hms_opt(0, 0, 0).unwrap_or_default();
        match Local.from_local_datetime(&midnight).earliest() {
            Some(dt) => dt.timestamp(),
            // DST 경계 등으로 자정이 없는 날은 하루 뒤로 미룸
            None => now.timestamp() + 86_400,
        }
    }
}

/// 한도 윈도우 하나
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LimitWindow {
    /// 한도 (바이트, 0이면 무제한)
    pub limit: u64,

    /// 윈도우 내 사용량
    pub used: u64,

    /// 윈도우 종료 시각 (epoch 초, 0이면 미계산)
    pub ends: i64,
}

/// 한도 스윕 결과
#[derive(Debug, Default)]
pub struct LimitSweep {
    /// 방금 리셋된 윈도우
    pub resets: Vec<LimitKind>,

    /// 이번 스윕에서 처음 한도 초과로 전환됨
    pub just_exceeded: Option<LimitKind>,

    /// 이번 스윕에서 한도 초과 상태가 해제됨
    pub just_cleared: bool,
}

/// 일간/주간/월간 전송량 한도
#[derive(Debug, Clone, Default)]
pub struct TransferLimits {
    pub windows: [LimitWindow; 3],
    over: bool,
}

impl TransferLimits {
    pub fn new(limits: [u64; 3]) -> Self {
        let mut windows: [LimitWindow; 3] = Default::default();
        for (window, limit) in windows.iter_mut().zip(limits) {
            window.limit = limit;
        }
        Self {
            windows,
            over: false,
        }
    }

    /// 송신량 기록 (모든 윈도우에 가산)
    pub fn record(&mut self, bytes: u64) {
        for window in &mut self.windows {
            window.used += bytes;
        }
    }

    /// 현재 한도 초과 상태
    pub fn is_over(&self) -> bool {
        self.over
    }

    /// 1초 주기 스윕: 만료 윈도우 리셋, 초과 상태 전환 감지
    pub fn sweep(&mut self, now: DateTime<Local>) -> LimitSweep {
        let mut result = LimitSweep::default();
        let now_epoch = now.timestamp();

        for kind in LimitKind::ALL {
            let window = &mut self.windows[kind as usize];
            if window.ends == 0 || window.ends < now_epoch {
                if window.limit != 0 && window.ends != 0 {
                    result.resets.push(kind);
                }
                window.ends = kind.next_end(now);
                window.used = 0;
            }
        }

        let over_now = self.binding_kind().is_some();
        if over_now && !self.over {
            result.just_exceeded = self.binding_kind();
        } else if !over_now && self.over {
            result.just_cleared = true;
        }
        self.over = over_now;

        result
    }

    /// 현재 소진된 윈도우 (가장 짧은 주기 우선)
    fn binding_kind(&self) -> Option<LimitKind> {
        LimitKind::ALL.into_iter().find(|&kind| {
            let window = &self.windows[kind as usize];
            window.limit != 0 && window.used >= window.limit
        })
    }

    /// 거부 알림 텍스트 (소진된 윈도우의 리셋 시각 포함)
    pub fn deny_message(&self) -> Option<String> {
        let kind = self.binding_kind()?;
        let window = &self.windows[kind as usize];
        let resets = Local
            .timestamp_opt(window.ends, 0)
            .earliest()
            .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "later".into());

        Some(format!(
            "** Sorry, I have exceeded my {} transfer limit of {}MB. Try again after {}.",
            kind.label(),
            window.limit / 1024 / 1024,
            resets,
        ))
    }
}
