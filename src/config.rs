//! 엔진 설정

use std::path::PathBuf;

/// PFS 엔진 설정
#[derive(Debug, Clone)]
pub struct Config {
    /// 전역 동시 전송 슬롯 수
    pub slots_max: usize,

    /// 절대 동시 전송 상한 (소형 파일 우회 포함)
    pub hard_slot_cap: usize,

    /// 1인당 동시 전송 수
    pub max_transfers_per_person: usize,

    /// 1인당 대기열 항목 수
    pub max_queued_per_person: usize,

    /// 전역 대기열 크기
    pub queue_size: usize,

    /// 이 크기 미만 파일은 슬롯이 차도 전송 허용 (0이면 비활성)
    pub small_file_bypass: u64,

    /// 전역 기본 최소 전송 속도 (KB/s, 0이면 비활성)
    pub transfer_min_kbs: f32,

    /// 전역 기본 최대 전송 속도 (KB/s, 0이면 무제한)
    pub transfer_max_kbs: f32,

    /// 전역 대역폭 상한 (KB/s, 0이면 무제한)
    pub overall_max_kbs: u32,

    /// 주간 시간대 대역폭 상한 (KB/s)
    pub day_max_kbs: u32,

    /// 주간 상한 시작 시각 (0~23시)
    pub day_start_hour: u32,

    /// 주간 상한 종료 시각 (0~23시)
    pub day_end_hour: u32,

    /// 주간 상한 적용 요일 비트마스크 (bit0 = 일요일)
    pub day_days: u8,

    /// 전송량 한도: [일간, 주간, 월간] (바이트, 0이면 무제한)
    pub transfer_limits: [u64; 3],

    /// 다운로드 허용 호스트마스크 패턴 (비어 있으면 전원 허용)
    pub download_hosts: Vec<String>,

    /// 업로드 허용 호스트마스크 패턴 (비어 있으면 전원 거부)
    pub upload_hosts: Vec<String>,

    /// 알려진 멤버에게만 전송 허용
    pub restrict_send: bool,

    /// 업로드 저장 디렉터리
    pub upload_dir: PathBuf,

    /// 업로드 파일당 최대 크기 (바이트, 0이면 무제한)
    pub upload_max_size: u64,

    /// 수락 가능한 최대 파일 크기 (바이트)
    pub max_file_size: u64,

    /// 동시 업로드 수
    pub max_uploads: usize,

    /// 리슨 포트 범위 (0,0이면 임시 포트)
    pub port_range: (u16, u16),

    /// 리슨 상태 절대 타임아웃 (초)
    pub listen_timeout_secs: u64,

    /// 리슨 중 리마인더 시점 (초)
    pub remind_at: [u64; 3],

    /// 업로드 연결 타임아웃 (초)
    pub connect_timeout_secs: u64,

    /// 세션 유휴 절대 상한 (초)
    pub idle_ceiling_secs: u64,

    /// 속도 측정 안정화 윈도우 (초)
    pub min_measure_secs: u64,

    /// 저대역폭 판정 기준 (KB/s, 0이면 비활성)
    pub low_bandwidth_kbs: u32,

    /// 조용한 모드 (비필수 알림 억제)
    pub quiet_mode: bool,

    /// 제안에 싣는 우리 쪽 IPv4 (u32 표기)
    pub advertised_ip: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            slots_max: 10,
            hard_slot_cap: 50,
            max_transfers_per_person: 1,
            max_queued_per_person: 2,
            queue_size: 20,
            small_file_bypass: 0,          // 비활성
            transfer_min_kbs: 0.0,         // 비활성
            transfer_max_kbs: 0.0,         // 무제한
            overall_max_kbs: 0,            // 무제한
            day_max_kbs: 0,
            day_start_hour: 9,
            day_end_hour: 18,
            day_days: 0b0111110,           // 월~금
            transfer_limits: [0, 0, 0],    // 무제한
            download_hosts: Vec::new(),    // 전원 허용
            upload_hosts: Vec::new(),      // 전원 거부
            restrict_send: false,
            upload_dir: PathBuf::from("uploads"),
            upload_max_size: 0,            // 무제한
            max_file_size: u64::MAX / 2,
            max_uploads: 2,
            port_range: (0, 0),            // 임시 포트
            listen_timeout_secs: 180,
            remind_at: [30, 90, 150],
            connect_timeout_secs: 30,
            idle_ceiling_secs: 180,
            min_measure_secs: 60,
            low_bandwidth_kbs: 0,          // 비활성
            quiet_mode: false,
            advertised_ip: 0x7F00_0001,    // 127.0.0.1
        }
    }
}

impl Config {
    /// 새 설정 생성
    pub fn new() -> Self {
        Self::default()
    }

    /// 대형 공개 사이트용 설정
    pub fn busy_site() -> Self {
        Self {
            slots_max: 30,
            hard_slot_cap: 60,
            max_transfers_per_person: 1,
            max_queued_per_person: 1,
            queue_size: 100,
            small_file_bypass: 512 * 1024,    // 512KB 미만은 우회
            overall_max_kbs: 8192,            // 8MB/s
            transfer_min_kbs: 4.0,
            low_bandwidth_kbs: 1024,
            ..Self::default()
        }
    }

    /// 야간에만 전속력을 내는 회선 공유용 설정
    pub fn daytime_capped() -> Self {
        Self {
            overall_max_kbs: 4096,
            day_max_kbs: 512,                 // 업무 시간에는 512KB/s
            day_start_hour: 8,
            day_end_hour: 19,
            day_days: 0b0111110,              // 월~금
            ..Self::default()
        }
    }

    /// 팩별 유효 최대 속도 계산 (0이면 전역 기본값 상속)
    pub fn effective_max_kbs(&self, pack_max: f32) -> f32 {
        if pack_max > 0.0 {
            pack_max
        } else {
            self.transfer_max_kbs
        }
    }

    /// 팩별 유효 최소 속도 계산
    pub fn effective_min_kbs(&self, pack_min: f32) -> f32 {
        if pack_min > 0.0 {
            pack_min
        } else {
            self.transfer_min_kbs
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_effective_speed_inherit() {
        let mut config = Config::new();
        config.transfer_max_kbs = 100.0;
        config.transfer_min_kbs = 5.0;

        assert_eq!(config.effective_max_kbs(0.0), 100.0);
        assert_eq!(config.effective_max_kbs(30.0), 30.0);
        assert_eq!(config.effective_min_kbs(0.0), 5.0);
        assert_eq!(config.effective_min_kbs(1.0), 1.0);
    }
}
