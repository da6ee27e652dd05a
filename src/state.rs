//! 상태 스냅샷 코덱
//!
//! 엔진은 변이 후와 다분 주기로 스냅샷을 bincode로 인코딩해 저장 훅으로
//! 내보낸다. 어디에 쓸지는 바깥 계층의 일이고, 여기서는 페이로드만 만든다.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::warn;

use crate::error::Result;
use crate::governor::{LimitWindow, TransferLimits};
use crate::pack::PackCatalog;
use crate::stats::GlobalStats;

/// 팩 하나의 영속 레코드
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackRecord {
    pub file: PathBuf,
    pub desc: String,
    pub note: String,
    pub gets: u64,
    pub min_speed_kbs: f32,
    pub max_speed_kbs: f32,
    pub checksum: Option<u32>,
}

/// 저장 스냅샷 전체
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SavedState {
    pub packs: Vec<PackRecord>,
    pub limits: [LimitWindow; 3],
    pub total_sent: u64,
    pub record_kbs: f64,
    pub sent_record_kbs: f64,
}

impl SavedState {
    /// 현재 상태에서 스냅샷 채집
    pub fn collect(catalog: &PackCatalog, limits: &TransferLimits, stats: &GlobalStats) -> Self {
        Self {
            packs: catalog
                .iter()
                .map(|p| PackRecord {
                    file: p.file.clone(),
                    desc: p.desc.clone(),
                    note: p.note.clone(),
                    gets: p.gets,
                    min_speed_kbs: p.min_speed_kbs,
                    max_speed_kbs: p.max_speed_kbs,
                    checksum: p.checksum,
                })
                .collect(),
            limits: limits.windows.clone(),
            total_sent: stats.total_sent,
            record_kbs: stats.record_kbs,
            sent_record_kbs: stats.sent_record_kbs,
        }
    }

    /// bincode 인코딩
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// bincode 디코딩
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }

    /// 스냅샷에서 카탈로그 복원
    ///
    /// 파일 정체성은 다시 채취한다. 사라진 파일의 팩은 건너뛴다.
    /// 체크섬은 정체성이 살아 있을 때만 물려받는다 (변경 시 20초 스캔이
    /// 어차피 무효화하지만, 기동 직후 잘못된 값을 광고하지 않기 위함).
    pub fn restore_catalog(&self) -> PackCatalog {
        let mut catalog = PackCatalog::new();
        for record in &self.packs {
            match catalog.add(record.file.clone(), record.desc.clone()) {
                Ok(id) => {
                    if let Some(pack) = catalog.by_id_mut(id) {
                        pack.note = record.note.clone();
                        pack.gets = record.gets;
                        pack.min_speed_kbs = record.min_speed_kbs;
                        pack.max_speed_kbs = record.max_speed_kbs;
                        pack.checksum = record.checksum;
                    }
                }
                Err(e) => {
                    warn!("pack {} skipped on restore: {}", record.file.display(), e);
                }
            }
        }
        catalog
    }

    /// 스냅샷에서 한도 카운터 복원
    pub fn restore_limits(&self) -> TransferLimits {
        let mut limits = TransferLimits::new([
            self.limits[0].limit,
            self.limits[1].limit,
            self.limits[2].limit,
        ]);
        for (window, saved) in limits.windows.iter_mut().zip(self.limits.iter()) {
            window.used = saved.used;
            window.ends = saved.ends;
        }
        limits
    }
}
