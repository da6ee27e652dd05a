//! 세션 레지스트리
//!
//! 활성 송신, 활성 업로드, FIFO 대기열 세 컬렉션을 단독 소유한다.
//! 공정성 회전 커서와 세션 id 할당도 여기서 관리한다.

use std::collections::VecDeque;

use crate::pack::PackId;
use crate::transfer::{TransferSession, TransferStatus};
use crate::upload::{UploadSession, UploadStatus};

/// 세션 id 상한 (이 범위 안에서 순환)
const MAX_SESSION_ID: u32 = 1000;

/// 대기열 항목
#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub nick: String,
    pub hostname: String,
    pub pack_id: PackId,
    pub queued_at: u64,
}

/// 표시용 송신 세션 스냅샷
#[derive(Debug, Clone)]
pub struct TransferSnapshot {
    pub id: u32,
    pub nick: String,
    pub pack_id: PackId,
    pub status: &'static str,
    pub bytes_sent: u64,
    pub start_resume: u64,
    pub last_ack: u64,
    pub pack_size: u64,
    pub speed_kbs: f64,
    pub listen_port: u16,
}

/// 표시용 업로드 세션 스냅샷
#[derive(Debug, Clone)]
pub struct UploadSnapshot {
    pub id: u32,
    pub nick: String,
    pub filename: String,
    pub status: &'static str,
    pub bytes_got: u64,
    pub total_size: u64,
    pub speed_kbs: f64,
}

/// 세 컬렉션의 단독 소유자
#[derive(Debug, Default)]
pub struct SessionRegistry {
    pub transfers: Vec<TransferSession>,
    pub uploads: Vec<UploadSession>,
    pub queue: VecDeque<QueueEntry>,
    cursor: usize,
    next_id: u32,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 세션 id 할당: 순환하되 사용 중인 id는 건너뜀
    pub fn alloc_id(&mut self) -> u32 {
        loop {
            self.next_id = self.next_id % MAX_SESSION_ID + 1;
            let id = self.next_id;
            let in_use = self.transfers.iter().any(|t| t.id == id)
                || self.uploads.iter().any(|u| u.id == id);
            if !in_use {
                return id;
            }
        }
    }

    /// 호스트의 활성 송신 수
    pub fn active_for_host(&self, hostname: &str) -> usize {
        self.transfers
            .iter()
            .filter(|t| t.status != TransferStatus::Done && t.hostname == hostname)
            .count()
    }

    /// 호스트가 해당 팩을 이미 받는 중인지
    pub fn host_has_pack_active(&self, hostname: &str, pack_id: PackId) -> bool {
        self.transfers.iter().any(|t| {
            t.status != TransferStatus::Done && t.hostname == hostname && t.pack_id == pack_id
        })
    }

    /// 활성(미수거) 송신 수
    pub fn active_transfers(&self) -> usize {
        self.transfers
            .iter()
            .filter(|t| t.status != TransferStatus::Done)
            .count()
    }

    /// 활성 업로드 수
    pub fn active_uploads(&self) -> usize {
        self.uploads
            .iter()
            .filter(|u| u.status != UploadStatus::Done)
            .count()
    }

    /// 호스트의 대기열 항목 수
    pub fn queued_for_host(&self, hostname: &str) -> usize {
        self.queue.iter().filter(|q| q.hostname == hostname).count()
    }

    /// 호스트가 해당 팩을 이미 대기 중인지
    pub fn host_has_pack_queued(&self, hostname: &str, pack_id: PackId) -> bool {
        self.queue
            .iter()
            .any(|q| q.hostname == hostname && q.pack_id == pack_id)
    }

    /// 공정성 회전: 이번 패스의 시작 인덱스
    ///
    /// 패스마다 한 칸씩 전진해, 어느 세션도 다른 세션이 한 번
    /// 서비스되기 전에 두 번 서비스되지 않는다.
    pub fn rotation_start(&mut self) -> usize {
        let len = self.transfers.len().max(1);
        let start = self.cursor % len;
        self.cursor = self.cursor.wrapping_add(1);
        start
    }

    /// 회전 시작점 기준의 인덱스 순서
    pub fn rotation_order(&mut self) -> Vec<usize> {
        let len = self.transfers.len();
        if len == 0 {
            return Vec::new();
        }
        let start = self.rotation_start();
        (0..len).map(|i| (start + i) % len).collect()
    }

    /// id로 송신 세션 찾기
    pub fn transfer_by_id(&mut self, id: u32) -> Option<&mut TransferSession> {
        self.transfers.iter_mut().find(|t| t.id == id)
    }

    /// Done 송신 세션 수거
    pub fn reap_transfers(&mut self) -> Vec<TransferSession> {
        let mut reaped = Vec::new();
        let mut i = 0;
        while i < self.transfers.len() {
            if self.transfers[i].status == TransferStatus::Done {
                reaped.push(self.transfers.remove(i));
            } else {
                i += 1;
            }
        }
        reaped
    }

    /// Done 업로드 세션 수거
    pub fn reap_uploads(&mut self) -> Vec<UploadSession> {
        let mut reaped = Vec::new();
        let mut i = 0;
        while i < self.uploads.len() {
            if self.uploads[i].status == UploadStatus::Done {
                reaped.push(self.uploads.remove(i));
            } else {
                i += 1;
            }
        }
        reaped
    }

    /// 송신 세션 스냅샷 (표시/검사용)
    pub fn transfer_snapshots(&self, pack_size_of: impl Fn(PackId) -> u64) -> Vec<TransferSnapshot> {
        self.transfers
            .iter()
            .map(|t| TransferSnapshot {
                id: t.id,
                nick: t.nick.clone(),
                pack_id: t.pack_id,
                status: t.status.as_str(),
                bytes_sent: t.bytes_sent,
                start_resume: t.start_resume,
                last_ack: t.last_ack,
                pack_size: pack_size_of(t.pack_id),
                speed_kbs: t.speed.kbs(),
                listen_port: t.listen_port,
            })
            .collect()
    }

    /// 업로드 세션 스냅샷
    pub fn upload_snapshots(&self) -> Vec<UploadSnapshot> {
        self.uploads
            .iter()
            .map(|u| UploadSnapshot {
                id: u.id,
                nick: u.nick.clone(),
                filename: u.filename.clone(),
                status: u.status.as_str(),
                bytes_got: u.bytes_got,
                total_size: u.total_size,
                speed_kbs: u.speed.kbs(),
            })
            .collect()
    }
}
