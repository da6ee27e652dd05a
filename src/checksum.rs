//! 백그라운드 체크섬 빌더
//!
//! 한 번에 팩 하나만, 리액터 반복당 제한된 청크 수만 읽는다.
//! 전송 서비스를 굶기지 않는 것이 목적이라 완주 속도는 중요하지 않다.

use std::fs::File;
use std::io::Read;

use tracing::{info, warn};

use crate::pack::PackId;
use crate::BUFFER_SIZE;

/// 리액터 반복당 허용 읽기 횟수
pub const READS_PER_TICK: usize = 16;

/// 한 스텝의 결과
#[derive(Debug)]
pub enum ChecksumStep {
    /// 아직 읽는 중
    Pending,

    /// 계산 완료
    Done { pack_id: PackId, crc32: u32 },

    /// 읽기 실패, 빌더 폐기
    Failed { pack_id: PackId },
}

/// 진행 중인 체크섬 계산 하나
pub struct ChecksumBuilder {
    pack_id: PackId,
    file: File,
    hasher: crc32fast::Hasher,
    buf: Vec<u8>,
}

impl ChecksumBuilder {
    /// 팩 파일을 열어 계산 시작
    pub fn start(pack_id: PackId, path: &std::path::Path) -> std::io::Result<Self> {
        let file = File::open(path)?;
        info!("[CRC]: calculating pack {}", pack_id);
        Ok(Self {
            pack_id,
            file,
            hasher: crc32fast::Hasher::new(),
            buf: vec![0u8; BUFFER_SIZE],
        })
    }

    pub fn pack_id(&self) -> PackId {
        self.pack_id
    }

    /// 제한된 청크 수만큼 진행
    pub fn step(&mut self) -> ChecksumStep {
        for _ in 0..READS_PER_TICK {
            match self.file.read(&mut self.buf) {
                Ok(0) => {
                    let crc32 = std::mem::take(&mut self.hasher).finalize();
                    info!("[CRC]: pack {} is {:08X}", self.pack_id, crc32);
                    return ChecksumStep::Done {
                        pack_id: self.pack_id,
                        crc32,
                    };
                }
                Ok(n) => {
                    self.hasher.update(&self.buf[..n]);
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("[CRC]: can't read pack {}: {}", self.pack_id, e);
                    return ChecksumStep::Failed {
                        pack_id: self.pack_id,
                    };
                }
            }
        }
        ChecksumStep::Pending
    }
}
