//! 팩 카탈로그
//!
//! - Pack: 제공 파일 하나 (메타데이터 + 파일 정체성 + 공유 읽기 핸들)
//! - PackCatalog: 순서 있는 팩 목록, 번호는 1부터
//!
//! 파일 정체성(dev+inode+mtime+size)이 바뀌면 체크섬도 함께 무효화된다.

use std::fs::File;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Error, Result};
use crate::message::sanitize_send_name;

/// 팩 식별자 (카탈로그에서 제거돼도 재사용되지 않음)
pub type PackId = u64;

/// 파일 정체성: 제자리 수정/교체 감지용
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FileIdent {
    pub dev: u64,
    pub ino: u64,
    pub mtime: i64,
    pub size: u64,
}

impl FileIdent {
    /// 파일시스템에서 정체성 채취
    pub fn probe(path: &Path) -> Result<Self> {
        let meta = std::fs::metadata(path)?;
        Ok(Self {
            dev: meta.dev(),
            ino: meta.ino(),
            mtime: meta.mtime(),
            size: meta.size(),
        })
    }
}

/// 제공 파일 하나
#[derive(Debug)]
pub struct Pack {
    /// 안정 식별자
    pub id: PackId,

    /// 표시 설명
    pub desc: String,

    /// 부가 설명 (비어 있으면 생략)
    pub note: String,

    /// 파일 경로
    pub file: PathBuf,

    /// 파일 크기 (바이트)
    pub size: u64,

    /// 파일 정체성
    pub ident: FileIdent,

    /// 요청 횟수 (인기도)
    pub gets: u64,

    /// 팩별 최소 속도 (KB/s, 0이면 전역 기본값 상속)
    pub min_speed_kbs: f32,

    /// 팩별 최대 속도 (KB/s, 0이면 전역 기본값 상속)
    pub max_speed_kbs: f32,

    /// 내용 체크섬 (백그라운드 계산, None이면 미계산)
    pub checksum: Option<u32>,

    /// 공유 읽기 핸들 (첫 사용자가 열고 마지막 사용자가 닫음)
    handle: Option<Arc<File>>,

    /// 핸들 참조 수
    handle_refs: u32,
}

impl Pack {
    /// 새 팩 생성 (파일 정체성 채취 포함)
    pub fn new(id: PackId, file: PathBuf, desc: String) -> Result<Self> {
        let ident = FileIdent::probe(&file)?;
        Ok(Self {
            id,
            desc,
            note: String::new(),
            size: ident.size,
            ident,
            file,
            gets: 0,
            min_speed_kbs: 0.0,
            max_speed_kbs: 0.0,
            checksum: None,
            handle: None,
            handle_refs: 0,
        })
    }

    /// 와이어 전송용 파일명
    pub fn send_name(&self) -> String {
        let base = self
            .file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.desc.clone());
        sanitize_send_name(&base)
    }

    /// 공유 핸들 획득 (참조 수 증가, 첫 사용자는 파일 오픈)
    pub fn acquire_handle(&mut self) -> Result<Arc<File>> {
        let handle = match &self.handle {
            Some(handle) => Arc::clone(handle),
            None => {
                let file = File::open(&self.file).map_err(|_| Error::PackFileUnavailable {
                    path: self.file.display().to_string(),
                })?;
                let handle = Arc::new(file);
                self.handle = Some(Arc::clone(&handle));
                handle
            }
        };
        self.handle_refs += 1;
        Ok(handle)
    }

    /// 공유 핸들 반환 (참조 수 0이 되면 닫음)
    pub fn release_handle(&mut self) {
        assert!(self.handle_refs > 0, "release_handle without acquire");
        self.handle_refs -= 1;
        if self.handle_refs == 0 {
            self.handle = None;
        }
    }

    /// 핸들이 열려 있는지
    pub fn handle_open(&self) -> bool {
        self.handle.is_some()
    }

    /// 현재 참조 수
    pub fn handle_refs(&self) -> u32 {
        self.handle_refs
    }

    /// 파일 변경 감지. 바뀌었으면 정체성과 체크섬을 함께 갱신/무효화
    pub fn check_file_changed(&mut self) -> bool {
        let fresh = match FileIdent::probe(&self.file) {
            Ok(ident) => ident,
            Err(_) => {
                // 파일이 사라짐: 정체성을 비워 다음 요청이 실패하게 둠
                FileIdent::default()
            }
        };

        if fresh != self.ident {
            info!(
                "pack {} file changed on disk: {} ({} -> {} bytes)",
                self.id,
                self.file.display(),
                self.ident.size,
                fresh.size,
            );
            self.ident = fresh;
            self.size = fresh.size;
            self.checksum = None;
            true
        } else {
            false
        }
    }
}

/// 순서 있는 팩 목록
#[derive(Debug, Default)]
pub struct PackCatalog {
    packs: Vec<Pack>,
    next_id: PackId,
}

impl PackCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// 팩 추가, 부여된 id 반환
    pub fn add(&mut self, file: PathBuf, desc: String) -> Result<PackId> {
        self.next_id += 1;
        let id = self.next_id;
        let pack = Pack::new(id, file, desc)?;
        self.packs.push(pack);
        Ok(id)
    }

    /// 팩 제거 (번호는 1부터). 제거된 팩 반환
    pub fn remove(&mut self, number: usize) -> Option<Pack> {
        if number == 0 || number > self.packs.len() {
            return None;
        }
        Some(self.packs.remove(number - 1))
    }

    /// 번호로 조회 (1부터)
    pub fn by_number(&self, number: usize) -> Option<&Pack> {
        if number == 0 {
            return None;
        }
        self.packs.get(number - 1)
    }

    /// id로 조회
    pub fn by_id(&self, id: PackId) -> Option<&Pack> {
        self.packs.iter().find(|p| p.id == id)
    }

    /// id로 가변 조회
    pub fn by_id_mut(&mut self, id: PackId) -> Option<&mut Pack> {
        self.packs.iter_mut().find(|p| p.id == id)
    }

    /// id의 현재 번호 (1부터)
    pub fn number_of(&self, id: PackId) -> Option<usize> {
        self.packs.iter().position(|p| p.id == id).map(|i| i + 1)
    }

    pub fn len(&self) -> usize {
        self.packs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Pack> {
        self.packs.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Pack> {
        self.packs.iter_mut()
    }

    /// 체크섬이 없는 첫 팩의 id (백그라운드 빌더 스케줄링용)
    pub fn next_unsummed(&self) -> Option<PackId> {
        self.packs
            .iter()
            .find(|p| p.checksum.is_none() && p.ident.ino != 0)
            .map(|p| p.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn temp_pack_file(len: usize) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&vec![0xA5u8; len]).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn test_catalog_numbering() {
        let file_a = temp_pack_file(10);
        let file_b = temp_pack_file(20);

        let mut catalog = PackCatalog::new();
        let id_a = catalog.add(file_a.path().into(), "a".into()).unwrap();
        let id_b = catalog.add(file_b.path().into(), "b".into()).unwrap();

        assert_eq!(catalog.len(), 2);
        assert_eq!(catalog.by_number(1).unwrap().id, id_a);
        assert_eq!(catalog.by_number(2).unwrap().id, id_b);
        assert!(catalog.by_number(0).is_none());
        assert!(catalog.by_number(3).is_none());

        // 앞 팩을 제거하면 번호는 당겨지지만 id는 유지
        catalog.remove(1);
        assert_eq!(catalog.by_number(1).unwrap().id, id_b);
        assert_eq!(catalog.number_of(id_b), Some(1));
        assert!(catalog.by_id(id_a).is_none());
    }

    #[test]
    fn test_shared_handle_refcount() {
        let file = temp_pack_file(100);
        let mut pack = Pack::new(1, file.path().into(), "x".into()).unwrap();

        assert!(!pack.handle_open());

        // M개 획득 후 임의 순서로 반환: 마지막 반환에서만 닫힌다
        let h1 = pack.acquire_handle().unwrap();
        let h2 = pack.acquire_handle().unwrap();
        let h3 = pack.acquire_handle().unwrap();
        assert_eq!(pack.handle_refs(), 3);
        assert!(pack.handle_open());
        drop((h1, h2, h3));

        pack.release_handle();
        assert!(pack.handle_open());
        pack.release_handle();
        assert!(pack.handle_open());
        pack.release_handle();
        assert!(!pack.handle_open());
        assert_eq!(pack.handle_refs(), 0);
    }

    #[test]
    fn test_file_change_invalidates_checksum() {
        let mut file = temp_pack_file(50);
        let mut pack = Pack::new(1, file.path().into(), "x".into()).unwrap();
        pack.checksum = Some(0xDEAD_BEEF);

        assert!(!pack.check_file_changed());
        assert_eq!(pack.checksum, Some(0xDEAD_BEEF));

        // 내용을 덧붙이면 크기/mtime이 달라진다
        file.write_all(b"more").unwrap();
        file.flush().unwrap();

        assert!(pack.check_file_changed());
        assert_eq!(pack.checksum, None);
        assert_eq!(pack.size, 54);
    }

    #[test]
    fn test_send_name_sanitized() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("my file.bin");
        std::fs::write(&path, b"data").unwrap();

        let pack = Pack::new(1, path, "desc".into()).unwrap();
        assert_eq!(pack.send_name(), "my_file.bin");
    }
}
